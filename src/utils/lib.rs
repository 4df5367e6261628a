use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use std::fs::create_dir_all;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tokio::time::{sleep, Duration};

use crate::error::{Result, TrainerError};

/// Resolves the directory the trained models are written to, creating it if needed.
/// Without an explicit directory a timestamped one under `./output` is used.
pub fn get_output_dir(output_arg: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match output_arg {
        Some(path) => path,
        None => Path::new("./output").join(Local::now().format("%Y%m%d_%H%M%S").to_string()),
    };
    create_dir_all(&dir).map_err(|e| TrainerError::io(&dir, e))?;
    Ok(dir)
}

pub fn create_spinner(message: &str) -> Result<ProgressBar, io::Error> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

/// Runs `task` again after a failure for which `should_retry` holds, doubling
/// the delay each time. Other failures are returned straight away.
pub async fn retry<F, Fut, T, R>(
    max_retries: u32,
    initial_delay: Duration,
    should_retry: R,
    mut task: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: Fn(&TrainerError) -> bool,
{
    let mut retries = 0;
    let mut delay = initial_delay;

    loop {
        match task().await {
            Ok(result) => return Ok(result),
            Err(e) if retries >= max_retries || !should_retry(&e) => return Err(e),
            Err(e) => {
                warn!("Attempt {} failed: {}. Retrying in {:?}...", retries + 1, e, delay);
                sleep(delay).await;
                retries += 1;
                delay *= 2; // Exponential backoff
            }
        }
    }
}
