use log::{error, info};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::codec::write_artifact;
use crate::core::job::OutputName;
use crate::error::{OutputFailure, Result, TrainerError};

/// Writes every decoded artifact to its destination. A failed write does not
/// stop the others; all failures come back together in one `Outputs` error.
pub async fn materialize(
    artifacts: Vec<(OutputName, Vec<u8>)>,
    outputs: &BTreeMap<OutputName, PathBuf>,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(artifacts.len());
    let mut failures = Vec::new();

    for (name, bytes) in artifacts {
        let Some(destination) = outputs.get(&name) else {
            failures.push(OutputFailure {
                output: name.to_string(),
                error: TrainerError::Validation(format!("no destination for '{}'", name)),
            });
            continue;
        };

        match write_one(&bytes, destination).await {
            Ok(()) => {
                info!("Wrote {} ({} bytes) to {:?}", name, bytes.len(), destination);
                written.push(destination.clone());
            }
            Err(e) => {
                error!("Failed to write {}: {}", name, e);
                failures.push(OutputFailure {
                    output: name.to_string(),
                    error: e,
                });
            }
        }
    }

    if failures.is_empty() {
        Ok(written)
    } else {
        Err(TrainerError::Outputs(failures))
    }
}

async fn write_one(bytes: &[u8], destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TrainerError::io(parent, e))?;
    }
    write_artifact(bytes, destination).await
}
