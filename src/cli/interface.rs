use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::time::Duration;

use crate::adapters::amqp::AmqpConnector;
use crate::adapters::broker::ReplyStrategy;
use crate::core::job::{InputName, OutputName};
use crate::core::rpc::{RpcClient, RpcOptions, DEFAULT_WORK_QUEUE};
use crate::core::settings::*;
use crate::core::train::{HpcTrainer, Trainable, TrainingJob};
use crate::utils::config::BrokerConfig;
use crate::utils::lib::*;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Original RGB page image
    #[clap(long, value_parser)]
    pub image: PathBuf,

    /// RGBA background layer
    #[clap(long, value_parser)]
    pub background: PathBuf,

    /// RGBA music symbol layer
    #[clap(long, value_parser)]
    pub music_layer: PathBuf,

    /// RGBA staff lines layer
    #[clap(long, value_parser)]
    pub staff_layer: PathBuf,

    /// RGBA text layer
    #[clap(long, value_parser)]
    pub text: PathBuf,

    /// RGBA selected regions mask
    #[clap(long, value_parser)]
    pub selected_regions: PathBuf,

    #[clap(short, long, value_parser)]
    pub output_dir: Option<PathBuf>,

    #[clap(long, default_value = "10")]
    pub epochs: i64,

    #[clap(long, default_value = "256")]
    pub patch_height: i64,

    #[clap(long, default_value = "256")]
    pub patch_width: i64,

    #[clap(long)]
    pub max_samples_per_label: Option<i64>,

    /// Slurm wall time limit, D-HH:MM
    #[clap(long)]
    pub max_time: Option<String>,

    #[clap(long)]
    pub max_memory_mb: Option<i64>,

    #[clap(long)]
    pub cpus: Option<i64>,

    #[clap(long)]
    pub notification_email: Option<String>,

    /// Seconds to wait for the cluster to answer
    #[clap(long, default_value = "86400")]
    pub timeout: u64,

    /// Milliseconds between polls of the reply queue
    #[clap(long, default_value = "1000")]
    pub poll_interval: u64,

    #[clap(long, default_value = DEFAULT_WORK_QUEUE)]
    pub work_queue: String,

    /// Wait on a shared, well-known reply queue instead of a per-call one
    #[clap(long)]
    pub shared_reply_queue: Option<String>,

    /// Times to resubmit the whole job after a timeout
    #[clap(long, default_value = "0")]
    pub retries: u32,
}

impl Args {
    pub fn inputs(&self) -> BTreeMap<InputName, PathBuf> {
        BTreeMap::from([
            (InputName::Image, self.image.clone()),
            (InputName::Background, self.background.clone()),
            (InputName::MusicLayer, self.music_layer.clone()),
            (InputName::StaffLayer, self.staff_layer.clone()),
            (InputName::Text, self.text.clone()),
            (InputName::SelectedRegions, self.selected_regions.clone()),
        ])
    }

    pub fn settings(&self) -> Settings {
        let mut settings = default_settings();
        settings.insert(MAX_EPOCHS.to_string(), self.epochs.into());
        settings.insert(PATCH_HEIGHT.to_string(), self.patch_height.into());
        settings.insert(PATCH_WIDTH.to_string(), self.patch_width.into());

        let optional = [
            (MAX_SAMPLES_PER_LABEL, self.max_samples_per_label.map(SettingValue::from)),
            (MAX_TIME, self.max_time.clone().map(SettingValue::from)),
            (MAX_MEMORY_MB, self.max_memory_mb.map(SettingValue::from)),
            (CPUS, self.cpus.map(SettingValue::from)),
            (NOTIFICATION_EMAIL, self.notification_email.clone().map(SettingValue::from)),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                settings.insert(name.to_string(), value);
            }
        }
        settings
    }

    pub fn rpc_options(&self) -> RpcOptions {
        let reply = match &self.shared_reply_queue {
            Some(name) => ReplyStrategy::Shared(name.clone()),
            None => ReplyStrategy::Dedicated,
        };
        RpcOptions::default()
            .with_work_queue(self.work_queue.clone())
            .with_reply(reply)
            .with_poll_interval(Duration::from_millis(self.poll_interval))
    }
}

pub async fn run_cli_interface() -> Result<()> {
    let args = Args::parse();
    let config = BrokerConfig::from_env().context("Invalid broker configuration")?;
    let connector = AmqpConnector::new(config).context("Invalid broker configuration")?;
    let trainer = HpcTrainer::new(RpcClient::new(connector, args.rpc_options()));

    let job = prepare_job(&args)?;
    info!(
        "Submitting training job to queue '{}' (timeout {:?})",
        args.work_queue, job.timeout
    );

    let spinner = create_spinner("Waiting for the HPC cluster to train the models")
        .context("Failed to create progress spinner")?;
    let outcome = retry(
        args.retries,
        Duration::from_secs(30),
        |e| e.is_retryable(),
        || trainer.train(&job),
    )
    .await;
    spinner.finish_and_clear();

    match outcome {
        Ok(outcome) => {
            println!("Training finished in {:?}.", outcome.elapsed);
            for model in &outcome.models {
                println!("  {}", model.display());
            }
            Ok(())
        }
        Err(e) => {
            error!("Training job failed with {}: {}", e.kind(), e);
            Err(e).with_context(|| "HPC training job failed".to_string())
        }
    }
}

fn prepare_job(args: &Args) -> Result<TrainingJob> {
    let output_dir = get_output_dir(args.output_dir.clone())
        .context("Failed to create output directory")?;
    let outputs = OutputName::ALL
        .into_iter()
        .map(|name| (name, output_dir.join(name.file_name())))
        .collect();

    Ok(TrainingJob {
        inputs: args.inputs(),
        settings: args.settings(),
        outputs,
        timeout: Duration::from_secs(args.timeout),
    })
}
