use log::info;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::adapters::broker::BrokerConnector;
use crate::core::codec::{build_request, unpack_response, validate_outputs};
use crate::core::job::{InputName, OutputName};
use crate::core::rpc::RpcClient;
use crate::core::settings::Settings;
use crate::error::Result;

/// One fast-trainer run: where the images are, how to train, where the models go.
#[derive(Debug, Clone)]
pub struct TrainingJob {
    pub inputs: BTreeMap<InputName, PathBuf>,
    pub settings: Settings,
    pub outputs: BTreeMap<OutputName, PathBuf>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutcome {
    pub models: Vec<PathBuf>,
    pub elapsed: Duration,
}

pub trait Trainable {
    fn train(&self, job: &TrainingJob) -> impl std::future::Future<Output = Result<TrainingOutcome>>;
}

pub struct HpcTrainer<C: BrokerConnector> {
    client: RpcClient<C>,
}

impl<C: BrokerConnector> HpcTrainer<C> {
    pub fn new(client: RpcClient<C>) -> Self {
        Self { client }
    }
}

impl<C: BrokerConnector> Trainable for HpcTrainer<C> {
    async fn train(&self, job: &TrainingJob) -> Result<TrainingOutcome> {
        let started = std::time::Instant::now();
        validate_outputs(&job.outputs)?;
        let request = build_request(&job.inputs, &job.settings).await?;
        let response = self.client.call(&request, job.timeout).await?;
        let models = unpack_response(&response, &job.outputs).await?;

        let elapsed = started.elapsed();
        info!("Training finished in {:?}; {} models written", elapsed, models.len());
        Ok(TrainingOutcome { models, elapsed })
    }
}
