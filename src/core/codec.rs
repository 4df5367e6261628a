use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::try_join_all;
use log::{debug, info};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::job::{InputName, JobRequest, JobResponse, OutputName};
use crate::core::materializer::materialize;
use crate::core::settings::{validate_settings, Settings};
use crate::error::{Result, TrainerError};

/// Reads the whole file and returns it as base64 text.
pub async fn encode(file_path: impl AsRef<Path>) -> Result<String> {
    let file_path = file_path.as_ref();
    let content = tokio::fs::read(file_path)
        .await
        .map_err(|e| TrainerError::io(file_path, e))?;
    debug!("Encoded {:?} ({} bytes)", file_path, content.len());
    Ok(STANDARD.encode(content))
}

pub fn decode_payload(encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| TrainerError::Decode(format!("invalid base64 payload: {}", e)))
}

/// Writes `bytes` to `destination`, replacing whatever was there.
pub async fn write_artifact(bytes: &[u8], destination: impl AsRef<Path>) -> Result<()> {
    let destination = destination.as_ref();
    tokio::fs::write(destination, bytes)
        .await
        .map_err(|e| TrainerError::io(destination, e))
}

/// Decodes base64 text and writes the exact bytes to `destination_path`.
/// Nothing is written if the text is not valid base64.
pub async fn decode(encoded: &str, destination_path: impl AsRef<Path>) -> Result<()> {
    let bytes = decode_payload(encoded)?;
    write_artifact(&bytes, destination_path).await
}

pub async fn build_request(
    inputs: &BTreeMap<InputName, PathBuf>,
    settings: &Settings,
) -> Result<JobRequest> {
    if let Some(missing) = InputName::ALL.iter().find(|name| !inputs.contains_key(name)) {
        return Err(TrainerError::Validation(format!(
            "missing required input '{}' (port '{}')",
            missing,
            missing.port_name()
        )));
    }
    validate_settings(settings)?;

    let encoded = try_join_all(inputs.iter().map(|(name, path)| async move {
        let text = encode(path).await?;
        Ok::<_, TrainerError>((name.as_str().to_string(), text))
    }))
    .await?;

    info!(
        "Built job request with {} inputs and {} settings",
        encoded.len(),
        settings.len()
    );
    Ok(JobRequest::new(encoded.into_iter().collect(), settings.clone()))
}

/// Every output needs a destination before a job is worth submitting.
pub fn validate_outputs(outputs: &BTreeMap<OutputName, PathBuf>) -> Result<()> {
    match OutputName::ALL.iter().find(|name| !outputs.contains_key(name)) {
        Some(missing) => Err(TrainerError::Validation(format!(
            "no destination given for output '{}'",
            missing
        ))),
        None => Ok(()),
    }
}

/// Validates and decodes every output before any file is touched, then hands
/// the artifacts to the materializer.
pub async fn unpack_response(
    response: &JobResponse,
    outputs: &BTreeMap<OutputName, PathBuf>,
) -> Result<Vec<PathBuf>> {
    validate_outputs(outputs)?;

    let mut artifacts = Vec::with_capacity(OutputName::ALL.len());
    for name in OutputName::ALL {
        let encoded = response.artifact(name).ok_or_else(|| {
            TrainerError::Validation(format!("response is missing output '{}'", name))
        })?;
        let bytes = decode_payload(encoded).map_err(|e| match e {
            TrainerError::Decode(reason) => {
                TrainerError::Decode(format!("output '{}': {}", name, reason))
            }
            other => other,
        })?;
        artifacts.push((name, bytes));
    }

    materialize(artifacts, outputs).await
}
