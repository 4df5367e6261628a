use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Everything that can go wrong while offloading a training job.
#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("timed out after {0:?} waiting for a matching reply")]
    Timeout(Duration),

    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} output(s) could not be written: {}", .0.len(), OutputFailures(.0))]
    Outputs(Vec<OutputFailure>),
}

/// One output that the materializer failed to write.
#[derive(Debug)]
pub struct OutputFailure {
    pub output: String,
    pub error: TrainerError,
}

struct OutputFailures<'a>(&'a [OutputFailure]);

impl fmt::Display for OutputFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, failure) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", failure.output, failure.error)?;
        }
        Ok(())
    }
}

/// Coarse classification used to mark a workflow step as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Connection,
    Validation,
    Encode,
    Decode,
    Timeout,
    Io,
}

impl TrainerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrainerError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TrainerError::Configuration(_) => ErrorKind::Configuration,
            TrainerError::Connection(_) => ErrorKind::Connection,
            TrainerError::Validation(_) => ErrorKind::Validation,
            TrainerError::Encode(_) => ErrorKind::Encode,
            TrainerError::Decode(_) => ErrorKind::Decode,
            TrainerError::Timeout(_) => ErrorKind::Timeout,
            TrainerError::Io { .. } | TrainerError::Outputs(_) => ErrorKind::Io,
        }
    }

    /// Only a timeout leaves the remote side in a state worth asking again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TrainerError::Timeout(_))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Encode => "EncodeError",
            ErrorKind::Decode => "DecodeError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Io => "IOError",
        };
        f.write_str(name)
    }
}

pub type Result<T, E = TrainerError> = std::result::Result<T, E>;
