use lcb_can::FrameError;
use thiserror::Error;

/// Errors that can occur while loading or running a scenario.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),

    #[error("unknown interface '{0}'")]
    UnknownInterface(String),

    #[error("duplicate interface '{0}'")]
    DuplicateInterface(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl RunnerError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        RunnerError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;
