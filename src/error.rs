//! Error types for EKI driver operations

use crate::state::ProgramStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EkiError>;

#[derive(Error, Debug)]
pub enum EkiError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed {command} response: {reason}")]
    Parse { command: String, reason: String },

    #[error("Joint {joint} target {value} is outside limits ({min}, {max})")]
    OutOfRange {
        joint: usize,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Expected {expected} joint values, got {actual}")]
    JointCount { expected: usize, actual: usize },

    #[error("Robot is still moving, retry after the current motion completes")]
    Busy,

    #[error("Remote program is {0}, it must be Running before motion is allowed")]
    UnsafeState(ProgramStatus),

    #[error("Device not ready: {0}")]
    NotReady(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Session is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EkiError {
    pub(crate) fn parse(command: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            command: command.to_string(),
            reason: reason.into(),
        }
    }

    /// Validation failures are raised before anything reaches the wire
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::OutOfRange { .. } | Self::JointCount { .. } | Self::Busy | Self::UnsafeState(_)
        )
    }
}
