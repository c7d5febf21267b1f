use std::error::Error as StdError;

use thiserror::Error;

/// Soundgate's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Soundgate's crate-wide error type.
///
/// This is intentionally decoupled from `anyhow` so downstream libraries aren't forced to
/// adopt `anyhow` in their own public APIs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    /// A classification event did not line up with the loaded label set.
    #[error("classification event has {actual} scores but {expected} labels are loaded")]
    ContractViolation { expected: usize, actual: usize },

    #[error("{name} must be a finite value in [0, 1], got {value}")]
    InvalidThreshold { name: &'static str, value: f32 },

    #[error("invalid label set: {0}")]
    Labels(String),

    #[error(transparent)]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

impl Error {
    pub(crate) fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Message(format!("{err:#}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

#[cfg(feature = "remote")]
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Other(Box::new(err))
    }
}
