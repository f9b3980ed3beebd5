use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Could not acquire lock {key:?} within {timeout:?}")]
    LockAcquisition { key: String, timeout: Duration },

    #[error("Cannot extend lock {key:?}: no longer held by {holder}")]
    LockExtension { key: String, holder: String },

    #[error("Invalid lock configuration: {0}")]
    InvalidConfig(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the caller can reasonably try again with a fresh handle.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::LockAcquisition { .. })
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
