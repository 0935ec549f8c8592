// Top-level error type for the relay engine
use thiserror::Error;

use crate::chains::ChainError;
use crate::config::ConfigError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Queue store error: {0}")]
    Store(#[from] StoreError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid message: {0}")]
    Validation(String),

    #[error("Relay engine is already running")]
    AlreadyRunning,

    #[error("Metrics error: {0}")]
    Metrics(String),
}

pub type Result<T> = std::result::Result<T, RelayerError>;
