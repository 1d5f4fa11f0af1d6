use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::relay::ClientId;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("client {0} is not connected")]
    UnknownClient(ClientId),

    #[error("failed to serialize message: {0}")]
    Encode(#[from] simd_json::Error),

    #[error("system random number generator failed")]
    Rng,

    #[error("command queue is full")]
    CommandQueueFull,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
