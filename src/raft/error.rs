use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Node is not running")]
    NotRunning,

    #[error("Persistent state is missing key '{0}'")]
    MissingState(&'static str),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
