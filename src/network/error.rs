use std::time::Duration;

use thiserror::Error;

use crate::raft::NodeId;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("RPC timed out after {0:?}")]
    Timeout(Duration),

    #[error("RPC dropped by network")]
    Dropped,

    #[error("Node {0} is disconnected")]
    Disconnected(NodeId),

    #[error("Unknown peer: {0}")]
    UnknownPeer(NodeId),

    #[error("Frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),

    #[error("Remote error: {0}")]
    Remote(String),
}
