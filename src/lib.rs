// Consensus core
pub mod raft;
pub mod storage;

// Cluster plumbing
pub mod config;
pub mod network;

// Public exports
pub use config::{Config, PeerConfig};
pub use network::{LocalNetwork, RaftServer, TcpTransport, Transport};
pub use raft::{CommitEntry, Raft, RaftConfig, RaftError};
pub use storage::{FileStorage, MapStorage, Storage};
