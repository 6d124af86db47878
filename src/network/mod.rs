//! RPC plumbing between consensus modules.
//!
//! A node talks to its peers only through [`Transport::call`]. Two
//! implementations ship with the crate: [`TcpTransport`] for real deployments
//! (served by [`RaftServer`]) and [`LocalNetwork`] for in-process clusters.

mod error;

pub mod client;
pub mod codec;
pub mod local;
pub mod server;

use async_trait::async_trait;

use crate::raft::{NodeId, RaftRequest, RaftResponse};

pub use self::client::TcpTransport;
pub use self::error::NetworkError;
pub use self::local::{LocalNetwork, LocalTransport};
pub use self::server::RaftServer;

/// Remote invocation of `RequestVote` / `AppendEntries` on a peer.
///
/// An `Err` means nothing is known about whether the peer processed the call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, peer: NodeId, request: RaftRequest) -> Result<RaftResponse, NetworkError>;
}
