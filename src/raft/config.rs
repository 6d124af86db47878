use std::time::Duration;

use super::{NodeId, RaftError};

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: NodeId,
    pub peers: Vec<NodeId>,
    pub election_timeout_min: u64,   // in milliseconds
    pub election_timeout_max: u64,   // in milliseconds
    pub heartbeat_interval: u64,     // in milliseconds
    pub election_poll_interval: u64, // in milliseconds
    pub rpc_timeout: u64,            // in milliseconds
}

impl RaftConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            peers: Vec::new(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            election_poll_interval: 10,
            rpc_timeout: 500,
        }
    }

    pub fn add_peer(&mut self, peer_id: NodeId) {
        if !self.peers.contains(&peer_id) {
            self.peers.push(peer_id);
        }
    }

    pub fn with_peers(mut self, peers: impl IntoIterator<Item = NodeId>) -> Self {
        for peer in peers {
            self.add_peer(peer);
        }
        self
    }

    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min = min_ms;
        self.election_timeout_max = max_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval = interval_ms;
        self
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.election_poll_interval)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout window [{}, {}) is empty",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.election_poll_interval == 0 {
            return Err(RaftError::InvalidConfig(
                "heartbeat and poll intervals must be non-zero".to_string(),
            ));
        }
        if self.peers.contains(&self.node_id) {
            return Err(RaftError::InvalidConfig(format!(
                "node {} lists itself as a peer",
                self.node_id
            )));
        }
        Ok(())
    }
}
