use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::raft::{NodeId, RaftConfig, RaftError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid peer spec '{0}', expected id=address")]
    InvalidPeer(String),

    #[error(transparent)]
    Raft(#[from] RaftError),
}

/// Process-level settings for one cluster member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: NodeId,
    pub address: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub address: String,
}

/// Overrides for the consensus timers, all in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    pub election_timeout_min_ms: Option<u64>,
    pub election_timeout_max_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub rpc_timeout_ms: Option<u64>,
}

fn default_data_dir() -> String {
    "data".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 0,
            address: "127.0.0.1:7000".to_string(),
            data_dir: default_data_dir(),
            peers: vec![],
            timing: TimingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Directory holding this node's durable state.
    pub fn node_dir(&self) -> String {
        format!("{}/{}", self.data_dir, self.node_id)
    }

    /// Peer id to address, excluding this node.
    pub fn peer_addresses(&self) -> HashMap<NodeId, String> {
        self.peers
            .iter()
            .filter(|p| p.id != self.node_id)
            .map(|p| (p.id, p.address.clone()))
            .collect()
    }

    pub fn into_raft_config(&self) -> Result<RaftConfig, ConfigError> {
        let mut cfg = RaftConfig::new(self.node_id);
        for peer in &self.peers {
            if peer.id != self.node_id {
                cfg.add_peer(peer.id);
            }
        }

        let t = &self.timing;
        let min = t.election_timeout_min_ms.unwrap_or(cfg.election_timeout_min);
        let max = t.election_timeout_max_ms.unwrap_or(cfg.election_timeout_max);
        cfg = cfg.with_election_timeout(min, max);
        if let Some(ms) = t.heartbeat_interval_ms {
            cfg = cfg.with_heartbeat_interval(ms);
        }
        if let Some(ms) = t.rpc_timeout_ms {
            cfg.rpc_timeout = ms;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

/// Parses `1=127.0.0.1:7001,2=127.0.0.1:7002`.
pub fn parse_peers(spec: &str) -> Result<Vec<PeerConfig>, ConfigError> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|peer| {
            let (id, address) = peer
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidPeer(peer.to_string()))?;
            let id = id
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPeer(peer.to_string()))?;
            Ok(PeerConfig {
                id,
                address: address.trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_default_values_are_sensible() {
        let cfg = Config::default();
        assert_eq!(cfg.node_id, 0);
        assert_eq!(cfg.data_dir, "data");
        assert!(cfg.peers.is_empty());
        assert_eq!(cfg.node_dir(), "data/0");
    }

    #[test]
    fn parse_peers_accepts_id_address_pairs() {
        let peers = parse_peers("1=127.0.0.1:7001, 2=127.0.0.1:7002,").unwrap();
        assert_eq!(
            peers,
            vec![
                PeerConfig {
                    id: 1,
                    address: "127.0.0.1:7001".to_string()
                },
                PeerConfig {
                    id: 2,
                    address: "127.0.0.1:7002".to_string()
                },
            ]
        );
        assert!(matches!(
            parse_peers("x=host:1"),
            Err(ConfigError::InvalidPeer(_))
        ));
        assert!(parse_peers("7001").is_err());
    }

    #[test]
    fn load_reads_json_and_applies_timings() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("node.json");
        std::fs::write(
            &path,
            r#"{
                "node_id": 1,
                "address": "127.0.0.1:7001",
                "peers": [
                    {"id": 1, "address": "127.0.0.1:7001"},
                    {"id": 2, "address": "127.0.0.1:7002"}
                ],
                "timing": {"heartbeat_interval_ms": 20, "election_timeout_min_ms": 100}
            }"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.data_dir, "data");
        assert_eq!(cfg.peer_addresses().len(), 1);

        let raft = cfg.into_raft_config().unwrap();
        assert_eq!(raft.peers, vec![2]);
        assert_eq!(raft.heartbeat_interval, 20);
        assert_eq!(raft.election_timeout_min, 100);
        assert_eq!(raft.election_timeout_max, 300);
    }

    #[test]
    fn invalid_timings_are_rejected() {
        let mut cfg = Config::default();
        cfg.timing.election_timeout_min_ms = Some(500);
        assert!(matches!(
            cfg.into_raft_config(),
            Err(ConfigError::Raft(RaftError::InvalidConfig(_)))
        ));
    }
}
