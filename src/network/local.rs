//! In-process transport for clusters living in one runtime.
//!
//! Every node gets a [`LocalTransport`] bound to its id; calls are delivered
//! straight to the registered [`Raft`] handle of the target after a short
//! simulated latency. Nodes can be disconnected to model partitions, and the
//! whole network can be made lossy.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rand::Rng;

use super::{NetworkError, Transport};
use crate::raft::{NodeId, Raft, RaftRequest, RaftResponse};

enum Delivery {
    Deliver(Duration),
    Drop(Duration),
}

#[derive(Default)]
struct Registry {
    nodes: RwLock<HashMap<NodeId, Raft>>,
    disconnected: RwLock<HashSet<NodeId>>,
    unreliable: AtomicBool,
}

#[derive(Clone, Default)]
pub struct LocalNetwork {
    registry: Arc<Registry>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport_for(&self, id: NodeId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            id,
            network: self.clone(),
        })
    }

    /// Makes `raft` reachable under `id`, replacing any earlier handle.
    pub fn register(&self, id: NodeId, raft: Raft) {
        self.registry
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, raft);
    }

    pub fn deregister(&self, id: NodeId) -> Option<Raft> {
        self.registry
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Cuts all traffic to and from `id`.
    pub fn disconnect(&self, id: NodeId) {
        debug!("network: disconnecting {}", id);
        self.registry
            .disconnected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    pub fn connect(&self, id: NodeId) {
        debug!("network: connecting {}", id);
        self.registry
            .disconnected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn is_connected(&self, id: NodeId) -> bool {
        !self
            .registry
            .disconnected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    /// Lossy mode drops about 10% of calls, delays about 10% by 60-70 ms and
    /// adds 10-15 ms to the rest. Reliable mode adds 1-5 ms.
    pub fn set_unreliable(&self, unreliable: bool) {
        self.registry.unreliable.store(unreliable, Ordering::SeqCst);
    }

    fn node(&self, id: NodeId) -> Option<Raft> {
        self.registry
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn link_up(&self, from: NodeId, to: NodeId) -> Result<(), NetworkError> {
        if !self.is_connected(from) {
            return Err(NetworkError::Disconnected(from));
        }
        if !self.is_connected(to) {
            return Err(NetworkError::Disconnected(to));
        }
        Ok(())
    }

    fn plan_delivery(&self) -> Delivery {
        let mut rng = rand::rng();
        if !self.registry.unreliable.load(Ordering::SeqCst) {
            return Delivery::Deliver(Duration::from_millis(rng.random_range(1..=5)));
        }
        match rng.random_range(0..10) {
            0 => Delivery::Drop(Duration::from_millis(rng.random_range(1..=5))),
            1 => Delivery::Deliver(Duration::from_millis(rng.random_range(60..=70))),
            _ => Delivery::Deliver(Duration::from_millis(rng.random_range(10..=15))),
        }
    }
}

/// One node's view of a [`LocalNetwork`].
pub struct LocalTransport {
    id: NodeId,
    network: LocalNetwork,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, peer: NodeId, request: RaftRequest) -> Result<RaftResponse, NetworkError> {
        self.network.link_up(self.id, peer)?;

        let latency = match self.network.plan_delivery() {
            Delivery::Deliver(latency) => latency,
            Delivery::Drop(after) => {
                tokio::time::sleep(after).await;
                debug!(
                    "network: dropped {} from {} to {}",
                    request.operation_name(),
                    self.id,
                    peer
                );
                return Err(NetworkError::Dropped);
            }
        };
        tokio::time::sleep(latency).await;

        let target = self
            .network
            .node(peer)
            .ok_or(NetworkError::Disconnected(peer))?;
        let response = target
            .handle(request)
            .await
            .map_err(|e| NetworkError::Remote(e.to_string()))?;

        // The reply is lost if either end was cut off meanwhile.
        self.network.link_up(self.id, peer)?;
        Ok(response)
    }
}
