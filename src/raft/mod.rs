//! Raft consensus for a single node: leader election, log replication and
//! commit tracking over a pluggable [`Transport`], with durable state kept in
//! a [`Storage`].

mod config;
mod error;
mod log;
mod node;
mod rpc;
mod state;

pub use self::config::RaftConfig;
pub use self::error::RaftError;
pub use self::log::{CommitEntry, Log, LogEntry};
pub use self::node::{Effects, RaftNode, CURRENT_TERM_KEY, LOG_KEY, VOTED_FOR_KEY};
pub use self::rpc::{
    AppendEntriesArgs, AppendEntriesReply, RaftRequest, RaftResponse, RequestVoteArgs,
    RequestVoteReply,
};
pub use self::state::{NodeRole, NodeState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

// Use external log crate, not our own log module
use ::log::{debug, info, warn};
use rand::Rng;
use tokio::sync::{mpsc, Mutex, MutexGuard, Notify};

use crate::network::{NetworkError, Transport};
use crate::storage::Storage;

pub type NodeId = u64;
pub type Term = u64;

struct Shared {
    id: NodeId,
    config: RaftConfig,
    node: Mutex<RaftNode>,
    transport: Arc<dyn Transport>,
    started: AtomicBool,
    // Owned by the current leadership's replication driver; replaced on every win.
    replication_signal: std::sync::Mutex<Arc<Notify>>,
    commit_ready: Notify,
}

/// Handle to a running consensus module. Clones share the same node.
#[derive(Clone)]
pub struct Raft {
    shared: Arc<Shared>,
}

impl Raft {
    /// Restores persisted state and spawns the commit notifier. Elections do not
    /// begin until [`Raft::start`] is called.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: RaftConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        commit_tx: mpsc::UnboundedSender<CommitEntry>,
    ) -> Result<Self, RaftError> {
        let node = RaftNode::new(&config, storage)?;
        let raft = Self {
            shared: Arc::new(Shared {
                id: config.node_id,
                config,
                node: Mutex::new(node),
                transport,
                started: AtomicBool::new(false),
                replication_signal: std::sync::Mutex::new(Arc::new(Notify::new())),
                commit_ready: Notify::new(),
            }),
        };

        let notifier = raft.clone();
        tokio::spawn(async move { notifier.run_commit_notifier(commit_tx).await });

        Ok(raft)
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.shared.config
    }

    /// Arms the first election timer. Returns `false` if the node was already
    /// started or has been stopped.
    pub async fn start(&self) -> bool {
        {
            let mut node = self.lock_node().await;
            if node.is_dead() {
                return false;
            }
            if self.shared.started.swap(true, Ordering::SeqCst) {
                warn!("[{}] already started", self.id());
                return false;
            }
            node.reset_election_clock();
        }
        info!("[{}] starting", self.id());
        self.spawn_election_timer();
        true
    }

    /// Returns `(id, current term, is leader)`.
    pub async fn report(&self) -> (NodeId, Term, bool) {
        self.lock_node().await.report()
    }

    pub async fn node_state(&self) -> NodeState {
        self.lock_node().await.state().clone()
    }

    pub async fn log_entries(&self) -> Vec<LogEntry> {
        self.lock_node().await.log().entries().to_vec()
    }

    /// Appends a command if this node is leader. A `true` result does not mean
    /// the command will be committed.
    pub async fn submit(&self, command: Vec<u8>) -> bool {
        let (accepted, effects) = {
            let mut node = self.lock_node().await;
            let accepted = node.submit(command);
            (accepted, node.take_effects())
        };
        self.apply_effects(effects);
        accepted
    }

    pub async fn request_vote(
        &self,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, RaftError> {
        let (reply, effects) = {
            let mut node = self.lock_node().await;
            let reply = node.handle_request_vote(&args);
            (reply, node.take_effects())
        };
        self.apply_effects(effects);
        reply
    }

    pub async fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError> {
        let (reply, effects) = {
            let mut node = self.lock_node().await;
            let reply = node.handle_append_entries(&args);
            (reply, node.take_effects())
        };
        self.apply_effects(effects);
        reply
    }

    /// Dispatches an inbound request to the matching handler.
    pub async fn handle(&self, request: RaftRequest) -> Result<RaftResponse, RaftError> {
        match request {
            RaftRequest::RequestVote(args) => {
                self.request_vote(args).await.map(RaftResponse::RequestVote)
            }
            RaftRequest::AppendEntries(args) => self
                .append_entries(args)
                .await
                .map(RaftResponse::AppendEntries),
        }
    }

    /// Halts the node. Background tasks wind down and the commit channel closes
    /// once the notifier has delivered what was already committed.
    pub async fn stop(&self) {
        self.lock_node().await.stop();
        self.shared.commit_ready.notify_one();
        self.replication_signal().notify_one();
    }

    async fn lock_node(&self) -> MutexGuard<'_, RaftNode> {
        self.shared.node.lock().await
    }

    fn apply_effects(&self, effects: Effects) {
        if effects.restart_election_timer {
            self.spawn_election_timer();
        }
        if effects.start_replication {
            self.spawn_replication_driver();
        }
        if effects.commit_ready {
            self.shared.commit_ready.notify_one();
        }
        if effects.trigger_replication {
            self.replication_signal().notify_one();
        }
    }

    fn replication_signal(&self) -> Arc<Notify> {
        let current = self
            .shared
            .replication_signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&current)
    }

    fn election_timeout(&self) -> Duration {
        let cfg = &self.shared.config;
        let ms = rand::rng().random_range(cfg.election_timeout_min..cfg.election_timeout_max);
        Duration::from_millis(ms)
    }

    fn spawn_election_timer(&self) {
        let raft = self.clone();
        tokio::spawn(async move { raft.run_election_timer().await });
    }

    /// Watches for a missing leader. Exits once the node leads or the term moves
    /// on, since whichever transition caused that starts a fresh watchdog.
    async fn run_election_timer(self) {
        let timeout = self.election_timeout();
        let term_started = self.lock_node().await.current_term();
        debug!(
            "[{}] election timer started ({:?}), term={}",
            self.id(),
            timeout,
            term_started
        );

        let mut ticker = tokio::time::interval(self.shared.config.poll_interval());
        loop {
            ticker.tick().await;

            let mut node = self.lock_node().await;
            if !matches!(node.role(), NodeRole::Follower | NodeRole::Candidate) {
                debug!(
                    "[{}] in election timer state={}, bailing out",
                    self.id(),
                    node.role()
                );
                return;
            }
            if node.current_term() != term_started {
                debug!(
                    "[{}] in election timer term changed from {} to {}, bailing out",
                    self.id(),
                    term_started,
                    node.current_term()
                );
                return;
            }

            if node.election_elapsed() >= timeout {
                let request = node.start_election();
                let effects = node.take_effects();
                drop(node);

                if let Some(args) = request {
                    self.request_votes(args);
                }
                self.apply_effects(effects);
                return;
            }
        }
    }

    fn request_votes(&self, args: RequestVoteArgs) {
        for &peer in &self.shared.config.peers {
            let raft = self.clone();
            let args = args.clone();
            tokio::spawn(async move {
                debug!("[{}] sending RequestVote to {}: {:?}", raft.id(), peer, args);
                let term_sent = args.term;
                let reply = match raft.call(peer, RaftRequest::RequestVote(args)).await {
                    Ok(response) => response.into_request_vote(),
                    Err(e) => {
                        debug!("[{}] RequestVote to {} failed: {}", raft.id(), peer, e);
                        return;
                    }
                };
                let Some(reply) = reply else {
                    warn!("[{}] {} answered RequestVote with the wrong reply", raft.id(), peer);
                    return;
                };

                let effects = {
                    let mut node = raft.lock_node().await;
                    node.handle_vote_reply(term_sent, reply);
                    node.take_effects()
                };
                raft.apply_effects(effects);
            });
        }
    }

    /// Installs a fresh signal so triggers only reach the newest driver; a
    /// driver left over from an earlier term exits on its next heartbeat.
    fn spawn_replication_driver(&self) {
        let signal = Arc::new(Notify::new());
        *self
            .shared
            .replication_signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Arc::clone(&signal);
        let raft = self.clone();
        tokio::spawn(async move { raft.run_replication_driver(signal).await });
    }

    /// Sends AppendEntries to every peer on each heartbeat, or sooner when new
    /// work is signalled. A signal resets the heartbeat.
    async fn run_replication_driver(self, signal: Arc<Notify>) {
        let term = self.lock_node().await.current_term();
        let heartbeat = self.shared.config.heartbeat();

        // Announce leadership right away.
        self.broadcast_append_entries(term);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(heartbeat) => {}
                _ = signal.notified() => {}
            }

            {
                let node = self.lock_node().await;
                if !node.is_leader() || node.current_term() != term {
                    debug!("[{}] replication driver for term {} exits", self.id(), term);
                    return;
                }
            }
            self.broadcast_append_entries(term);
        }
    }

    fn broadcast_append_entries(&self, term: Term) {
        for &peer in &self.shared.config.peers {
            let raft = self.clone();
            tokio::spawn(async move { raft.replicate_to(peer, term).await });
        }
    }

    async fn replicate_to(&self, peer: NodeId, term: Term) {
        let Some(args) = self.lock_node().await.prepare_append(peer, term) else {
            return;
        };
        debug!(
            "[{}] sending AppendEntries to {}: prev={:?} entries={} commit={:?}",
            self.id(),
            peer,
            args.prev_log_index,
            args.entries.len(),
            args.leader_commit
        );

        let reply = match self.call(peer, RaftRequest::AppendEntries(args.clone())).await {
            Ok(response) => response.into_append_entries(),
            Err(e) => {
                debug!("[{}] AppendEntries to {} failed: {}", self.id(), peer, e);
                return;
            }
        };
        let Some(reply) = reply else {
            warn!("[{}] {} answered AppendEntries with the wrong reply", self.id(), peer);
            return;
        };

        let effects = {
            let mut node = self.lock_node().await;
            node.handle_append_reply(peer, &args, reply);
            node.take_effects()
        };
        self.apply_effects(effects);
    }

    async fn call(&self, peer: NodeId, request: RaftRequest) -> Result<RaftResponse, NetworkError> {
        let deadline = self.shared.config.rpc_deadline();
        match tokio::time::timeout(deadline, self.shared.transport.call(peer, request)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout(deadline)),
        }
    }

    /// Delivers committed entries in index order, once each.
    async fn run_commit_notifier(self, commit_tx: mpsc::UnboundedSender<CommitEntry>) {
        loop {
            self.shared.commit_ready.notified().await;

            let (batch, dead) = {
                let mut node = self.lock_node().await;
                (node.take_commit_batch(), node.is_dead())
            };
            if !batch.is_empty() {
                debug!(
                    "[{}] delivering {} committed entries starting at {}",
                    self.id(),
                    batch.len(),
                    batch[0].index
                );
            }
            for entry in batch {
                if commit_tx.send(entry).is_err() {
                    debug!("[{}] commit receiver dropped", self.id());
                    break;
                }
            }

            if dead {
                debug!("[{}] commit notifier done", self.id());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalNetwork;
    use crate::storage::{MapStorage, StorageError};

    struct ReadOnlyStorage;

    impl Storage for ReadOnlyStorage {
        fn set(&self, _key: &str, _value: Vec<u8>) -> Result<(), StorageError> {
            Err(StorageError::IoError(std::io::Error::other("read-only")))
        }

        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            Ok(None)
        }

        fn has_data(&self) -> Result<bool, StorageError> {
            Ok(false)
        }
    }

    async fn wait_for_leader(raft: &Raft) -> bool {
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if raft.report().await.2 {
                return true;
            }
        }
        false
    }

    #[tokio::test]
    async fn single_node_elects_itself_and_commits() {
        let net = LocalNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let raft = Raft::new(
            RaftConfig::new(0),
            Arc::new(MapStorage::new()),
            net.transport_for(0),
            tx,
        )
        .expect("raft");
        net.register(0, raft.clone());
        assert!(raft.start().await);
        assert!(wait_for_leader(&raft).await, "single node never became leader");

        assert!(raft.submit(b"solo".to_vec()).await);
        let entry = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("commit in time")
            .expect("channel open");
        assert_eq!(entry.index, 0);
        assert_eq!(entry.command, b"solo".to_vec());

        raft.stop().await;
        assert!(!raft.submit(b"late".to_vec()).await);
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("channel closes");
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn stopped_node_rejects_rpcs() {
        let net = LocalNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let raft = Raft::new(
            RaftConfig::new(1).with_peers([2]),
            Arc::new(MapStorage::new()),
            net.transport_for(1),
            tx,
        )
        .expect("raft");
        raft.stop().await;

        let result = raft
            .handle(RaftRequest::RequestVote(RequestVoteArgs {
                term: 1,
                candidate_id: 2,
                last_log_index: None,
                last_log_term: None,
            }))
            .await;
        assert!(matches!(result, Err(RaftError::NotRunning)));
        assert_eq!(raft.report().await, (1, 0, false));
    }

    #[tokio::test]
    async fn second_start_is_ignored() {
        let net = LocalNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let raft = Raft::new(
            RaftConfig::new(0),
            Arc::new(MapStorage::new()),
            net.transport_for(0),
            tx,
        )
        .expect("raft");

        assert!(raft.start().await);
        assert!(!raft.start().await);
        assert!(wait_for_leader(&raft).await);
        assert_eq!(raft.report().await, (0, 1, true));

        raft.stop().await;
        assert!(!raft.start().await);
    }

    #[tokio::test]
    async fn persistence_failure_closes_commit_channel() {
        let net = LocalNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let raft = Raft::new(
            RaftConfig::new(0).with_peers([1]),
            Arc::new(ReadOnlyStorage),
            net.transport_for(0),
            tx,
        )
        .expect("raft");

        let result = raft
            .append_entries(AppendEntriesArgs {
                term: 1,
                leader_id: 1,
                prev_log_index: None,
                prev_log_term: None,
                entries: vec![],
                leader_commit: None,
            })
            .await;
        assert!(matches!(result, Err(RaftError::Storage(_))));

        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("channel closes after halt");
        assert!(closed.is_none());
        assert_eq!(raft.node_state().await.role, NodeRole::Dead);
    }

    #[tokio::test]
    async fn each_leadership_gets_its_own_replication_signal() {
        let net = LocalNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let raft = Raft::new(
            RaftConfig::new(0).with_peers([1]),
            Arc::new(MapStorage::new()),
            net.transport_for(0),
            tx,
        )
        .expect("raft");

        let idle = raft.replication_signal();
        raft.spawn_replication_driver();
        let first = raft.replication_signal();
        raft.spawn_replication_driver();
        let second = raft.replication_signal();

        assert!(!Arc::ptr_eq(&idle, &first));
        assert!(!Arc::ptr_eq(&first, &second));
        raft.stop().await;
    }
}
