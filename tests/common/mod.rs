//! In-process cluster harness shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chronos_raft::network::LocalNetwork;
use chronos_raft::raft::{CommitEntry, NodeId, Raft, RaftConfig, Term};
use chronos_raft::storage::MapStorage;
use tokio::sync::mpsc;
use tokio::time::sleep;

pub async fn sleep_ms(ms: u64) {
    sleep(Duration::from_millis(ms)).await;
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

type Commits = Arc<Mutex<Vec<CommitEntry>>>;

pub struct Harness {
    net: LocalNetwork,
    n: usize,
    rafts: Vec<Option<Raft>>,
    storage: Vec<MapStorage>,
    commits: Vec<Commits>,
    connected: Vec<bool>,
}

impl Harness {
    /// Builds `n` nodes, wires them together and then starts them all.
    pub async fn new(n: usize) -> Self {
        init_logging();
        let mut h = Self {
            net: LocalNetwork::new(),
            n,
            rafts: (0..n).map(|_| None).collect(),
            storage: (0..n).map(|_| MapStorage::new()).collect(),
            commits: (0..n).map(|_| Commits::default()).collect(),
            connected: vec![true; n],
        };
        for id in 0..n {
            h.spawn_node(id);
        }
        for raft in h.rafts.iter().flatten() {
            raft.start().await;
        }
        h
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.net
    }

    pub fn raft(&self, id: usize) -> &Raft {
        self.rafts[id].as_ref().expect("node is crashed")
    }

    fn spawn_node(&mut self, id: usize) {
        let peers = (0..self.n).filter(|&p| p != id).map(|p| p as NodeId);
        let cfg = RaftConfig::new(id as NodeId).with_peers(peers);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let raft = Raft::new(
            cfg,
            Arc::new(self.storage[id].clone()),
            self.net.transport_for(id as NodeId),
            tx,
        )
        .expect("raft node");

        let sink = Commits::default();
        self.commits[id] = Arc::clone(&sink);
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                sink.lock().unwrap().push(entry);
            }
        });

        self.net.register(id as NodeId, raft.clone());
        self.net.connect(id as NodeId);
        self.rafts[id] = Some(raft);
    }

    pub fn disconnect_peer(&mut self, id: usize) {
        self.net.disconnect(id as NodeId);
        self.connected[id] = false;
    }

    pub fn reconnect_peer(&mut self, id: usize) {
        self.net.connect(id as NodeId);
        self.connected[id] = true;
    }

    /// Cuts the node off, stops it and forgets what it delivered.
    pub async fn crash_peer(&mut self, id: usize) {
        self.disconnect_peer(id);
        if let Some(raft) = self.rafts[id].take() {
            raft.stop().await;
        }
        self.net.deregister(id as NodeId);
        self.commits[id] = Commits::default();
    }

    /// Rebuilds a crashed node from its storage.
    pub async fn restart_peer(&mut self, id: usize) {
        assert!(self.rafts[id].is_none(), "node {id} is still running");
        self.spawn_node(id);
        self.connected[id] = true;
        self.raft(id).start().await;
        sleep_ms(20).await;
    }

    pub async fn shutdown(&mut self) {
        for id in 0..self.n {
            self.disconnect_peer(id);
        }
        for raft in self.rafts.iter_mut().filter_map(Option::take) {
            raft.stop().await;
        }
    }

    pub async fn submit_to_server(&self, id: usize, command: &[u8]) -> bool {
        self.raft(id).submit(command.to_vec()).await
    }

    fn live_connected(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.n).filter(move |&id| self.connected[id] && self.rafts[id].is_some())
    }

    /// Waits for exactly one leader among connected nodes and returns it with
    /// its term. Two leaders sharing a term is a safety violation.
    pub async fn check_single_leader(&self) -> (usize, Term) {
        for _ in 0..8 {
            let mut leaders: Vec<(usize, Term)> = Vec::new();
            for id in self.live_connected() {
                let (_, term, is_leader) = self.raft(id).report().await;
                if is_leader {
                    leaders.push((id, term));
                }
            }

            let mut by_term: HashMap<Term, usize> = HashMap::new();
            for (_, term) in &leaders {
                *by_term.entry(*term).or_default() += 1;
            }
            if let Some((term, _)) = by_term.iter().find(|(_, count)| **count > 1) {
                panic!("two leaders in term {term}: {leaders:?}");
            }
            if leaders.len() == 1 {
                return leaders[0];
            }
            sleep_ms(150).await;
        }
        panic!("leader not found");
    }

    pub async fn check_no_leader(&self) {
        for id in self.live_connected() {
            let (_, term, is_leader) = self.raft(id).report().await;
            assert!(!is_leader, "node {id} is leader in term {term}, want none");
        }
    }

    fn snapshot_commits(&self) -> Vec<(usize, Vec<CommitEntry>)> {
        self.live_connected()
            .map(|id| (id, self.commits[id].lock().unwrap().clone()))
            .collect()
    }

    /// Checks that connected nodes agree on the committed sequence and returns
    /// how many of them committed `command` and at which index.
    fn committed_once(&self, command: &[u8]) -> Result<(usize, usize), String> {
        let snapshot = self.snapshot_commits();
        let Some((_, first)) = snapshot.first() else {
            return Err("no connected nodes".to_string());
        };

        for (id, commits) in &snapshot {
            if commits.len() != first.len() {
                return Err(format!(
                    "node {id} has {} commits, expected {}",
                    commits.len(),
                    first.len()
                ));
            }
        }
        for index in 0..first.len() {
            for (id, commits) in &snapshot {
                assert_eq!(
                    commits[index].command, first[index].command,
                    "node {id} disagrees at index {index}"
                );
                assert_eq!(commits[index].index, index, "node {id} skipped an index");
            }
        }

        let Some(index) = first.iter().position(|c| c.command == command) else {
            return Err(format!("command {:?} not committed", command));
        };
        let count = snapshot
            .iter()
            .filter(|(_, commits)| commits.get(index).map(|c| c.command.as_slice()) == Some(command))
            .count();
        Ok((count, index))
    }

    /// Like [`Harness::check_committed_n`] without a required count.
    pub async fn check_committed(&self, command: &[u8]) -> (usize, usize) {
        let mut last = String::new();
        for _ in 0..20 {
            match self.committed_once(command) {
                Ok(found) => return found,
                Err(e) => last = e,
            }
            sleep_ms(100).await;
        }
        panic!("check_committed failed: {last}");
    }

    /// Waits until exactly `n` connected nodes have committed `command`.
    pub async fn check_committed_n(&self, command: &[u8], n: usize) -> usize {
        let mut last = String::new();
        for _ in 0..20 {
            match self.committed_once(command) {
                Ok((count, index)) if count == n => return index,
                Ok((count, _)) => last = format!("committed on {count} nodes, want {n}"),
                Err(e) => last = e,
            }
            sleep_ms(100).await;
        }
        panic!("check_committed_n failed: {last}");
    }

    pub fn check_not_committed(&self, command: &[u8]) {
        for (id, commits) in self.snapshot_commits() {
            assert!(
                commits.iter().all(|c| c.command != command),
                "node {id} committed {:?}",
                command
            );
        }
    }

    pub fn commits(&self, id: usize) -> Vec<CommitEntry> {
        self.commits[id].lock().unwrap().clone()
    }
}
