use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ::log::{debug, error, info};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{
    AppendEntriesArgs, AppendEntriesReply, CommitEntry, Log, LogEntry, NodeId, NodeRole,
    NodeState, RaftConfig, RaftError, RequestVoteArgs, RequestVoteReply, Term,
};
use crate::storage::Storage;

pub const CURRENT_TERM_KEY: &str = "currentTerm";
pub const VOTED_FOR_KEY: &str = "votedFor";
pub const LOG_KEY: &str = "log";

/// Follow-up work a transition asks the async runtime to perform once the
/// node lock has been released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Effects {
    pub restart_election_timer: bool,
    pub start_replication: bool,
    pub commit_ready: bool,
    pub trigger_replication: bool,
}

pub struct RaftNode {
    id: NodeId,
    peer_ids: Vec<NodeId>,

    state: NodeState,
    log: Log,
    storage: Arc<dyn Storage>,

    election_reset_time: Instant,
    votes_received: usize,

    // Leader state, rebuilt on every election win
    next_index: HashMap<NodeId, usize>,
    match_index: HashMap<NodeId, Option<usize>>,

    effects: Effects,
}

impl RaftNode {
    /// Builds the node record, restoring term, vote and log when the store has data.
    pub fn new(config: &RaftConfig, storage: Arc<dyn Storage>) -> Result<Self, RaftError> {
        config.validate()?;

        let mut node = Self {
            id: config.node_id,
            peer_ids: config.peers.clone(),
            state: NodeState::default(),
            log: Log::new(),
            storage,
            election_reset_time: Instant::now(),
            votes_received: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            effects: Effects::default(),
        };

        if node.storage.has_data()? {
            node.restore_from_storage()?;
            info!(
                "[{}] restored term={} voted_for={:?} log_len={}",
                node.id,
                node.state.current_term,
                node.state.voted_for,
                node.log.len()
            );
        }

        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn peer_ids(&self) -> &[NodeId] {
        &self.peer_ids
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn role(&self) -> NodeRole {
        self.state.role
    }

    pub fn current_term(&self) -> Term {
        self.state.current_term
    }

    pub fn is_leader(&self) -> bool {
        self.state.role == NodeRole::Leader
    }

    pub fn is_dead(&self) -> bool {
        self.state.role == NodeRole::Dead
    }

    pub fn next_index(&self, peer: NodeId) -> Option<usize> {
        self.next_index.get(&peer).copied()
    }

    pub fn match_index(&self, peer: NodeId) -> Option<usize> {
        self.match_index.get(&peer).copied().flatten()
    }

    pub fn report(&self) -> (NodeId, Term, bool) {
        (self.id, self.state.current_term, self.is_leader())
    }

    pub fn take_effects(&mut self) -> Effects {
        std::mem::take(&mut self.effects)
    }

    pub fn reset_election_clock(&mut self) {
        self.election_reset_time = Instant::now();
    }

    pub fn election_elapsed(&self) -> Duration {
        self.election_reset_time.elapsed()
    }

    fn has_quorum(&self, count: usize) -> bool {
        count * 2 > self.peer_ids.len() + 1
    }

    pub fn stop(&mut self) {
        self.state.role = NodeRole::Dead;
        info!("[{}] becomes Dead", self.id);
    }

    pub fn become_follower(&mut self, term: Term) {
        info!("[{}] becomes Follower term={}", self.id, term);
        self.state.role = NodeRole::Follower;
        self.state.current_term = term;
        self.state.voted_for = None;
        self.reset_election_clock();
        self.effects.restart_election_timer = true;
    }

    /// Starts a new election and returns the request to fan out to every peer.
    /// `None` means the node could not persist its vote and halted.
    pub fn start_election(&mut self) -> Option<RequestVoteArgs> {
        self.state.role = NodeRole::Candidate;
        self.state.current_term += 1;
        self.state.voted_for = Some(self.id);
        self.votes_received = 1;
        self.reset_election_clock();
        self.effects.restart_election_timer = true;
        info!(
            "[{}] becomes Candidate (currentTerm={})",
            self.id, self.state.current_term
        );

        if self.persist_or_halt().is_err() {
            return None;
        }

        let (last_log_index, last_log_term) = self.log.last_index_and_term();
        let args = RequestVoteArgs {
            term: self.state.current_term,
            candidate_id: self.id,
            last_log_index,
            last_log_term,
        };

        if self.has_quorum(self.votes_received) {
            info!("[{}] wins election unopposed", self.id);
            self.become_leader();
        }

        Some(args)
    }

    pub fn become_leader(&mut self) {
        self.state.role = NodeRole::Leader;
        for &peer in &self.peer_ids {
            self.next_index.insert(peer, self.log.len());
            self.match_index.insert(peer, None);
        }
        self.effects.start_replication = true;
        info!(
            "[{}] becomes Leader (term={}, nextIndex={:?}, log_len={})",
            self.id,
            self.state.current_term,
            self.next_index,
            self.log.len()
        );
    }

    pub fn handle_vote_reply(&mut self, term_sent: Term, reply: RequestVoteReply) {
        if self.is_dead() {
            return;
        }
        debug!("[{}] received RequestVoteReply {:?}", self.id, reply);

        if reply.term > self.state.current_term {
            debug!("[{}] term out of date in RequestVoteReply", self.id);
            self.become_follower(reply.term);
            return;
        }

        if self.state.role != NodeRole::Candidate || self.state.current_term != term_sent {
            debug!(
                "[{}] while waiting for reply, state={} term={}",
                self.id, self.state.role, self.state.current_term
            );
            return;
        }

        if reply.term == term_sent && reply.vote_granted {
            self.votes_received += 1;
            if self.has_quorum(self.votes_received) {
                info!(
                    "[{}] wins election with {} votes",
                    self.id, self.votes_received
                );
                self.become_leader();
            }
        }
    }

    pub fn handle_request_vote(
        &mut self,
        args: &RequestVoteArgs,
    ) -> Result<RequestVoteReply, RaftError> {
        if self.is_dead() {
            return Err(RaftError::NotRunning);
        }

        let (last_log_index, last_log_term) = self.log.last_index_and_term();
        debug!(
            "[{}] RequestVote: {:?} [currentTerm={}, votedFor={:?}, log index/term=({:?}, {:?})]",
            self.id,
            args,
            self.state.current_term,
            self.state.voted_for,
            last_log_index,
            last_log_term
        );

        if args.term > self.state.current_term {
            debug!("[{}] term out of date in RequestVote", self.id);
            self.become_follower(args.term);
        }

        let can_vote = self
            .state
            .voted_for
            .map_or(true, |voted| voted == args.candidate_id);
        let log_up_to_date =
            (args.last_log_term, args.last_log_index) >= (last_log_term, last_log_index);

        let mut reply = RequestVoteReply {
            term: self.state.current_term,
            vote_granted: false,
        };
        if args.term == self.state.current_term && can_vote && log_up_to_date {
            reply.vote_granted = true;
            self.state.voted_for = Some(args.candidate_id);
            self.reset_election_clock();
        }

        self.persist_or_halt()?;
        debug!("[{}] RequestVote reply: {:?}", self.id, reply);
        Ok(reply)
    }

    pub fn handle_append_entries(
        &mut self,
        args: &AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError> {
        if self.is_dead() {
            return Err(RaftError::NotRunning);
        }
        debug!(
            "[{}] AppendEntries: term={} leader={} prev=({:?}, {:?}) entries={} commit={:?} [currentTerm={}]",
            self.id,
            args.term,
            args.leader_id,
            args.prev_log_index,
            args.prev_log_term,
            args.entries.len(),
            args.leader_commit,
            self.state.current_term
        );

        if args.term > self.state.current_term {
            debug!("[{}] term out of date in AppendEntries", self.id);
            self.become_follower(args.term);
        }

        let mut reply = AppendEntriesReply::default();
        if args.term == self.state.current_term {
            if self.state.role != NodeRole::Follower {
                // Same term: keep the vote, the running watchdog still applies.
                info!(
                    "[{}] becomes Follower term={} (leader {})",
                    self.id, args.term, args.leader_id
                );
                self.state.role = NodeRole::Follower;
            }
            self.reset_election_clock();

            if self.log.matches(args.prev_log_index, args.prev_log_term) {
                reply.success = true;
                if self.log.merge(args.prev_log_index, &args.entries) {
                    debug!(
                        "[{}] AppendEntries: log now has {} entries",
                        self.id,
                        self.log.len()
                    );
                }

                if args.leader_commit > self.state.commit_index {
                    let new_commit = args.leader_commit.min(self.log.last_index());
                    if new_commit > self.state.commit_index {
                        self.state.commit_index = new_commit;
                        debug!(
                            "[{}] AppendEntries: setting commitIndex={:?}",
                            self.id, new_commit
                        );
                        self.effects.commit_ready = true;
                    }
                }
            } else if let Some(prev_index) = args.prev_log_index {
                let (conflict_index, conflict_term) = self.log.conflict_hint(prev_index);
                reply.conflict_index = conflict_index;
                reply.conflict_term = conflict_term;
            }
        }

        reply.term = self.state.current_term;
        self.persist_or_halt()?;
        debug!("[{}] AppendEntries reply: {:?}", self.id, reply);
        Ok(reply)
    }

    /// Builds the AppendEntries request for `peer`, or `None` once this node is
    /// no longer leader for `term`.
    pub fn prepare_append(&self, peer: NodeId, term: Term) -> Option<AppendEntriesArgs> {
        if !self.is_leader() || self.state.current_term != term {
            return None;
        }

        let next = self.next_index.get(&peer).copied()?;
        let prev_log_index = next.checked_sub(1);
        let prev_log_term = prev_log_index.and_then(|i| self.log.term_at(i));

        Some(AppendEntriesArgs {
            term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(next),
            leader_commit: self.state.commit_index,
        })
    }

    pub fn handle_append_reply(
        &mut self,
        peer: NodeId,
        sent: &AppendEntriesArgs,
        reply: AppendEntriesReply,
    ) {
        if self.is_dead() {
            return;
        }

        if reply.term > self.state.current_term {
            debug!("[{}] term out of date in heartbeat reply", self.id);
            self.become_follower(reply.term);
            return;
        }

        if !self.is_leader() || self.state.current_term != sent.term || reply.term != sent.term {
            return;
        }

        let sent_next = sent.prev_log_index.map_or(0, |i| i + 1);
        if reply.success {
            let sent_end = sent_next + sent.entries.len();
            let matched = sent_end.checked_sub(1);
            let next = self.next_index(peer).map_or(sent_end, |n| n.max(sent_end));
            self.next_index.insert(peer, next);
            let best = self.match_index(peer).max(matched);
            self.match_index.insert(peer, best);
            debug!(
                "[{}] AppendEntries reply from {} success: nextIndex := {}, matchIndex := {:?}",
                self.id, peer, next, best
            );
            self.advance_commit_index();
        } else {
            let hinted = match reply.conflict_term {
                Some(term) => match self.log.last_index_of_term(term) {
                    Some(last) => last + 1,
                    None => reply.conflict_index,
                },
                None => reply.conflict_index,
            };
            // A hint that does not move backwards degrades to single-step backtracking.
            let next = if hinted < sent_next {
                hinted
            } else {
                sent_next.saturating_sub(1)
            };
            self.next_index.insert(peer, next.min(self.log.len()));
            debug!(
                "[{}] AppendEntries reply from {} !success: nextIndex := {}",
                self.id, peer, next
            );
        }
    }

    /// Raises the commit index to the highest current-term entry replicated on a
    /// majority. Entries from earlier terms are only committed transitively.
    pub fn advance_commit_index(&mut self) {
        if !self.is_leader() {
            return;
        }

        let saved = self.state.commit_index;
        let start = saved.map_or(0, |i| i + 1);
        for index in start..self.log.len() {
            if self.log.term_at(index) != Some(self.state.current_term) {
                continue;
            }
            let replicated = 1 + self
                .peer_ids
                .iter()
                .filter(|peer| self.match_index(**peer) >= Some(index))
                .count();
            if self.has_quorum(replicated) {
                self.state.commit_index = Some(index);
            }
        }

        if self.state.commit_index != saved {
            info!(
                "[{}] leader sets commitIndex := {:?}",
                self.id, self.state.commit_index
            );
            self.effects.commit_ready = true;
            self.effects.trigger_replication = true;
        }
    }

    /// Appends a client command when leader. Returns false without side effects otherwise.
    pub fn submit(&mut self, command: Vec<u8>) -> bool {
        debug!(
            "[{}] Submit received by {}: {} bytes",
            self.id,
            self.state.role,
            command.len()
        );
        if !self.is_leader() {
            return false;
        }

        let index = self.log.append(LogEntry::new(self.state.current_term, command));
        if self.persist_or_halt().is_err() {
            return false;
        }
        debug!("[{}] ... appended at index {}", self.id, index);

        self.effects.trigger_replication = true;
        // Only a cluster without peers can commit here.
        self.advance_commit_index();
        true
    }

    /// Moves `last_applied` up to `commit_index` and returns the entries in between.
    pub fn take_commit_batch(&mut self) -> Vec<CommitEntry> {
        let Some(commit) = self.state.commit_index else {
            return Vec::new();
        };
        if self.state.last_applied >= Some(commit) {
            return Vec::new();
        }

        let first = self.state.last_applied.map_or(0, |i| i + 1);
        let entries = self.log.range_after(self.state.last_applied, commit);
        self.state.last_applied = Some(commit);

        entries
            .into_iter()
            .enumerate()
            .map(|(offset, entry)| CommitEntry {
                index: first + offset,
                term: entry.term,
                command: entry.command,
            })
            .collect()
    }

    fn persist_or_halt(&mut self) -> Result<(), RaftError> {
        if let Err(e) = self.persist_to_storage() {
            error!(
                "[{}] failed to persist state, halting node: {}",
                self.id, e
            );
            self.state.role = NodeRole::Dead;
            // Wake the notifier and driver so they observe the halt and exit.
            self.effects.commit_ready = true;
            self.effects.trigger_replication = true;
            return Err(e);
        }
        Ok(())
    }

    fn persist_to_storage(&self) -> Result<(), RaftError> {
        self.storage
            .set(CURRENT_TERM_KEY, encode(&self.state.current_term)?)?;
        self.storage
            .set(VOTED_FOR_KEY, encode(&self.state.voted_for)?)?;
        self.storage.set(LOG_KEY, encode(&self.log)?)?;
        Ok(())
    }

    fn restore_from_storage(&mut self) -> Result<(), RaftError> {
        self.state.current_term = self.load(CURRENT_TERM_KEY)?;
        self.state.voted_for = self.load(VOTED_FOR_KEY)?;
        self.log = self.load(LOG_KEY)?;
        Ok(())
    }

    fn load<T: DeserializeOwned>(&self, key: &'static str) -> Result<T, RaftError> {
        let bytes = self
            .storage
            .get(key)?
            .ok_or(RaftError::MissingState(key))?;
        decode(&bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RaftError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| RaftError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RaftError> {
    let (value, _): (T, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| RaftError::Serialization(e.to_string()))?;
    Ok(value)
}
