use serde::{Deserialize, Serialize};

use super::{LogEntry, NodeId, Term};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: Option<usize>,
    pub last_log_term: Option<Term>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicates entries after `prev_log_index`; with no entries it is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: Option<usize>,
    pub prev_log_term: Option<Term>,
    pub entries: Vec<LogEntry>,
    pub leader_commit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
    pub conflict_index: usize,
    pub conflict_term: Option<Term>,
}

/// Request envelope handed to a [`crate::network::Transport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftResponse {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
}

impl RaftRequest {
    pub fn operation_name(&self) -> &'static str {
        match self {
            RaftRequest::RequestVote(_) => "RequestVote",
            RaftRequest::AppendEntries(_) => "AppendEntries",
        }
    }
}

impl RaftResponse {
    pub fn operation_name(&self) -> &'static str {
        match self {
            RaftResponse::RequestVote(_) => "RequestVote",
            RaftResponse::AppendEntries(_) => "AppendEntries",
        }
    }

    pub fn into_request_vote(self) -> Option<RequestVoteReply> {
        match self {
            RaftResponse::RequestVote(reply) => Some(reply),
            RaftResponse::AppendEntries(_) => None,
        }
    }

    pub fn into_append_entries(self) -> Option<AppendEntriesReply> {
        match self {
            RaftResponse::AppendEntries(reply) => Some(reply),
            RaftResponse::RequestVote(_) => None,
        }
    }
}
