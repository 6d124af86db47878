use std::fmt;

use serde::{Deserialize, Serialize};

use super::{NodeId, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
    Dead,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::Follower => "Follower",
            NodeRole::Candidate => "Candidate",
            NodeRole::Leader => "Leader",
            NodeRole::Dead => "Dead",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub role: NodeRole,
    /// Highest index known to be committed, `None` before anything is.
    pub commit_index: Option<usize>,
    /// Highest index handed to the commit notifier.
    pub last_applied: Option<usize>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            role: NodeRole::Follower,
            commit_index: None,
            last_applied: None,
        }
    }
}
