//! Consensus proposals and the replicated log entry.

use crate::{Lamport, NodeId, ProposalId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    /// Created but not yet broadcast.
    Pending,
    /// Broadcast; votes are being collected.
    Voting,
    /// Quorum reached; appended to the log. Terminal.
    Committed,
    /// Rejected or timed out. Terminal.
    Aborted,
    /// Expired before resolution. Terminal.
    Expired,
}

impl ProposalState {
    /// The snake_case string form used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Voting => "voting",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "voting" => Ok(Self::Voting),
            "committed" => Ok(Self::Committed),
            "aborted" => Ok(Self::Aborted),
            "expired" => Ok(Self::Expired),
            other => Err(crate::Error::invalid_input(
                "proposal_state",
                format!("unknown state '{other}'"),
            )),
        }
    }
}

/// A distributed decision put to a quorum vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    /// Unique identifier; commits are idempotent by this id.
    pub id: ProposalId,
    /// Term the proposal was made in. Never decreases.
    pub term: u64,
    /// Log position, assigned on commit.
    pub log_index: Option<u64>,
    /// The proposing node.
    pub proposer_node_id: NodeId,
    /// Operation name, e.g. `membership_change` or `config_change`.
    pub operation: String,
    /// Operation-specific payload, opaque to the consensus layer.
    pub payload: serde_json::Value,
    /// Lamport timestamp at proposal time.
    pub lamport_ts: Lamport,
    /// Current state.
    pub state: ProposalState,
    /// Nodes that voted yes (proposer self-votes).
    pub votes_for: BTreeSet<NodeId>,
    /// Nodes that voted no.
    pub votes_against: BTreeSet<NodeId>,
    /// Votes needed to commit: majority of the known cluster.
    pub quorum_required: usize,
    /// Creation time.
    pub created_at: Timestamp,
    /// Commit time, once committed.
    pub committed_at: Option<Timestamp>,
}

impl Proposal {
    /// Creates a new proposal in `Pending` state.
    #[must_use]
    pub fn new(
        proposer_node_id: NodeId,
        term: u64,
        operation: impl Into<String>,
        payload: serde_json::Value,
        quorum_required: usize,
    ) -> Self {
        Self {
            id: ProposalId::generate(),
            term,
            log_index: None,
            proposer_node_id,
            operation: operation.into(),
            payload,
            lamport_ts: Lamport::ZERO,
            state: ProposalState::Pending,
            votes_for: BTreeSet::new(),
            votes_against: BTreeSet::new(),
            quorum_required,
            created_at: Timestamp::now(),
            committed_at: None,
        }
    }

    /// Returns true once enough yes votes have arrived.
    #[must_use]
    pub fn has_quorum(&self) -> bool {
        self.votes_for.len() >= self.quorum_required
    }

    /// Returns true once enough no votes have arrived to make commit
    /// impossible to justify.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.votes_against.len() >= self.quorum_required
    }
}

/// An entry in the append-only consensus log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusLogEntry {
    /// Proposal id. Unique within the log.
    pub id: ProposalId,
    /// Term the proposal committed in.
    pub term: u64,
    /// Position in the log. Strictly monotone per node.
    pub log_index: u64,
    /// The proposing node.
    pub proposer_node_id: NodeId,
    /// Operation name.
    pub operation: String,
    /// Operation payload.
    pub payload: serde_json::Value,
    /// Lamport timestamp of the proposal.
    pub lamport_ts: Lamport,
    /// When the entry committed.
    pub committed_at: Timestamp,
}

impl ConsensusLogEntry {
    /// Builds the log entry for a committed proposal.
    #[must_use]
    pub fn from_proposal(proposal: &Proposal, log_index: u64) -> Self {
        Self {
            id: proposal.id,
            term: proposal.term,
            log_index,
            proposer_node_id: proposal.proposer_node_id,
            operation: proposal.operation.clone(),
            payload: proposal.payload.clone(),
            lamport_ts: proposal.lamport_ts,
            committed_at: Timestamp::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn quorum_counting() {
        let mut p = Proposal::new(
            NodeId::generate(),
            1,
            "config_change",
            serde_json::json!({"x": 1}),
            2,
        );
        assert!(!p.has_quorum());

        p.votes_for.insert(NodeId::generate());
        assert!(!p.has_quorum());

        p.votes_for.insert(NodeId::generate());
        assert!(p.has_quorum());
    }

    #[test]
    fn duplicate_votes_count_once() {
        let mut p = Proposal::new(NodeId::generate(), 1, "op", serde_json::Value::Null, 2);
        let voter = NodeId::generate();
        p.votes_for.insert(voter);
        p.votes_for.insert(voter);
        assert_eq!(p.votes_for.len(), 1);
    }

    #[test]
    fn state_string_roundtrip() {
        for state in [
            ProposalState::Pending,
            ProposalState::Voting,
            ProposalState::Committed,
            ProposalState::Aborted,
            ProposalState::Expired,
        ] {
            assert_eq!(state.as_str().parse::<ProposalState>().unwrap(), state);
        }
    }
}
