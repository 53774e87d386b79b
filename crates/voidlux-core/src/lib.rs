//! # VoidLux Core
//!
//! Core types shared by every VoidLux crate: node and entity identifiers,
//! Lamport timestamps, wall-clock timestamps, node roles, the swarm
//! entities (tasks, agents, peers, proposals, upgrades), the event bus
//! payloads, and the common error type.
//!
//! This crate holds no behavior beyond the types themselves; the
//! coordination logic lives in the crates that consume it.

mod agent;
mod error;
mod event;
mod id;
mod lamport;
mod peer;
mod proposal;
mod role;
mod task;
mod timestamp;
mod upgrade;

pub use agent::{Agent, AgentStatus};
pub use error::{Error, Result};
pub use event::{AgentAction, SwarmEvent, TaskAction};
pub use id::{AgentId, NodeId, ProposalId, TaskId, UpgradeId};
pub use lamport::{wins, Lamport};
pub use peer::PeerInfo;
pub use proposal::{ConsensusLogEntry, Proposal, ProposalState};
pub use role::NodeRole;
pub use task::{Task, TaskStatus};
pub use timestamp::Timestamp;
pub use upgrade::{UpgradeRecord, UpgradeStatus};
