//! # VoidLux Consensus
//!
//! Two cooperating pieces:
//!
//! - **Leader election** — emperor heartbeats, staleness-triggered
//!   candidacy, and deterministic convergence on the lexicographically
//!   lowest candidate id. One elector implementation, term-settled.
//! - **Quorum voting** — three-phase propose/vote/commit over the mesh
//!   with a persistent, per-node append-only log, a partition detector
//!   with hysteresis, and leader-lease-gated linearizable reads.
//!
//! Proposals made while partitioned are queued and replayed on healing;
//! every proposal expires 60 seconds after creation regardless.

mod election;
mod engine;
mod partition;
mod validator;

pub use election::{ElectionConfig, Elector, ElectorState, LeaderInfo};
pub use engine::{ConsensusEngine, ReadError};
pub use partition::PartitionDetector;
pub use validator::{AcceptAll, ProposalValidator};
