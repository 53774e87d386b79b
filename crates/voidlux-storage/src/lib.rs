//! # VoidLux Storage
//!
//! Per-node embedded SQLite stores. Each node exclusively owns its local
//! database files; distribution happens above this layer via gossip and
//! anti-entropy, never by sharing files.
//!
//! Two databases per node:
//!
//! - `swarm-<p2p_port>.db` — `tasks`, `agents`, and the `swarm_state`
//!   key/value table (node id, persisted Lamport clock).
//! - `consensus-<node_id>.db` — the append-only `consensus_log` plus the
//!   seneschal's `upgrade_history`.
//!
//! Both run in WAL journal mode with normal synchronous writes. The
//! store is the single serialization point for entity mutations: claims
//! and status transitions execute as one conditional SQL statement each.

mod consensus;
mod error;
mod swarm;

pub use consensus::ConsensusStore;
pub use error::{Result, StorageError};
pub use swarm::SwarmStore;
