//! # VoidLux Node
//!
//! The construction root. Opens the per-node stores, builds the mesh,
//! discovery, gossip, election, consensus, queue, dispatcher, registry,
//! and upgrade coordinator, wires the seams between them, and exposes
//! the surface the HTTP control plane calls.

pub mod config;
pub mod logging;
pub mod node;

pub use config::NodeConfig;
pub use node::Node;
