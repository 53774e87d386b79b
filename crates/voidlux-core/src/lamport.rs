//! Lamport timestamp value type and precedence rule.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A Lamport logical timestamp.
///
/// The clock itself lives in the gossip layer; this is the value that
/// travels on the wire and is persisted with every entity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lamport(pub u64);

impl Lamport {
    /// The zero timestamp, used before a node has witnessed any event.
    pub const ZERO: Self = Self(0);

    /// Returns the raw counter value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Lamport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns true when the incoming `(lamport, node_id)` pair takes
/// precedence over the local one.
///
/// Larger Lamport timestamp wins; equal timestamps fall back to the
/// lexical node-id comparison so that every node resolves concurrent
/// updates identically.
#[must_use]
pub fn wins(incoming: (Lamport, &NodeId), local: (Lamport, &NodeId)) -> bool {
    (incoming.0, incoming.1) > (local.0, local.1)
}
