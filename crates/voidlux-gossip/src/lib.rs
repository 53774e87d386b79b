//! # VoidLux Gossip
//!
//! Causal-ordered epidemic dissemination: a Lamport clock, a bounded
//! seen-message cache, typed push-broadcast helpers for every task and
//! agent event, and pull-based anti-entropy for catch-up sync.
//!
//! Dedup is correctness-critical. Every received message is keyed by
//! `(type, entity id, action)`; a key seen before is dropped on arrival,
//! otherwise the message is applied locally and re-flooded to every peer
//! except the sender. Without the cache the flood would loop forever.

mod clock;
mod dedup;
mod engine;

pub use clock::LamportClock;
pub use dedup::SeenCache;
pub use engine::{ClaimResolver, GossipEngine};
