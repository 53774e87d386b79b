//! # VoidLux Tasks
//!
//! The task lifecycle engine: a queue whose claim is one conditional SQL
//! statement, a resolver that settles concurrent cross-node claims by
//! `(Lamport, node id)` precedence, orphan requeue at startup, and the
//! leader-only dispatcher that pushes work to capability-matched idle
//! agents.

mod claim;
mod dispatch;
mod queue;

pub use claim::QueueClaimResolver;
pub use dispatch::Dispatcher;
pub use queue::TaskQueue;
