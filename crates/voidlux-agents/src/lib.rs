//! # VoidLux Agents
//!
//! The agent registry and monitor. Agents are coding-tool sessions
//! owned by exactly one node; owners heartbeat them to the swarm, poll
//! their liveness through the session bridge, execute assignments from
//! the emperor, and recover the tasks of agents that die.

mod bridge;
mod registry;

pub use bridge::{AgentBridge, NullBridge};
pub use registry::AgentRegistry;
