//! Event bus payloads consumed by the control plane and dashboard.

use crate::{Agent, NodeId, Task};
use serde::{Deserialize, Serialize};

/// What happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Created,
    Claimed,
    Updated,
    Completed,
    Failed,
    Cancelled,
    Requeued,
}

/// What happened to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentAction {
    Registered,
    Heartbeat,
    Deregistered,
}

/// Events published on the node's broadcast bus.
///
/// The HTTP layer subscribes to these and forwards them to WebSocket
/// clients; nothing inside the core depends on anyone listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SwarmEvent {
    /// A task changed.
    Task {
        /// What happened.
        action: TaskAction,
        /// The task after the change.
        task: Box<Task>,
    },
    /// An agent changed.
    Agent {
        /// What happened.
        action: AgentAction,
        /// The agent after the change.
        agent: Box<Agent>,
    },
    /// A new leader was accepted.
    LeaderChanged {
        /// The new emperor, or none while the throne is vacant.
        leader: Option<NodeId>,
        /// The term the leader holds.
        term: u64,
    },
    /// A peer authenticated and joined the mesh view.
    PeerConnected {
        /// The peer's node id.
        node_id: NodeId,
    },
    /// A peer disconnected or was pruned.
    PeerDisconnected {
        /// The peer's node id.
        node_id: NodeId,
    },
}
