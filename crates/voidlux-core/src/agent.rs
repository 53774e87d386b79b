//! Agent entity.

use crate::{AgentId, Lamport, NodeId, TaskId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Session is launching.
    Starting,
    /// Ready for work.
    Idle,
    /// Executing a task.
    Busy,
    /// No longer reachable.
    Offline,
}

impl AgentStatus {
    /// The snake_case string form used in storage and on the wire.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            other => Err(crate::Error::invalid_input(
                "agent_status",
                format!("unknown status '{other}'"),
            )),
        }
    }
}

/// A coding-tool session hosted on exactly one node.
///
/// Invariant: `status == Busy` if and only if `current_task_id` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier.
    pub id: AgentId,
    /// The owning node. Only this node may delete the agent.
    pub node_id: NodeId,
    /// Display name.
    pub name: String,
    /// The coding tool backing the session.
    pub tool: String,
    /// Model identifier the session runs.
    pub model: String,
    /// Capabilities offered for task matching.
    pub capabilities: BTreeSet<String>,
    /// Project directory the agent works in.
    pub project_path: Option<String>,
    /// Upper bound on concurrently assigned tasks.
    pub max_concurrent_tasks: u32,
    /// Current lifecycle state.
    pub status: AgentStatus,
    /// Task currently being executed, if busy.
    pub current_task_id: Option<TaskId>,
    /// Last heartbeat received from the owner.
    pub last_heartbeat: Timestamp,
    /// Lamport timestamp of the last mutation.
    pub lamport_ts: Lamport,
    /// Registration time.
    pub registered_at: Timestamp,
}

impl Agent {
    /// Creates a fresh idle agent owned by `node_id`.
    #[must_use]
    pub fn new(name: impl Into<String>, tool: impl Into<String>, node_id: NodeId) -> Self {
        let now = Timestamp::now();
        Self {
            id: AgentId::generate(),
            node_id,
            name: name.into(),
            tool: tool.into(),
            model: String::new(),
            capabilities: BTreeSet::new(),
            project_path: None,
            max_concurrent_tasks: 1,
            status: AgentStatus::Idle,
            current_task_id: None,
            last_heartbeat: now,
            lamport_ts: Lamport::ZERO,
            registered_at: now,
        }
    }

    /// Returns true when the agent can accept a task requiring `needed`.
    #[must_use]
    pub fn covers(&self, needed: &BTreeSet<String>) -> bool {
        needed.iter().all(|cap| self.capabilities.contains(cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for status in [
            AgentStatus::Starting,
            AgentStatus::Idle,
            AgentStatus::Busy,
            AgentStatus::Offline,
        ] {
            assert_eq!(status.as_str().parse::<AgentStatus>().unwrap(), status);
        }
    }

    #[test]
    fn capability_cover() {
        let mut agent = Agent::new("a1", "claude", NodeId::generate());
        agent.capabilities = ["rust".to_string(), "python".to_string()].into();

        let empty = BTreeSet::new();
        assert!(agent.covers(&empty));

        let rust: BTreeSet<String> = ["rust".to_string()].into();
        assert!(agent.covers(&rust));

        let go: BTreeSet<String> = ["go".to_string()].into();
        assert!(!agent.covers(&go));
    }
}
