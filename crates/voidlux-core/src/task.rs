//! Task entity and lifecycle states.

use crate::{AgentId, Lamport, NodeId, TaskId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Blocked on another task or external input.
    Blocked,
    /// Being decomposed by the emperor.
    Planning,
    /// Claimed by an agent; execution not yet started.
    Claimed,
    /// Being executed.
    InProgress,
    /// Finished; awaiting review by the emperor.
    PendingReview,
    /// Finished successfully. Terminal.
    Completed,
    /// Failed. Terminal.
    Failed,
    /// Paused waiting for user input.
    WaitingInput,
    /// Result is being merged.
    Merging,
    /// Cancelled. Terminal.
    Cancelled,
}

impl TaskStatus {
    /// Returns true for absorbing states that no update may leave.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States in which a task has no assignee.
    #[must_use]
    pub const fn is_unassigned(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Blocked | Self::Planning | Self::Cancelled
        )
    }

    /// The snake_case string form used in storage and on the wire.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Planning => "planning",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::PendingReview => "pending_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::WaitingInput => "waiting_input",
            Self::Merging => "merging",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "blocked" => Ok(Self::Blocked),
            "planning" => Ok(Self::Planning),
            "claimed" => Ok(Self::Claimed),
            "in_progress" => Ok(Self::InProgress),
            "pending_review" => Ok(Self::PendingReview),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "waiting_input" => Ok(Self::WaitingInput),
            "merging" => Ok(Self::Merging),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(crate::Error::invalid_input(
                "task_status",
                format!("unknown status '{other}'"),
            )),
        }
    }
}

/// The unit of work dispatched across the swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,
    /// Parent task when this is a decomposed subtask.
    pub parent_id: Option<TaskId>,
    /// Short human-readable title.
    pub title: String,
    /// Full description of the work.
    pub description: String,
    /// Instructions handed to the executing agent.
    pub work_instructions: String,
    /// Criteria the emperor reviews against.
    pub acceptance_criteria: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Higher runs first.
    pub priority: i32,
    /// Capabilities the executing agent must cover.
    pub required_capabilities: BTreeSet<String>,
    /// Node id of the creator.
    pub created_by: NodeId,
    /// Agent currently assigned, if any.
    pub assigned_to: Option<AgentId>,
    /// Node hosting the assigned agent.
    pub assigned_node: Option<NodeId>,
    /// Result text on completion.
    pub result: Option<String>,
    /// Failure reason on failure.
    pub error: Option<String>,
    /// Free-form progress note from the executing agent.
    pub progress: Option<String>,
    /// Project directory the task runs in.
    pub project_path: Option<String>,
    /// Extra context passed through to the agent.
    pub context: Option<String>,
    /// Lamport timestamp of the last mutation.
    pub lamport_ts: Lamport,
    /// When the task was claimed.
    pub claimed_at: Option<Timestamp>,
    /// When the task reached a terminal state.
    pub completed_at: Option<Timestamp>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last mutation time.
    pub updated_at: Timestamp,
    /// Branch the task's work lands on.
    pub git_branch: Option<String>,
}

impl Task {
    /// Creates a fresh pending task.
    #[must_use]
    pub fn new(title: impl Into<String>, description: impl Into<String>, created_by: NodeId) -> Self {
        let now = Timestamp::now();
        Self {
            id: TaskId::generate(),
            parent_id: None,
            title: title.into(),
            description: description.into(),
            work_instructions: String::new(),
            acceptance_criteria: String::new(),
            status: TaskStatus::Pending,
            priority: 0,
            required_capabilities: BTreeSet::new(),
            created_by,
            assigned_to: None,
            assigned_node: None,
            result: None,
            error: None,
            progress: None,
            project_path: None,
            context: None,
            lamport_ts: Lamport::ZERO,
            claimed_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            git_branch: None,
        }
    }

    /// Returns true once the task has reached an absorbing state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
