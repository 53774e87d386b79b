//! Upgrade history record.

use crate::{Timestamp, UpgradeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome state of a rolling upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStatus {
    /// Recorded but not started.
    Pending,
    /// Rollout in progress.
    InProgress,
    /// All nodes updated and healthy.
    Success,
    /// Failure detected; updated nodes were reverted.
    RolledBack,
    /// Failed without a clean rollback.
    Failed,
}

impl UpgradeStatus {
    /// The snake_case string form used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UpgradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpgradeStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "rolled_back" => Ok(Self::RolledBack),
            "failed" => Ok(Self::Failed),
            other => Err(crate::Error::invalid_input(
                "upgrade_status",
                format!("unknown status '{other}'"),
            )),
        }
    }
}

/// One row of the seneschal's upgrade history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeRecord {
    /// Unique identifier.
    pub id: UpgradeId,
    /// Commit the cluster ran before the upgrade.
    pub from_commit: String,
    /// Commit the upgrade targets.
    pub to_commit: String,
    /// Outcome state.
    pub status: UpgradeStatus,
    /// Who or what started the upgrade.
    pub initiated_by: String,
    /// Failure detail, when the upgrade did not succeed.
    pub failure_reason: Option<String>,
    /// Number of nodes in scope.
    pub nodes_total: u32,
    /// Nodes successfully updated.
    pub nodes_updated: u32,
    /// Nodes reverted during rollback.
    pub nodes_rolled_back: u32,
    /// Start time.
    pub started_at: Timestamp,
    /// Completion time.
    pub completed_at: Option<Timestamp>,
}

impl UpgradeRecord {
    /// Creates a new in-progress record.
    #[must_use]
    pub fn new(
        from_commit: impl Into<String>,
        to_commit: impl Into<String>,
        initiated_by: impl Into<String>,
        nodes_total: u32,
    ) -> Self {
        Self {
            id: UpgradeId::generate(),
            from_commit: from_commit.into(),
            to_commit: to_commit.into(),
            status: UpgradeStatus::InProgress,
            initiated_by: initiated_by.into(),
            failure_reason: None,
            nodes_total,
            nodes_updated: 0,
            nodes_rolled_back: 0,
            started_at: Timestamp::now(),
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for status in [
            UpgradeStatus::Pending,
            UpgradeStatus::InProgress,
            UpgradeStatus::Success,
            UpgradeStatus::RolledBack,
            UpgradeStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<UpgradeStatus>().unwrap(), status);
        }
    }
}
