//! Node roles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The role a node plays in the swarm.
///
/// Roles are soft: a worker may be promoted to emperor by election. Only
/// the seneschal role is fixed by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Stable gateway: tracks the live emperor, owns upgrade history.
    Seneschal,
    /// Current leader: decomposes requests and dispatches tasks.
    Emperor,
    /// Hosts agents and executes claimed tasks.
    Worker,
}

impl NodeRole {
    /// Returns the lowercase string form used on the wire and in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Seneschal => "seneschal",
            Self::Emperor => "emperor",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seneschal" => Ok(Self::Seneschal),
            "emperor" => Ok(Self::Emperor),
            "worker" => Ok(Self::Worker),
            other => Err(crate::Error::invalid_input(
                "role",
                format!("unknown role '{other}'"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_string_roundtrip() {
        for role in [NodeRole::Seneschal, NodeRole::Emperor, NodeRole::Worker] {
            assert_eq!(role.as_str().parse::<NodeRole>().unwrap(), role);
        }
        assert!("king".parse::<NodeRole>().is_err());
    }
}
