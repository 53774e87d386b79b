//! Identifier types for VoidLux entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A 128-bit random node identifier, encoded as 32 lowercase hex characters.
///
/// `Ord` compares the raw bytes, which is identical to comparing the hex
/// encoding lexically; elections and conflict resolution rely on this.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; 16]);

impl NodeId {
    /// The length of a node id in bytes.
    pub const LEN: usize = 16;

    /// Generates a fresh random node id.
    #[must_use]
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates a node id from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parses a node id from its 32-character hex encoding.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let decoded = hex::decode(s)
            .map_err(|e| crate::Error::invalid_input("node_id", e.to_string()))?;
        if decoded.len() != Self::LEN {
            return Err(crate::Error::invalid_input(
                "node_id",
                format!("expected {} bytes, got {}", Self::LEN, decoded.len()),
            ));
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Returns the full hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns a short hex prefix for log output.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for NodeId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random (v4) identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| crate::Error::invalid_input(stringify!($name), e.to_string()))
            }
        }
    };
}

uuid_id! {
    /// Identifier of a task.
    TaskId
}

uuid_id! {
    /// Identifier of an agent session.
    AgentId
}

uuid_id! {
    /// Identifier of a consensus proposal.
    ProposalId
}

uuid_id! {
    /// Identifier of an upgrade run.
    UpgradeId
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn node_id_hex_roundtrip() {
        let id = NodeId::generate();
        let parsed = NodeId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_hex().len(), 32);
    }

    #[test]
    fn node_id_rejects_bad_hex() {
        assert!(NodeId::from_hex("zz").is_err());
        assert!(NodeId::from_hex("abcd").is_err());
    }

    #[test]
    fn node_id_byte_order_matches_hex_order() {
        let a = NodeId::from_bytes([0u8; 16]);
        let b = NodeId::from_bytes([0xff; 16]);
        assert!(a < b);
        assert!(a.to_hex() < b.to_hex());
    }

    #[test]
    fn node_id_serde_as_hex_string() {
        let id = NodeId::from_bytes([0xab; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(16)));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn task_id_parse_roundtrip() {
        let id = TaskId::generate();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
