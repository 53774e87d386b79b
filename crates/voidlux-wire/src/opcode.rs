//! The closed opcode namespace.

use crate::WireError;
use std::fmt;

/// Message type discriminator. The namespace is closed: decoding any
/// value outside this table is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    // Transport
    Hello = 0x0001,
    Ping = 0x0002,
    Pong = 0x0003,

    // Auth
    AuthChallenge = 0x0010,
    AuthResponse = 0x0011,
    AuthReject = 0x0012,

    // Discovery
    Pex = 0x0020,
    DhtDiscLookup = 0x0021,
    DhtDiscLookupRsp = 0x0022,
    DhtDiscAnnounce = 0x0023,

    // Tasks
    TaskCreate = 0x0030,
    TaskClaim = 0x0031,
    TaskUpdate = 0x0032,
    TaskComplete = 0x0033,
    TaskFail = 0x0034,
    TaskCancel = 0x0035,
    TaskAssign = 0x0036,
    TaskSyncReq = 0x0037,
    TaskSyncRsp = 0x0038,

    // Agents
    AgentRegister = 0x0040,
    AgentHeartbeat = 0x0041,
    AgentDeregister = 0x0042,
    AgentSyncReq = 0x0043,
    AgentSyncRsp = 0x0044,

    // Election
    EmperorHeartbeat = 0x0050,
    ElectionStart = 0x0051,
    ElectionVictory = 0x0052,
    CensusRequest = 0x0053,

    // Consensus
    ConsensusPropose = 0x0060,
    ConsensusVote = 0x0061,
    ConsensusCommit = 0x0062,
    ConsensusAbort = 0x0063,
    ConsensusSyncReq = 0x0064,
    ConsensusSyncRsp = 0x0065,

    // Upgrade
    UpgradeRequest = 0x0070,
    UpgradeStatus = 0x0071,
}

impl Opcode {
    /// Parses an opcode from its wire value.
    pub fn from_u16(value: u16) -> Result<Self, WireError> {
        match value {
            0x0001 => Ok(Self::Hello),
            0x0002 => Ok(Self::Ping),
            0x0003 => Ok(Self::Pong),
            0x0010 => Ok(Self::AuthChallenge),
            0x0011 => Ok(Self::AuthResponse),
            0x0012 => Ok(Self::AuthReject),
            0x0020 => Ok(Self::Pex),
            0x0021 => Ok(Self::DhtDiscLookup),
            0x0022 => Ok(Self::DhtDiscLookupRsp),
            0x0023 => Ok(Self::DhtDiscAnnounce),
            0x0030 => Ok(Self::TaskCreate),
            0x0031 => Ok(Self::TaskClaim),
            0x0032 => Ok(Self::TaskUpdate),
            0x0033 => Ok(Self::TaskComplete),
            0x0034 => Ok(Self::TaskFail),
            0x0035 => Ok(Self::TaskCancel),
            0x0036 => Ok(Self::TaskAssign),
            0x0037 => Ok(Self::TaskSyncReq),
            0x0038 => Ok(Self::TaskSyncRsp),
            0x0040 => Ok(Self::AgentRegister),
            0x0041 => Ok(Self::AgentHeartbeat),
            0x0042 => Ok(Self::AgentDeregister),
            0x0043 => Ok(Self::AgentSyncReq),
            0x0044 => Ok(Self::AgentSyncRsp),
            0x0050 => Ok(Self::EmperorHeartbeat),
            0x0051 => Ok(Self::ElectionStart),
            0x0052 => Ok(Self::ElectionVictory),
            0x0053 => Ok(Self::CensusRequest),
            0x0060 => Ok(Self::ConsensusPropose),
            0x0061 => Ok(Self::ConsensusVote),
            0x0062 => Ok(Self::ConsensusCommit),
            0x0063 => Ok(Self::ConsensusAbort),
            0x0064 => Ok(Self::ConsensusSyncReq),
            0x0065 => Ok(Self::ConsensusSyncRsp),
            0x0070 => Ok(Self::UpgradeRequest),
            0x0071 => Ok(Self::UpgradeStatus),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }

    /// Returns true for messages a connection may exchange before it has
    /// authenticated.
    #[must_use]
    pub const fn allowed_pre_auth(&self) -> bool {
        matches!(
            self,
            Self::Hello
                | Self::AuthChallenge
                | Self::AuthResponse
                | Self::AuthReject
                | Self::Ping
                | Self::Pong
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrip() {
        for op in [
            Opcode::Hello,
            Opcode::Ping,
            Opcode::Pong,
            Opcode::AuthChallenge,
            Opcode::AuthResponse,
            Opcode::AuthReject,
            Opcode::Pex,
            Opcode::DhtDiscLookup,
            Opcode::DhtDiscLookupRsp,
            Opcode::DhtDiscAnnounce,
            Opcode::TaskCreate,
            Opcode::TaskClaim,
            Opcode::TaskUpdate,
            Opcode::TaskComplete,
            Opcode::TaskFail,
            Opcode::TaskCancel,
            Opcode::TaskAssign,
            Opcode::TaskSyncReq,
            Opcode::TaskSyncRsp,
            Opcode::AgentRegister,
            Opcode::AgentHeartbeat,
            Opcode::AgentDeregister,
            Opcode::AgentSyncReq,
            Opcode::AgentSyncRsp,
            Opcode::EmperorHeartbeat,
            Opcode::ElectionStart,
            Opcode::ElectionVictory,
            Opcode::CensusRequest,
            Opcode::ConsensusPropose,
            Opcode::ConsensusVote,
            Opcode::ConsensusCommit,
            Opcode::ConsensusAbort,
            Opcode::ConsensusSyncReq,
            Opcode::ConsensusSyncRsp,
            Opcode::UpgradeRequest,
            Opcode::UpgradeStatus,
        ] {
            assert_eq!(Opcode::from_u16(op as u16).unwrap(), op);
        }
    }

    #[test]
    fn unknown_opcode_rejected() {
        assert!(Opcode::from_u16(0x0000).is_err());
        assert!(Opcode::from_u16(0xffff).is_err());
        assert!(Opcode::from_u16(0x0100).is_err());
    }

    #[test]
    fn pre_auth_allowlist() {
        assert!(Opcode::Hello.allowed_pre_auth());
        assert!(Opcode::Ping.allowed_pre_auth());
        assert!(!Opcode::TaskCreate.allowed_pre_auth());
        assert!(!Opcode::ConsensusPropose.allowed_pre_auth());
    }
}
