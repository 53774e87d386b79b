//! # VoidLux Wire Format
//!
//! Typed envelopes for every P2P message, a closed 16-bit opcode
//! namespace, and the length-prefixed frame codec used on every TCP
//! connection.
//!
//! On the wire each message is:
//!
//! ```text
//! [ length: u32 BE ][ opcode: u16 BE ][ payload: JSON ]
//! ```
//!
//! where `length` counts the opcode and payload bytes. Frames larger
//! than [`MAX_FRAME_SIZE`] are rejected as protocol violations.

mod error;
mod framing;
mod message;
mod opcode;

pub use error::{Result, WireError};
pub use framing::{encode_frame, FrameDecoder, MAX_FRAME_SIZE};
pub use message::{
    AgentDeregister, AgentHeartbeat, AgentRegister, AgentSyncReq, AgentSyncRsp, AuthChallenge,
    AuthReject, AuthResponse, CensusRequest, ConsensusAbort, ConsensusCommit, ConsensusPropose,
    ConsensusSyncReq, ConsensusSyncRsp, ConsensusVote, DhtAnnounce, DhtLookup, DhtLookupRsp,
    ElectionStart, ElectionVictory, EmperorHeartbeat, Hello, Message, Pex, PexEntry, Ping, Pong,
    TaskAssign, TaskCancel, TaskClaim, TaskComplete, TaskCreate, TaskFail, TaskSyncReq,
    TaskSyncRsp, TaskUpdate, UpgradeHealth, UpgradeReport, UpgradeRequest,
};
pub use opcode::Opcode;
