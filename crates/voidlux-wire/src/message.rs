//! Typed message envelopes for every opcode.

use crate::{Opcode, Result, WireError};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use voidlux_core::{
    Agent, AgentId, AgentStatus, ConsensusLogEntry, Lamport, NodeId, NodeRole, Proposal,
    ProposalId, Task, TaskId, Timestamp,
};

/// Peer introduction, sent by both sides immediately on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// The sender's node id.
    pub node_id: NodeId,
    /// The sender's P2P listen port (the source port of the TCP
    /// connection is ephemeral and useless for dialing back).
    pub p2p_port: u16,
    /// The sender's HTTP control-plane port.
    pub http_port: u16,
    /// The role the sender claims. Bound into the HMAC when auth is on.
    pub role: NodeRole,
}

/// Keepalive probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    /// Correlates the matching PONG.
    pub seq: u64,
}

/// Keepalive reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    /// Echo of the PING sequence number.
    pub seq: u64,
}

/// Auth step 2: the receiver challenges with a fresh nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthChallenge {
    /// 256-bit random nonce, hex encoded.
    pub nonce: String,
}

/// Auth step 3: proof of the shared secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    /// `hmac_sha256(secret, "voidlux:auth:v1:{nonce}:{node_id}:{role}")`, hex.
    pub hmac: String,
    /// Must match the HELLO node id.
    pub node_id: NodeId,
    /// Must match the HELLO role; cryptographically bound above.
    pub role: NodeRole,
}

/// Auth failure; the connection closes after this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthReject {
    /// Why the handshake failed.
    pub reason: String,
}

/// One peer entry exchanged via PEX and DHT responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PexEntry {
    /// The peer's node id.
    pub node_id: NodeId,
    /// Reachable host.
    pub host: String,
    /// P2P listen port.
    pub p2p_port: u16,
    /// Announced role.
    pub role: NodeRole,
}

/// Periodic peer-list exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pex {
    /// The sender's currently-connected peers.
    pub peers: Vec<PexEntry>,
}

/// Kademlia iterative lookup step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtLookup {
    /// The 128-bit key being located.
    pub target: NodeId,
    /// The querying node.
    pub from: NodeId,
}

/// Closest-known answer to a lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtLookupRsp {
    /// The key that was looked up.
    pub target: NodeId,
    /// Up to K entries closest to the target by XOR distance.
    pub closer: Vec<PexEntry>,
}

/// Self-announcement to the K closest peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtAnnounce {
    /// The announcing node.
    pub node_id: NodeId,
    /// Reachable host.
    pub host: String,
    /// P2P listen port.
    pub p2p_port: u16,
}

/// Gossip: a task was created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreate {
    /// The full task row.
    pub task: Task,
}

/// Gossip: a node claimed a task for one of its agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClaim {
    /// The claimed task.
    pub task_id: TaskId,
    /// The claiming agent.
    pub agent_id: AgentId,
    /// The node hosting the agent.
    pub node_id: NodeId,
    /// Lamport timestamp of the claim; concurrent claims resolve on this.
    pub lamport_ts: Lamport,
    /// Wall-clock claim time.
    pub claimed_at: Timestamp,
}

/// Gossip: a task row changed (full-row last-writer-wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    /// The task after the change.
    pub task: Task,
}

/// Gossip: a task completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskComplete {
    /// The completed task.
    pub task_id: TaskId,
    /// Result text.
    pub result: Option<String>,
    /// The node that completed it.
    pub node_id: NodeId,
    /// Lamport timestamp of the completion.
    pub lamport_ts: Lamport,
}

/// Gossip: a task failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFail {
    /// The failed task.
    pub task_id: TaskId,
    /// Failure reason.
    pub error: String,
    /// The node reporting the failure.
    pub node_id: NodeId,
    /// Lamport timestamp of the failure.
    pub lamport_ts: Lamport,
}

/// Gossip: a task was cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancel {
    /// The cancelled task.
    pub task_id: TaskId,
    /// The cancelling node.
    pub node_id: NodeId,
    /// Lamport timestamp of the cancellation.
    pub lamport_ts: Lamport,
}

/// Directed: the leader instructs an agent's host to execute a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssign {
    /// The task to execute.
    pub task_id: TaskId,
    /// The chosen agent.
    pub agent_id: AgentId,
    /// The node hosting the agent.
    pub node_id: NodeId,
}

/// Anti-entropy: request tasks newer than a Lamport watermark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSyncReq {
    /// Send rows with `lamport_ts > since_lamport`.
    pub since_lamport: Lamport,
    /// The requesting node.
    pub from: NodeId,
}

/// Anti-entropy: task rows, capped at 500 per response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSyncRsp {
    /// The rows.
    pub tasks: Vec<Task>,
}

/// Gossip: an agent registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegister {
    /// The full agent row.
    pub agent: Agent,
}

/// Gossip: periodic agent liveness from its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    /// The agent.
    pub agent_id: AgentId,
    /// The owning node.
    pub node_id: NodeId,
    /// Current status.
    pub status: AgentStatus,
    /// Task being executed, if busy.
    pub current_task_id: Option<TaskId>,
    /// Lamport timestamp of the heartbeat.
    pub lamport_ts: Lamport,
}

/// Gossip: an agent deregistered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDeregister {
    /// The agent.
    pub agent_id: AgentId,
    /// The owning node.
    pub node_id: NodeId,
    /// Lamport timestamp of the deregistration.
    pub lamport_ts: Lamport,
}

/// Anti-entropy: request the peer's full agent view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSyncReq {
    /// The requesting node.
    pub from: NodeId,
}

/// Anti-entropy: agent rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSyncRsp {
    /// The rows.
    pub agents: Vec<Agent>,
}

/// The leader asserts its term every 10 seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmperorHeartbeat {
    /// The leader's node id.
    pub node_id: NodeId,
    /// The term it holds.
    pub term: u64,
    /// Lamport timestamp of the heartbeat.
    pub lamport_ts: Lamport,
    /// Highest committed consensus log index, for catch-up hints.
    pub log_index: u64,
}

/// A follower announces its candidacy after heartbeat staleness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionStart {
    /// The candidate.
    pub node_id: NodeId,
    /// The term it runs in.
    pub term: u64,
    /// Highest committed consensus log index.
    pub log_index: u64,
    /// Lamport timestamp of the announcement.
    pub lamport_ts: Lamport,
}

/// The winning candidate claims the throne.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionVictory {
    /// The new leader.
    pub node_id: NodeId,
    /// The term it won.
    pub term: u64,
    /// Lamport timestamp of the victory.
    pub lamport_ts: Lamport,
}

/// The leader asks every owner to re-announce its agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CensusRequest {
    /// The requesting leader.
    pub from: NodeId,
}

/// A proposal is put to the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusPropose {
    /// The proposal, in `Voting` state.
    pub proposal: Proposal,
}

/// One node's vote on a proposal, addressed to the proposer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusVote {
    /// The proposal being voted on.
    pub proposal_id: ProposalId,
    /// The voting node.
    pub voter: NodeId,
    /// Yes or no.
    pub vote: bool,
    /// Validator-supplied reason for a no vote.
    pub reason: Option<String>,
    /// The voter's view of the term.
    pub term: u64,
    /// Lamport timestamp of the vote.
    pub lamport_ts: Lamport,
}

/// The proposer announces quorum was reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusCommit {
    /// The committed proposal, `log_index` assigned.
    pub proposal: Proposal,
}

/// The proposer announces the proposal died.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusAbort {
    /// The aborted proposal.
    pub proposal_id: ProposalId,
    /// Why it aborted.
    pub reason: String,
}

/// Anti-entropy: request log entries after an index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSyncReq {
    /// Send entries with `log_index > after_log_index`.
    pub after_log_index: u64,
    /// The requesting node.
    pub from: NodeId,
}

/// Anti-entropy: consensus log entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSyncRsp {
    /// The entries, ascending by index.
    pub entries: Vec<ConsensusLogEntry>,
}

/// The seneschal instructs a node to switch commits and restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeRequest {
    /// The node being upgraded.
    pub target_node: NodeId,
    /// The commit to switch to.
    pub target_commit: String,
    /// True when reverting a previous switch.
    pub rollback: bool,
}

/// Health outcome reported by an upgraded node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeHealth {
    /// Restart completed and the node is serving.
    Healthy,
    /// The new commit did not come up.
    Failed,
    /// Restart is underway.
    Restarting,
}

/// A node reports the outcome of an upgrade request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeReport {
    /// The reporting node.
    pub node_id: NodeId,
    /// Outcome.
    pub status: UpgradeHealth,
    /// Optional detail (error text, version string).
    pub detail: Option<String>,
}

/// Unified message enum: one variant per opcode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Hello(Hello),
    Ping(Ping),
    Pong(Pong),
    AuthChallenge(AuthChallenge),
    AuthResponse(AuthResponse),
    AuthReject(AuthReject),
    Pex(Pex),
    DhtLookup(DhtLookup),
    DhtLookupRsp(DhtLookupRsp),
    DhtAnnounce(DhtAnnounce),
    TaskCreate(TaskCreate),
    TaskClaim(TaskClaim),
    TaskUpdate(TaskUpdate),
    TaskComplete(TaskComplete),
    TaskFail(TaskFail),
    TaskCancel(TaskCancel),
    TaskAssign(TaskAssign),
    TaskSyncReq(TaskSyncReq),
    TaskSyncRsp(TaskSyncRsp),
    AgentRegister(AgentRegister),
    AgentHeartbeat(AgentHeartbeat),
    AgentDeregister(AgentDeregister),
    AgentSyncReq(AgentSyncReq),
    AgentSyncRsp(AgentSyncRsp),
    EmperorHeartbeat(EmperorHeartbeat),
    ElectionStart(ElectionStart),
    ElectionVictory(ElectionVictory),
    CensusRequest(CensusRequest),
    ConsensusPropose(ConsensusPropose),
    ConsensusVote(ConsensusVote),
    ConsensusCommit(ConsensusCommit),
    ConsensusAbort(ConsensusAbort),
    ConsensusSyncReq(ConsensusSyncReq),
    ConsensusSyncRsp(ConsensusSyncRsp),
    UpgradeRequest(UpgradeRequest),
    UpgradeStatus(UpgradeReport),
}

impl Message {
    /// The opcode this envelope travels under.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Hello(_) => Opcode::Hello,
            Self::Ping(_) => Opcode::Ping,
            Self::Pong(_) => Opcode::Pong,
            Self::AuthChallenge(_) => Opcode::AuthChallenge,
            Self::AuthResponse(_) => Opcode::AuthResponse,
            Self::AuthReject(_) => Opcode::AuthReject,
            Self::Pex(_) => Opcode::Pex,
            Self::DhtLookup(_) => Opcode::DhtDiscLookup,
            Self::DhtLookupRsp(_) => Opcode::DhtDiscLookupRsp,
            Self::DhtAnnounce(_) => Opcode::DhtDiscAnnounce,
            Self::TaskCreate(_) => Opcode::TaskCreate,
            Self::TaskClaim(_) => Opcode::TaskClaim,
            Self::TaskUpdate(_) => Opcode::TaskUpdate,
            Self::TaskComplete(_) => Opcode::TaskComplete,
            Self::TaskFail(_) => Opcode::TaskFail,
            Self::TaskCancel(_) => Opcode::TaskCancel,
            Self::TaskAssign(_) => Opcode::TaskAssign,
            Self::TaskSyncReq(_) => Opcode::TaskSyncReq,
            Self::TaskSyncRsp(_) => Opcode::TaskSyncRsp,
            Self::AgentRegister(_) => Opcode::AgentRegister,
            Self::AgentHeartbeat(_) => Opcode::AgentHeartbeat,
            Self::AgentDeregister(_) => Opcode::AgentDeregister,
            Self::AgentSyncReq(_) => Opcode::AgentSyncReq,
            Self::AgentSyncRsp(_) => Opcode::AgentSyncRsp,
            Self::EmperorHeartbeat(_) => Opcode::EmperorHeartbeat,
            Self::ElectionStart(_) => Opcode::ElectionStart,
            Self::ElectionVictory(_) => Opcode::ElectionVictory,
            Self::CensusRequest(_) => Opcode::CensusRequest,
            Self::ConsensusPropose(_) => Opcode::ConsensusPropose,
            Self::ConsensusVote(_) => Opcode::ConsensusVote,
            Self::ConsensusCommit(_) => Opcode::ConsensusCommit,
            Self::ConsensusAbort(_) => Opcode::ConsensusAbort,
            Self::ConsensusSyncReq(_) => Opcode::ConsensusSyncReq,
            Self::ConsensusSyncRsp(_) => Opcode::ConsensusSyncRsp,
            Self::UpgradeRequest(_) => Opcode::UpgradeRequest,
            Self::UpgradeStatus(_) => Opcode::UpgradeStatus,
        }
    }

    /// Encodes the envelope: 2-byte BE opcode followed by the JSON payload.
    ///
    /// The frame length prefix is added separately by [`crate::encode_frame`].
    pub fn encode(&self) -> Result<Bytes> {
        let payload = match self {
            Self::Hello(m) => serde_json::to_vec(m),
            Self::Ping(m) => serde_json::to_vec(m),
            Self::Pong(m) => serde_json::to_vec(m),
            Self::AuthChallenge(m) => serde_json::to_vec(m),
            Self::AuthResponse(m) => serde_json::to_vec(m),
            Self::AuthReject(m) => serde_json::to_vec(m),
            Self::Pex(m) => serde_json::to_vec(m),
            Self::DhtLookup(m) => serde_json::to_vec(m),
            Self::DhtLookupRsp(m) => serde_json::to_vec(m),
            Self::DhtAnnounce(m) => serde_json::to_vec(m),
            Self::TaskCreate(m) => serde_json::to_vec(m),
            Self::TaskClaim(m) => serde_json::to_vec(m),
            Self::TaskUpdate(m) => serde_json::to_vec(m),
            Self::TaskComplete(m) => serde_json::to_vec(m),
            Self::TaskFail(m) => serde_json::to_vec(m),
            Self::TaskCancel(m) => serde_json::to_vec(m),
            Self::TaskAssign(m) => serde_json::to_vec(m),
            Self::TaskSyncReq(m) => serde_json::to_vec(m),
            Self::TaskSyncRsp(m) => serde_json::to_vec(m),
            Self::AgentRegister(m) => serde_json::to_vec(m),
            Self::AgentHeartbeat(m) => serde_json::to_vec(m),
            Self::AgentDeregister(m) => serde_json::to_vec(m),
            Self::AgentSyncReq(m) => serde_json::to_vec(m),
            Self::AgentSyncRsp(m) => serde_json::to_vec(m),
            Self::EmperorHeartbeat(m) => serde_json::to_vec(m),
            Self::ElectionStart(m) => serde_json::to_vec(m),
            Self::ElectionVictory(m) => serde_json::to_vec(m),
            Self::CensusRequest(m) => serde_json::to_vec(m),
            Self::ConsensusPropose(m) => serde_json::to_vec(m),
            Self::ConsensusVote(m) => serde_json::to_vec(m),
            Self::ConsensusCommit(m) => serde_json::to_vec(m),
            Self::ConsensusAbort(m) => serde_json::to_vec(m),
            Self::ConsensusSyncReq(m) => serde_json::to_vec(m),
            Self::ConsensusSyncRsp(m) => serde_json::to_vec(m),
            Self::UpgradeRequest(m) => serde_json::to_vec(m),
            Self::UpgradeStatus(m) => serde_json::to_vec(m),
        }?;

        let mut buf = BytesMut::with_capacity(2 + payload.len());
        buf.put_u16(self.opcode() as u16);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decodes one envelope from opcode + payload bytes (no length prefix).
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(WireError::InvalidFrame("missing opcode".into()));
        }
        let opcode = Opcode::from_u16(u16::from_be_bytes([data[0], data[1]]))?;
        let payload = &data[2..];

        let msg = match opcode {
            Opcode::Hello => Self::Hello(serde_json::from_slice(payload)?),
            Opcode::Ping => Self::Ping(serde_json::from_slice(payload)?),
            Opcode::Pong => Self::Pong(serde_json::from_slice(payload)?),
            Opcode::AuthChallenge => Self::AuthChallenge(serde_json::from_slice(payload)?),
            Opcode::AuthResponse => Self::AuthResponse(serde_json::from_slice(payload)?),
            Opcode::AuthReject => Self::AuthReject(serde_json::from_slice(payload)?),
            Opcode::Pex => Self::Pex(serde_json::from_slice(payload)?),
            Opcode::DhtDiscLookup => Self::DhtLookup(serde_json::from_slice(payload)?),
            Opcode::DhtDiscLookupRsp => Self::DhtLookupRsp(serde_json::from_slice(payload)?),
            Opcode::DhtDiscAnnounce => Self::DhtAnnounce(serde_json::from_slice(payload)?),
            Opcode::TaskCreate => Self::TaskCreate(serde_json::from_slice(payload)?),
            Opcode::TaskClaim => Self::TaskClaim(serde_json::from_slice(payload)?),
            Opcode::TaskUpdate => Self::TaskUpdate(serde_json::from_slice(payload)?),
            Opcode::TaskComplete => Self::TaskComplete(serde_json::from_slice(payload)?),
            Opcode::TaskFail => Self::TaskFail(serde_json::from_slice(payload)?),
            Opcode::TaskCancel => Self::TaskCancel(serde_json::from_slice(payload)?),
            Opcode::TaskAssign => Self::TaskAssign(serde_json::from_slice(payload)?),
            Opcode::TaskSyncReq => Self::TaskSyncReq(serde_json::from_slice(payload)?),
            Opcode::TaskSyncRsp => Self::TaskSyncRsp(serde_json::from_slice(payload)?),
            Opcode::AgentRegister => Self::AgentRegister(serde_json::from_slice(payload)?),
            Opcode::AgentHeartbeat => Self::AgentHeartbeat(serde_json::from_slice(payload)?),
            Opcode::AgentDeregister => Self::AgentDeregister(serde_json::from_slice(payload)?),
            Opcode::AgentSyncReq => Self::AgentSyncReq(serde_json::from_slice(payload)?),
            Opcode::AgentSyncRsp => Self::AgentSyncRsp(serde_json::from_slice(payload)?),
            Opcode::EmperorHeartbeat => Self::EmperorHeartbeat(serde_json::from_slice(payload)?),
            Opcode::ElectionStart => Self::ElectionStart(serde_json::from_slice(payload)?),
            Opcode::ElectionVictory => Self::ElectionVictory(serde_json::from_slice(payload)?),
            Opcode::CensusRequest => Self::CensusRequest(serde_json::from_slice(payload)?),
            Opcode::ConsensusPropose => Self::ConsensusPropose(serde_json::from_slice(payload)?),
            Opcode::ConsensusVote => Self::ConsensusVote(serde_json::from_slice(payload)?),
            Opcode::ConsensusCommit => Self::ConsensusCommit(serde_json::from_slice(payload)?),
            Opcode::ConsensusAbort => Self::ConsensusAbort(serde_json::from_slice(payload)?),
            Opcode::ConsensusSyncReq => Self::ConsensusSyncReq(serde_json::from_slice(payload)?),
            Opcode::ConsensusSyncRsp => Self::ConsensusSyncRsp(serde_json::from_slice(payload)?),
            Opcode::UpgradeRequest => Self::UpgradeRequest(serde_json::from_slice(payload)?),
            Opcode::UpgradeStatus => Self::UpgradeStatus(serde_json::from_slice(payload)?),
        };
        Ok(msg)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn node_id_strategy() -> impl Strategy<Value = NodeId> {
        prop::array::uniform16(any::<u8>()).prop_map(NodeId::from_bytes)
    }

    proptest! {
        #[test]
        fn prop_hello_roundtrip(
            node_id in node_id_strategy(),
            p2p_port in any::<u16>(),
            http_port in any::<u16>(),
        ) {
            let msg = Message::Hello(Hello {
                node_id,
                p2p_port,
                http_port,
                role: NodeRole::Worker,
            });
            let encoded = msg.encode().unwrap();
            match Message::decode(&encoded).unwrap() {
                Message::Hello(h) => {
                    prop_assert_eq!(h.node_id, node_id);
                    prop_assert_eq!(h.p2p_port, p2p_port);
                    prop_assert_eq!(h.http_port, http_port);
                }
                _ => prop_assert!(false, "wrong message type"),
            }
        }

        #[test]
        fn prop_heartbeat_roundtrip(
            node_id in node_id_strategy(),
            term in any::<u64>(),
            lamport in any::<u64>(),
            log_index in any::<u64>(),
        ) {
            let msg = Message::EmperorHeartbeat(EmperorHeartbeat {
                node_id,
                term,
                lamport_ts: Lamport(lamport),
                log_index,
            });
            let encoded = msg.encode().unwrap();
            match Message::decode(&encoded).unwrap() {
                Message::EmperorHeartbeat(h) => {
                    prop_assert_eq!(h.node_id, node_id);
                    prop_assert_eq!(h.term, term);
                    prop_assert_eq!(h.lamport_ts, Lamport(lamport));
                    prop_assert_eq!(h.log_index, log_index);
                }
                _ => prop_assert!(false, "wrong message type"),
            }
        }

        #[test]
        fn prop_unknown_opcodes_rejected(hi in any::<u8>(), lo in any::<u8>()) {
            let value = u16::from_be_bytes([hi, lo]);
            if Opcode::from_u16(value).is_err() {
                prop_assert!(Message::decode(&[hi, lo, b'{', b'}']).is_err(), "decode should fail for unknown opcode");
            }
        }
    }
}
