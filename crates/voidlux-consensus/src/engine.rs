//! Quorum-voting consensus: propose, vote, commit, and log sync.

use crate::{Elector, PartitionDetector, ProposalValidator};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use voidlux_core::{
    ConsensusLogEntry, NodeId, Proposal, ProposalId, ProposalState, Result, Timestamp,
};
use voidlux_gossip::{LamportClock, SeenCache};
use voidlux_mesh::{Connection, MeshServer};
use voidlux_storage::ConsensusStore;
use voidlux_wire::{
    ConsensusAbort, ConsensusCommit, ConsensusPropose, ConsensusSyncReq, ConsensusSyncRsp,
    ConsensusVote, Message,
};

/// Votes must land within this window.
const VOTE_TIMEOUT: Duration = Duration::from_secs(10);
/// Proposals die unconditionally after this long.
const PROPOSAL_EXPIRY: Duration = Duration::from_secs(60);
/// Log entries per sync response.
const SYNC_BATCH: usize = 500;

/// Why a linearizable read was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReadError {
    /// Only the leader serves consistent reads.
    #[error("not the leader")]
    NotLeader,
    /// The leader lease is broken: quorum is not visible right now.
    #[error("quorum_lost")]
    QuorumLost,
}

struct PendingProposal {
    proposal: Proposal,
    vote_deadline: Instant,
    created: Instant,
}

/// The consensus engine. One per node; all nodes run the same code and
/// the proposer does the tallying.
pub struct ConsensusEngine {
    node_id: NodeId,
    mesh: Arc<MeshServer>,
    clock: Arc<LamportClock>,
    store: Arc<ConsensusStore>,
    elector: Arc<Elector>,
    partition: Arc<PartitionDetector>,
    validator: RwLock<Arc<dyn ProposalValidator>>,
    /// Proposals this node proposed and is tallying.
    pending: Mutex<HashMap<ProposalId, PendingProposal>>,
    /// Proposal ids already voted on (the propose flood re-delivers).
    seen: SeenCache,
    /// Proposals made while partitioned, replayed on heal.
    queued: Mutex<Vec<Proposal>>,
    commits_tx: broadcast::Sender<ConsensusLogEntry>,
}

impl ConsensusEngine {
    /// Wires the engine to its collaborators.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        mesh: Arc<MeshServer>,
        clock: Arc<LamportClock>,
        store: Arc<ConsensusStore>,
        elector: Arc<Elector>,
        partition: Arc<PartitionDetector>,
        validator: Arc<dyn ProposalValidator>,
    ) -> Arc<Self> {
        let (commits_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            node_id,
            mesh,
            clock,
            store,
            elector,
            partition,
            validator: RwLock::new(validator),
            pending: Mutex::new(HashMap::new()),
            seen: SeenCache::new(),
            queued: Mutex::new(Vec::new()),
            commits_tx,
        })
    }

    /// Replaces the proposal validator.
    pub fn set_validator(&self, validator: Arc<dyn ProposalValidator>) {
        *self.validator.write() = validator;
    }

    /// Subscribes to committed log entries.
    #[must_use]
    pub fn subscribe_commits(&self) -> broadcast::Receiver<ConsensusLogEntry> {
        self.commits_tx.subscribe()
    }

    /// Highest committed index on this node.
    pub fn last_index(&self) -> Result<u64> {
        Ok(self.store.last_index()?)
    }

    /// Starts a distributed decision. While partitioned the proposal is
    /// queued and replayed when quorum returns.
    pub async fn propose(
        &self,
        operation: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<ProposalId> {
        let proposal = Proposal::new(
            self.node_id,
            self.elector.current_term() + 1,
            operation,
            payload,
            self.partition.quorum_required(),
        );
        let id = proposal.id;

        if self.partition.is_partitioned() {
            info!(proposal_id = %id, "partitioned, queueing proposal");
            self.queued.lock().push(proposal);
            return Ok(id);
        }

        self.launch(proposal).await;
        Ok(id)
    }

    async fn launch(&self, mut proposal: Proposal) {
        proposal.term = self.elector.current_term() + 1;
        proposal.quorum_required = self.partition.quorum_required();
        proposal.lamport_ts = self.clock.tick();
        proposal.state = ProposalState::Voting;
        proposal.votes_for.insert(self.node_id);

        // Our own flood echo must not trigger a self-vote.
        self.seen.insert(&format!("proposal:{}", proposal.id));

        debug!(
            proposal_id = %proposal.id,
            term = proposal.term,
            quorum = proposal.quorum_required,
            operation = %proposal.operation,
            "proposing"
        );

        self.pending.lock().insert(
            proposal.id,
            PendingProposal {
                proposal: proposal.clone(),
                vote_deadline: Instant::now() + VOTE_TIMEOUT,
                created: Instant::now(),
            },
        );

        let msg = Message::ConsensusPropose(ConsensusPropose { proposal });
        self.mesh.broadcast(&msg, None).await;

        // A cluster of one reaches quorum with the self-vote alone.
        self.try_finalize().await;
    }

    /// How this node votes on a proposal: stale terms are refused, the
    /// rest goes to the domain validator.
    fn decide_vote(&self, proposal: &Proposal) -> (bool, Option<String>) {
        if proposal.term < self.elector.current_term() {
            return (false, Some("stale_term".into()));
        }
        match self.validator.read().validate(proposal) {
            Ok(()) => (true, None),
            Err(reason) => (false, Some(reason)),
        }
    }

    /// A proposal arrived: vote once and keep the flood going.
    /// `from_addr` is the delivering connection, excluded from the
    /// re-flood.
    pub async fn handle_propose(&self, from_addr: std::net::SocketAddr, msg: &ConsensusPropose) {
        let proposal = &msg.proposal;
        self.clock.witness(proposal.lamport_ts);

        if !self.seen.insert(&format!("proposal:{}", proposal.id)) {
            return;
        }
        if self.store.contains(&proposal.id).unwrap_or(false) {
            return; // already committed here
        }

        let (vote, reason) = self.decide_vote(proposal);
        debug!(proposal_id = %proposal.id, vote, reason = ?reason, "voting");

        let vote_msg = Message::ConsensusVote(ConsensusVote {
            proposal_id: proposal.id,
            voter: self.node_id,
            vote,
            reason,
            term: self.elector.current_term(),
            lamport_ts: self.clock.tick(),
        });
        // Addressed to the proposer; flood as a fallback when there is
        // no direct connection.
        if !self.mesh.send_to(&proposal.proposer_node_id, &vote_msg).await {
            self.mesh.broadcast(&vote_msg, None).await;
        }

        let flood = Message::ConsensusPropose(msg.clone());
        self.mesh.broadcast(&flood, Some(from_addr)).await;
    }

    /// A vote arrived. Only the proposer tallies, once per voter.
    pub async fn handle_vote(&self, msg: &ConsensusVote) {
        self.clock.witness(msg.lamport_ts);
        {
            let mut pending = self.pending.lock();
            let Some(entry) = pending.get_mut(&msg.proposal_id) else {
                return; // not ours, or already resolved
            };
            if msg.vote {
                entry.proposal.votes_for.insert(msg.voter);
            } else {
                debug!(
                    proposal_id = %msg.proposal_id,
                    voter = %msg.voter.short(),
                    reason = ?msg.reason,
                    "no vote"
                );
                entry.proposal.votes_against.insert(msg.voter);
            }
        }
        self.try_finalize().await;
    }

    async fn try_finalize(&self) {
        let (commits, aborts) = {
            let mut pending = self.pending.lock();
            let committed: Vec<ProposalId> = pending
                .iter()
                .filter(|(_, p)| p.proposal.has_quorum())
                .map(|(id, _)| *id)
                .collect();
            let rejected: Vec<ProposalId> = pending
                .iter()
                .filter(|(_, p)| p.proposal.is_rejected())
                .map(|(id, _)| *id)
                .collect();

            let commits: Vec<Proposal> = committed
                .iter()
                .filter_map(|id| pending.remove(id))
                .map(|p| p.proposal)
                .collect();
            let aborts: Vec<Proposal> = rejected
                .iter()
                .filter_map(|id| pending.remove(id))
                .map(|p| p.proposal)
                .collect();
            (commits, aborts)
        };

        for mut proposal in commits {
            let index = self.store.last_index().unwrap_or(0) + 1;
            proposal.state = ProposalState::Committed;
            proposal.log_index = Some(index);
            proposal.committed_at = Some(Timestamp::now());

            let entry = ConsensusLogEntry::from_proposal(&proposal, index);
            match self.store.append(&entry) {
                Ok(true) => {
                    info!(
                        proposal_id = %proposal.id,
                        log_index = index,
                        operation = %proposal.operation,
                        "proposal committed"
                    );
                    self.apply_builtin(&entry);
                    let _ = self.commits_tx.send(entry);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "commit append failed");
                    continue;
                }
            }

            let msg = Message::ConsensusCommit(ConsensusCommit { proposal });
            self.mesh.broadcast(&msg, None).await;
        }

        for proposal in aborts {
            warn!(proposal_id = %proposal.id, "proposal rejected by quorum");
            let msg = Message::ConsensusAbort(ConsensusAbort {
                proposal_id: proposal.id,
                reason: "rejected".into(),
            });
            self.mesh.broadcast(&msg, None).await;
        }
    }

    /// A commit arrived: append idempotently and keep flooding.
    pub async fn handle_commit(&self, from_addr: std::net::SocketAddr, msg: &ConsensusCommit) {
        let proposal = &msg.proposal;
        self.clock.witness(proposal.lamport_ts);

        let Some(index) = proposal.log_index else {
            warn!(proposal_id = %proposal.id, "commit without log index dropped");
            return;
        };

        let entry = ConsensusLogEntry::from_proposal(proposal, index);
        match self.store.append(&entry) {
            Ok(true) => {
                info!(
                    proposal_id = %proposal.id,
                    log_index = entry.log_index,
                    "remote commit applied"
                );
                self.pending.lock().remove(&proposal.id);
                self.apply_builtin(&entry);
                let _ = self.commits_tx.send(entry);

                let flood = Message::ConsensusCommit(msg.clone());
                self.mesh.broadcast(&flood, Some(from_addr)).await;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "remote commit append failed"),
        }
    }

    /// An abort arrived for a proposal we may be tallying.
    pub fn handle_abort(&self, msg: &ConsensusAbort) {
        if self.pending.lock().remove(&msg.proposal_id).is_some() {
            warn!(proposal_id = %msg.proposal_id, reason = %msg.reason, "proposal aborted");
        }
    }

    /// Log anti-entropy request.
    pub async fn handle_sync_req(&self, conn: &Arc<Connection>, msg: &ConsensusSyncReq) {
        match self.store.entries_after(msg.after_log_index, SYNC_BATCH) {
            Ok(entries) => {
                let rsp = Message::ConsensusSyncRsp(ConsensusSyncRsp { entries });
                if let Err(e) = conn.send(&rsp).await {
                    debug!(error = %e, "consensus sync response failed");
                }
            }
            Err(e) => warn!(error = %e, "consensus sync read failed"),
        }
    }

    /// Log anti-entropy response.
    pub fn handle_sync_rsp(&self, msg: &ConsensusSyncRsp) {
        for entry in &msg.entries {
            self.clock.witness(entry.lamport_ts);
            match self.store.append(entry) {
                Ok(true) => {
                    self.apply_builtin(entry);
                    let _ = self.commits_tx.send(entry.clone());
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "sync append failed"),
            }
        }
    }

    /// Requests log entries past our watermark from one peer.
    pub async fn request_sync(&self, peer: &NodeId) {
        let after = self.store.last_index().unwrap_or(0);
        let msg = Message::ConsensusSyncReq(ConsensusSyncReq {
            after_log_index: after,
            from: self.node_id,
        });
        self.mesh.send_to(peer, &msg).await;
    }

    /// Built-in operations applied on every node at commit time.
    fn apply_builtin(&self, entry: &ConsensusLogEntry) {
        if entry.operation == "membership_change" {
            if let Some(size) = entry.payload.get("cluster_size").and_then(|v| v.as_u64()) {
                self.partition.set_cluster_size(size as usize);
            }
        }
    }

    /// Linearizable read: leader-only, gated on the instantaneous
    /// quorum check (the leader lease).
    pub fn read_consistent(&self) -> std::result::Result<Vec<ConsensusLogEntry>, ReadError> {
        if !self.elector.is_leader() {
            return Err(ReadError::NotLeader);
        }
        if !self.partition.has_quorum() {
            return Err(ReadError::QuorumLost);
        }
        self.store.all_entries().map_err(|_| ReadError::QuorumLost)
    }

    /// Stale read from the local log; always allowed.
    pub fn read_stale(&self) -> Result<Vec<ConsensusLogEntry>> {
        Ok(self.store.all_entries()?)
    }

    /// The timeout/expiry/replay loop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut partition_watch = self.partition.watch();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = partition_watch.changed() => {
                    if changed.is_ok() && !*partition_watch.borrow() {
                        self.replay_queued().await;
                    }
                }
                _ = ticker.tick() => self.sweep_deadlines().await,
            }
        }
    }

    async fn sweep_deadlines(&self) {
        let now = Instant::now();
        let expired: Vec<Proposal> = {
            let mut pending = self.pending.lock();
            let dead: Vec<ProposalId> = pending
                .iter()
                .filter(|(_, p)| {
                    now >= p.vote_deadline || p.created.elapsed() >= PROPOSAL_EXPIRY
                })
                .map(|(id, _)| *id)
                .collect();
            dead.iter()
                .filter_map(|id| pending.remove(id))
                .map(|p| p.proposal)
                .collect()
        };

        for proposal in expired {
            warn!(proposal_id = %proposal.id, "proposal timed out without quorum");
            let msg = Message::ConsensusAbort(ConsensusAbort {
                proposal_id: proposal.id,
                reason: "timeout".into(),
            });
            self.mesh.broadcast(&msg, None).await;
        }

        // Queued proposals expire too, silently.
        self.queued
            .lock()
            .retain(|p| p.created_at.elapsed_secs() < PROPOSAL_EXPIRY.as_secs());
    }

    async fn replay_queued(&self) {
        let queued: Vec<Proposal> = std::mem::take(&mut *self.queued.lock());
        if queued.is_empty() {
            return;
        }
        info!(count = queued.len(), "partition healed, replaying queued proposals");
        for proposal in queued {
            self.launch(proposal).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AcceptAll, ElectionConfig};
    use voidlux_core::{Lamport, NodeRole};
    use voidlux_mesh::{MeshConfig, PeerManager};

    fn engine(cluster_size: usize) -> (Arc<ConsensusEngine>, Arc<ConsensusStore>, Arc<Elector>) {
        let node_id = NodeId::generate();
        let mesh = MeshServer::new(MeshConfig::new(
            node_id,
            NodeRole::Worker,
            "127.0.0.1:0".parse().unwrap(),
        ));
        let clock = Arc::new(LamportClock::new(Lamport::ZERO));
        let store = Arc::new(ConsensusStore::open_in_memory().unwrap());
        let peers = Arc::new(PeerManager::new(node_id));
        let partition = PartitionDetector::new(peers, cluster_size);
        let elector = Elector::new(
            node_id,
            ElectionConfig::default(),
            Arc::clone(&mesh),
            Arc::clone(&clock),
            Box::new(|| 0),
        );
        let engine = ConsensusEngine::new(
            node_id,
            mesh,
            clock,
            Arc::clone(&store),
            Arc::clone(&elector),
            partition,
            Arc::new(AcceptAll),
        );
        (engine, store, elector)
    }

    #[tokio::test]
    async fn single_node_cluster_commits_on_self_vote() {
        let (engine, store, _) = engine(1);
        let mut commits = engine.subscribe_commits();

        let id = engine
            .propose("config_change", serde_json::json!({"x": 1}))
            .await
            .unwrap();

        let entry = commits.recv().await.unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.log_index, 1);
        assert!(store.contains(&id).unwrap());
    }

    #[tokio::test]
    async fn votes_commit_at_quorum() {
        let (engine, store, _) = engine(3);
        let id = engine
            .propose("config_change", serde_json::json!({"x": 2}))
            .await
            .unwrap();
        // Self-vote only: not yet committed in a 3-node cluster.
        assert!(!store.contains(&id).unwrap());

        engine
            .handle_vote(&ConsensusVote {
                proposal_id: id,
                voter: NodeId::generate(),
                vote: true,
                reason: None,
                term: 1,
                lamport_ts: Lamport(5),
            })
            .await;

        assert!(store.contains(&id).unwrap());
        assert!(engine.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn duplicate_votes_count_once() {
        let (engine, store, _) = engine(5);
        let id = engine
            .propose("config_change", serde_json::json!({}))
            .await
            .unwrap();

        let voter = NodeId::generate();
        for lamport in 1..=4 {
            engine
                .handle_vote(&ConsensusVote {
                    proposal_id: id,
                    voter,
                    vote: true,
                    reason: None,
                    term: 1,
                    lamport_ts: Lamport(lamport),
                })
                .await;
        }

        // Quorum is 3; self + one distinct voter is not enough.
        assert!(!store.contains(&id).unwrap());
    }

    #[tokio::test]
    async fn no_votes_abort_at_quorum() {
        let (engine, _store, _) = engine(3);
        let id = engine
            .propose("config_change", serde_json::json!({}))
            .await
            .unwrap();

        for _ in 0..2 {
            engine
                .handle_vote(&ConsensusVote {
                    proposal_id: id,
                    voter: NodeId::generate(),
                    vote: false,
                    reason: Some("policy".into()),
                    term: 1,
                    lamport_ts: Lamport(1),
                })
                .await;
        }
        assert!(engine.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn stale_term_gets_no_vote() {
        let (engine, _, elector) = engine(3);
        elector.on_victory(&voidlux_wire::ElectionVictory {
            node_id: NodeId::from_bytes([0; 16]),
            term: 9,
            lamport_ts: Lamport(1),
        });

        let stale = Proposal::new(NodeId::generate(), 3, "config_change", serde_json::Value::Null, 2);
        let (vote, reason) = engine.decide_vote(&stale);
        assert!(!vote);
        assert_eq!(reason.as_deref(), Some("stale_term"));

        let fresh = Proposal::new(NodeId::generate(), 10, "config_change", serde_json::Value::Null, 2);
        let (vote, _) = engine.decide_vote(&fresh);
        assert!(vote);
    }

    #[tokio::test]
    async fn remote_commit_is_idempotent() {
        let (engine, store, _) = engine(3);

        let mut proposal = Proposal::new(
            NodeId::generate(),
            2,
            "config_change",
            serde_json::json!({"x": 3}),
            2,
        );
        proposal.log_index = Some(1);
        proposal.state = ProposalState::Committed;

        let from: std::net::SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let msg = ConsensusCommit {
            proposal: proposal.clone(),
        };
        engine.handle_commit(from, &msg).await;
        engine.handle_commit(from, &msg).await;

        assert_eq!(store.last_index().unwrap(), 1);
        assert!(store.contains(&proposal.id).unwrap());
    }

    #[tokio::test]
    async fn membership_change_commit_updates_cluster_size() {
        let (engine, _, _) = engine(3);

        let entry = ConsensusLogEntry {
            id: ProposalId::generate(),
            term: 2,
            log_index: 1,
            proposer_node_id: NodeId::generate(),
            operation: "membership_change".into(),
            payload: serde_json::json!({"cluster_size": 7}),
            lamport_ts: Lamport(4),
            committed_at: Timestamp::now(),
        };
        engine.handle_sync_rsp(&ConsensusSyncRsp {
            entries: vec![entry],
        });
        assert_eq!(engine.partition.cluster_size(), 7);
    }

    #[tokio::test]
    async fn read_consistent_requires_leadership() {
        let (engine, _, elector) = engine(1);
        assert_eq!(engine.read_consistent(), Err(ReadError::NotLeader));
        elector.assume_leadership();
        assert!(engine.read_consistent().is_ok());
        // Stale reads are always available.
        assert!(engine.read_stale().is_ok());
    }
}
