//! The rolling-upgrade state machine.

use crate::CommitSwitcher;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{info, warn};
use voidlux_core::{NodeId, NodeRole, PeerInfo, Result, Timestamp, UpgradeRecord, UpgradeStatus};
use voidlux_mesh::{MeshServer, PeerManager};
use voidlux_storage::ConsensusStore;
use voidlux_wire::{Message, UpgradeHealth, UpgradeReport, UpgradeRequest};

/// Upgrade timing knobs.
#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    /// Wait for the canary worker.
    pub canary_timeout: Duration,
    /// Wait per remaining worker.
    pub worker_timeout: Duration,
    /// Wait for the restarted emperor.
    pub emperor_timeout: Duration,
    /// Wait for workers to rejoin after the emperor restart.
    pub rejoin_wait: Duration,
    /// Probe `http://host:http_port/health` when no status arrives.
    pub http_probe: bool,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            canary_timeout: Duration::from_secs(60),
            worker_timeout: Duration::from_secs(45),
            emperor_timeout: Duration::from_secs(60),
            rejoin_wait: Duration::from_secs(10),
            http_probe: true,
        }
    }
}

/// Runs on the seneschal; drives the cluster through a commit switch.
pub struct UpgradeCoordinator {
    node_id: NodeId,
    config: UpgradeConfig,
    mesh: Arc<MeshServer>,
    peers: Arc<PeerManager>,
    store: Arc<ConsensusStore>,
    switcher: Arc<dyn CommitSwitcher>,
    /// Latest UPGRADE_STATUS per node, cleared per run.
    statuses: Mutex<HashMap<NodeId, UpgradeHealth>>,
    status_seen: Notify,
}

impl UpgradeCoordinator {
    /// Wires the coordinator to its collaborators.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        config: UpgradeConfig,
        mesh: Arc<MeshServer>,
        peers: Arc<PeerManager>,
        store: Arc<ConsensusStore>,
        switcher: Arc<dyn CommitSwitcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            config,
            mesh,
            peers,
            store,
            switcher,
            statuses: Mutex::new(HashMap::new()),
            status_seen: Notify::new(),
        })
    }

    /// An UPGRADE_STATUS broadcast arrived.
    pub fn handle_status(&self, report: &UpgradeReport) {
        self.statuses.lock().insert(report.node_id, report.status);
        self.status_seen.notify_waiters();
    }

    /// An UPGRADE_REQUEST addressed to this node: switch the checkout
    /// and report. The actual process restart is the launcher's job.
    pub async fn handle_request(&self, req: &UpgradeRequest) {
        if req.target_node != self.node_id {
            return;
        }
        info!(
            target_commit = %req.target_commit,
            rollback = req.rollback,
            "upgrade request received"
        );
        let report = match self.switcher.switch(&req.target_commit) {
            Ok(()) => UpgradeReport {
                node_id: self.node_id,
                status: UpgradeHealth::Healthy,
                detail: Some(req.target_commit.clone()),
            },
            Err(e) => UpgradeReport {
                node_id: self.node_id,
                status: UpgradeHealth::Failed,
                detail: Some(e),
            },
        };
        self.mesh
            .broadcast(&Message::UpgradeStatus(report), None)
            .await;
    }

    /// Drives a full rolling upgrade to `target_commit`. Returns the
    /// persisted history record, whatever the outcome.
    pub async fn start_upgrade(
        &self,
        target_commit: &str,
        initiated_by: &str,
    ) -> Result<UpgradeRecord> {
        let from_commit = self
            .switcher
            .current_commit()
            .map_err(voidlux_core::Error::Internal)?;

        // Update our own checkout first so rollback has a fixed point.
        self.switcher
            .switch(target_commit)
            .map_err(voidlux_core::Error::Internal)?;

        let mut workers: Vec<PeerInfo> = self
            .peers
            .online_peers()
            .into_iter()
            .filter(|p| p.role == NodeRole::Worker)
            .collect();
        workers.sort_by_key(|p| p.node_id);
        let emperor = self
            .peers
            .online_peers()
            .into_iter()
            .find(|p| p.role == NodeRole::Emperor);

        let nodes_total = workers.len() as u32 + u32::from(emperor.is_some());
        let mut record =
            UpgradeRecord::new(from_commit.clone(), target_commit, initiated_by, nodes_total);
        self.store.insert_upgrade(&record)?;
        self.statuses.lock().clear();

        info!(
            upgrade_id = %record.id,
            from = %from_commit,
            to = %target_commit,
            workers = workers.len(),
            "rolling upgrade started"
        );

        let mut updated: Vec<PeerInfo> = Vec::new();

        // Canary first: one worker proves the commit before the fleet.
        if let Some(canary) = workers.first().cloned() {
            if self
                .upgrade_node(&canary, target_commit, self.config.canary_timeout)
                .await
            {
                record.nodes_updated += 1;
                updated.push(canary);
            } else {
                warn!(node = %canary.node_id.short(), "canary failed, aborting upgrade");
                self.rollback(&[canary], &from_commit, &mut record).await;
                return self.finish(
                    record,
                    UpgradeStatus::RolledBack,
                    Some("canary failed".into()),
                );
            }

            for worker in workers.iter().skip(1) {
                if self
                    .upgrade_node(worker, target_commit, self.config.worker_timeout)
                    .await
                {
                    record.nodes_updated += 1;
                    updated.push(worker.clone());
                } else {
                    warn!(node = %worker.node_id.short(), "worker upgrade failed, rolling back");
                    self.rollback(&updated, &from_commit, &mut record).await;
                    return self.finish(
                        record,
                        UpgradeStatus::RolledBack,
                        Some(format!("worker {} failed", worker.node_id.short())),
                    );
                }
            }
        }

        // Regicide: the emperor restarts last; its successor (usually
        // itself) must come back healthy.
        if let Some(emperor) = &emperor {
            if self
                .upgrade_node(emperor, target_commit, self.config.emperor_timeout)
                .await
            {
                record.nodes_updated += 1;
            } else {
                warn!("emperor restart failed, rolling back cluster");
                self.rollback(&updated, &from_commit, &mut record).await;
                return self.finish(
                    record,
                    UpgradeStatus::RolledBack,
                    Some("emperor restart failed".into()),
                );
            }

            // Enough of the fleet must have rejoined the mesh.
            tokio::time::sleep(self.config.rejoin_wait).await;
            let rejoined = self
                .peers
                .online_peers()
                .iter()
                .filter(|p| p.role == NodeRole::Worker)
                .count();
            if !workers.is_empty() && rejoined * 2 < workers.len() {
                warn!(
                    rejoined,
                    expected = workers.len(),
                    "too few workers rejoined, rolling back"
                );
                self.rollback(&updated, &from_commit, &mut record).await;
                return self.finish(
                    record,
                    UpgradeStatus::RolledBack,
                    Some("insufficient workers rejoined".into()),
                );
            }
        }

        info!(upgrade_id = %record.id, "rolling upgrade succeeded");
        self.finish(record, UpgradeStatus::Success, None)
    }

    /// Sends the upgrade request and waits for a healthy signal.
    async fn upgrade_node(&self, peer: &PeerInfo, commit: &str, timeout: Duration) -> bool {
        self.statuses.lock().remove(&peer.node_id);
        let req = Message::UpgradeRequest(UpgradeRequest {
            target_node: peer.node_id,
            target_commit: commit.to_string(),
            rollback: false,
        });
        self.mesh.send_to(&peer.node_id, &req).await;

        match self.await_health(peer.node_id, timeout).await {
            Some(UpgradeHealth::Healthy) => true,
            Some(UpgradeHealth::Failed) => false,
            // No status (or stuck restarting): fall back to the HTTP
            // health endpoint when we have one.
            _ => self.probe(peer).await,
        }
    }

    async fn await_health(&self, node: NodeId, timeout: Duration) -> Option<UpgradeHealth> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.statuses.lock().get(&node) {
                Some(UpgradeHealth::Restarting) | None => {}
                Some(health) => return Some(*health),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.statuses.lock().get(&node).copied();
            }
            let _ = tokio::time::timeout(remaining, self.status_seen.notified()).await;
        }
    }

    async fn probe(&self, peer: &PeerInfo) -> bool {
        if !self.config.http_probe || peer.http_port == 0 {
            return false;
        }
        let url = format!("http://{}:{}/health", peer.host, peer.http_port);
        match reqwest::Client::new()
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(rsp) => rsp.status().is_success(),
            Err(e) => {
                warn!(url = %url, error = %e, "health probe failed");
                false
            }
        }
    }

    /// Reverts every node updated so far.
    async fn rollback(&self, updated: &[PeerInfo], from_commit: &str, record: &mut UpgradeRecord) {
        // Our own checkout goes back first.
        if let Err(e) = self.switcher.switch(from_commit) {
            warn!(error = %e, "local rollback switch failed");
        }
        for peer in updated {
            info!(node = %peer.node_id.short(), "rolling back node");
            let req = Message::UpgradeRequest(UpgradeRequest {
                target_node: peer.node_id,
                target_commit: from_commit.to_string(),
                rollback: true,
            });
            self.mesh.send_to(&peer.node_id, &req).await;
            record.nodes_rolled_back += 1;
        }
    }

    fn finish(
        &self,
        mut record: UpgradeRecord,
        status: UpgradeStatus,
        failure_reason: Option<String>,
    ) -> Result<UpgradeRecord> {
        record.status = status;
        record.failure_reason = failure_reason;
        record.completed_at = Some(Timestamp::now());
        self.store.update_upgrade(&record)?;
        Ok(record)
    }

    /// Upgrade history, newest first.
    pub fn history(&self) -> Result<Vec<UpgradeRecord>> {
        Ok(self.store.list_upgrades()?)
    }
}
