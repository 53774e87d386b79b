//! The peer manager: authoritative set of live peers, known dial
//! addresses, and the reconnection loop.

use crate::MeshServer;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};
use voidlux_core::{NodeId, PeerInfo};
use voidlux_wire::Hello;

/// Redial cadence.
const REDIAL_INTERVAL: Duration = Duration::from_secs(15);
/// Per-address backoff bounds.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
/// Offline peers are forgotten after this long.
const OFFLINE_PRUNE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct AddrState {
    host: String,
    port: u16,
    node_id: Option<NodeId>,
    backoff: Duration,
    next_attempt: Instant,
}

#[derive(Debug, Clone)]
struct PeerRecord {
    info: PeerInfo,
    offline_since: Option<Instant>,
}

/// Tracks every known peer and dial address for one node.
pub struct PeerManager {
    self_id: NodeId,
    peers: RwLock<HashMap<NodeId, PeerRecord>>,
    addresses: Mutex<HashMap<String, AddrState>>,
}

impl PeerManager {
    /// Creates an empty manager for the given local identity.
    #[must_use]
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            peers: RwLock::new(HashMap::new()),
            addresses: Mutex::new(HashMap::new()),
        }
    }

    /// Records a dialable address. Observations of our own node id are
    /// dropped. Returns true when the address was new.
    pub fn observe(&self, host: &str, port: u16, node_id: Option<NodeId>) -> bool {
        if node_id == Some(self.self_id) {
            return false;
        }
        let key = format!("{host}:{port}");
        let mut addresses = self.addresses.lock();
        match addresses.get_mut(&key) {
            Some(state) => {
                if node_id.is_some() {
                    state.node_id = node_id;
                }
                false
            }
            None => {
                debug!(addr = %key, "new candidate address");
                addresses.insert(
                    key,
                    AddrState {
                        host: host.to_string(),
                        port,
                        node_id,
                        backoff: BACKOFF_MIN,
                        next_attempt: Instant::now(),
                    },
                );
                true
            }
        }
    }

    /// A connection to `node_id` authenticated. Upserts the peer record
    /// and links/resets its dial address.
    pub fn peer_ready(&self, hello: &Hello, remote: SocketAddr) {
        let host = remote.ip().to_string();
        let mut info = PeerInfo::new(hello.node_id, host.clone(), hello.p2p_port, hello.role);
        info.http_port = hello.http_port;
        info.authenticated = true;

        let mut peers = self.peers.write();
        match peers.get_mut(&hello.node_id) {
            Some(record) => {
                record.info.host = host.clone();
                record.info.p2p_port = hello.p2p_port;
                record.info.http_port = hello.http_port;
                record.info.role = hello.role;
                record.info.authenticated = true;
                record.info.touch();
                record.offline_since = None;
            }
            None => {
                info!(node = %hello.node_id.short(), role = %hello.role, "peer joined");
                peers.insert(
                    hello.node_id,
                    PeerRecord {
                        info,
                        offline_since: None,
                    },
                );
            }
        }
        drop(peers);

        self.observe(&host, hello.p2p_port, Some(hello.node_id));
        self.record_dial_success(&format!("{host}:{}", hello.p2p_port));
    }

    /// Marks a peer offline; the record survives until pruned.
    pub fn mark_offline(&self, node_id: &NodeId) {
        if let Some(record) = self.peers.write().get_mut(node_id) {
            record.offline_since = Some(Instant::now());
            record.info.authenticated = false;
        }
    }

    /// Refreshes a peer's last-seen time.
    pub fn touch(&self, node_id: &NodeId) {
        if let Some(record) = self.peers.write().get_mut(node_id) {
            record.info.touch();
        }
    }

    /// Folds a latency sample into the peer's EMA.
    pub fn record_latency(&self, node_id: &NodeId, rtt_ms: f64) {
        if let Some(record) = self.peers.write().get_mut(node_id) {
            record.info.record_latency(rtt_ms);
        }
    }

    /// Online peers.
    #[must_use]
    pub fn online_peers(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .values()
            .filter(|r| r.offline_since.is_none())
            .map(|r| r.info.clone())
            .collect()
    }

    /// Every known peer record, online or not.
    #[must_use]
    pub fn all_peers(&self) -> Vec<PeerInfo> {
        self.peers.read().values().map(|r| r.info.clone()).collect()
    }

    /// One peer's record.
    #[must_use]
    pub fn get(&self, node_id: &NodeId) -> Option<PeerInfo> {
        self.peers.read().get(node_id).map(|r| r.info.clone())
    }

    /// Number of online peers.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.peers
            .read()
            .values()
            .filter(|r| r.offline_since.is_none())
            .count()
    }

    /// Node ids of peers seen within the window (partition detection).
    #[must_use]
    pub fn seen_within(&self, window: Duration) -> Vec<NodeId> {
        self.peers
            .read()
            .values()
            .filter(|r| r.info.last_seen.elapsed_secs() <= window.as_secs())
            .map(|r| r.info.node_id)
            .collect()
    }

    /// Number of known dial addresses.
    #[must_use]
    pub fn known_address_count(&self) -> usize {
        self.addresses.lock().len()
    }

    fn record_dial_success(&self, key: &str) {
        if let Some(state) = self.addresses.lock().get_mut(key) {
            state.backoff = BACKOFF_MIN;
            state.next_attempt = Instant::now() + REDIAL_INTERVAL;
        }
    }

    fn record_dial_failure(&self, key: &str) {
        if let Some(state) = self.addresses.lock().get_mut(key) {
            state.next_attempt = Instant::now() + state.backoff;
            state.backoff = (state.backoff * 2).min(BACKOFF_MAX);
        }
    }

    /// Drops peers offline past the prune window. Returns their ids.
    pub fn prune_offline(&self) -> Vec<NodeId> {
        let mut peers = self.peers.write();
        let expired: Vec<NodeId> = peers
            .iter()
            .filter(|(_, r)| {
                r.offline_since
                    .is_some_and(|since| since.elapsed() > OFFLINE_PRUNE)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            peers.remove(id);
            debug!(node = %id.short(), "pruned offline peer");
        }
        expired
    }

    /// Addresses due for a dial attempt right now.
    fn due_addresses(&self, mesh: &MeshServer) -> Vec<(String, String, u16)> {
        let now = Instant::now();
        let addresses = self.addresses.lock();
        addresses
            .iter()
            .filter(|(key, state)| {
                if state.next_attempt > now {
                    return false;
                }
                // Already connected by node id?
                if let Some(node_id) = state.node_id {
                    if mesh.connection_for(&node_id).is_some() {
                        return false;
                    }
                }
                // Already connected by dial address?
                if let Ok(addr) = key.parse::<SocketAddr>() {
                    if mesh.has_connection_to(&addr) {
                        return false;
                    }
                }
                true
            })
            .map(|(key, state)| (key.clone(), state.host.clone(), state.port))
            .collect()
    }

    /// The reconnection loop: every 15 seconds dial every known address
    /// that is not currently connected, with per-address backoff.
    pub async fn run(
        self: Arc<Self>,
        mesh: Arc<MeshServer>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(REDIAL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.prune_offline();
                    for (key, host, port) in self.due_addresses(&mesh) {
                        match mesh.connect_to(&host, port).await {
                            Ok(_) => self.record_dial_success(&key),
                            Err(e) => {
                                debug!(addr = %key, error = %e, "dial failed");
                                self.record_dial_failure(&key);
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voidlux_core::NodeRole;

    #[test]
    fn observe_dedupes_and_drops_self() {
        let me = NodeId::generate();
        let pm = PeerManager::new(me);

        assert!(pm.observe("10.0.0.1", 7000, None));
        assert!(!pm.observe("10.0.0.1", 7000, None));
        assert_eq!(pm.known_address_count(), 1);

        assert!(!pm.observe("10.0.0.2", 7000, Some(me)));
        assert_eq!(pm.known_address_count(), 1);
    }

    #[test]
    fn observe_backfills_node_id() {
        let pm = PeerManager::new(NodeId::generate());
        pm.observe("10.0.0.1", 7000, None);

        let other = NodeId::generate();
        assert!(!pm.observe("10.0.0.1", 7000, Some(other)));
        let addrs = pm.addresses.lock();
        assert_eq!(addrs.get("10.0.0.1:7000").unwrap().node_id, Some(other));
    }

    #[test]
    fn peer_ready_then_offline() {
        let pm = PeerManager::new(NodeId::generate());
        let peer_id = NodeId::generate();
        let hello = Hello {
            node_id: peer_id,
            p2p_port: 7001,
            http_port: 8001,
            role: NodeRole::Worker,
        };

        pm.peer_ready(&hello, "10.0.0.5:55555".parse().unwrap());
        assert_eq!(pm.online_count(), 1);
        let info = pm.get(&peer_id).unwrap();
        assert_eq!(info.p2p_addr(), "10.0.0.5:7001");
        assert!(info.authenticated);

        pm.mark_offline(&peer_id);
        assert_eq!(pm.online_count(), 0);
        // Still known until the prune window passes.
        assert_eq!(pm.all_peers().len(), 1);
        assert!(pm.prune_offline().is_empty());
    }

    #[test]
    fn dial_backoff_doubles_to_cap() {
        let pm = PeerManager::new(NodeId::generate());
        pm.observe("10.0.0.1", 7000, None);

        for _ in 0..10 {
            pm.record_dial_failure("10.0.0.1:7000");
        }
        let addrs = pm.addresses.lock();
        assert_eq!(addrs.get("10.0.0.1:7000").unwrap().backoff, BACKOFF_MAX);
    }

    #[test]
    fn dial_success_resets_backoff() {
        let pm = PeerManager::new(NodeId::generate());
        pm.observe("10.0.0.1", 7000, None);
        pm.record_dial_failure("10.0.0.1:7000");
        pm.record_dial_failure("10.0.0.1:7000");
        pm.record_dial_success("10.0.0.1:7000");

        let addrs = pm.addresses.lock();
        assert_eq!(addrs.get("10.0.0.1:7000").unwrap().backoff, BACKOFF_MIN);
    }
}
