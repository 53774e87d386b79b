//! Kademlia-style DHT over the TCP mesh.
//!
//! 128-bit keyspace shared with node ids, XOR distance, K=8 bucket
//! width, α=3 lookup parallelism. Lookups ride the existing mesh
//! connections as `DHT_DISC_LOOKUP` / `DHT_DISC_LOOKUP_RSP` envelopes;
//! there is no separate DHT socket.

use crate::PeerObserver;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::debug;
use voidlux_core::NodeId;
use voidlux_mesh::MeshServer;
use voidlux_wire::{DhtAnnounce, DhtLookup, DhtLookupRsp, Message, PexEntry};

/// Bucket width: how many peers each k-bucket retains.
pub const K: usize = 8;
/// Lookup parallelism.
pub const ALPHA: usize = 3;
/// Lookup rounds before giving up.
const LOOKUP_ROUNDS: usize = 5;
/// Per-round response wait.
const ROUND_TIMEOUT: Duration = Duration::from_secs(5);
/// Buckets idle longer than this get a refresh lookup.
const BUCKET_IDLE: Duration = Duration::from_secs(300);
/// Entries older than this are eviction candidates when a bucket fills.
const ENTRY_STALE: Duration = Duration::from_secs(300);
/// Failure count that marks an entry evictable.
const ENTRY_MAX_FAILS: u32 = 3;
/// Announce cadence.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// One routing table entry.
#[derive(Debug, Clone)]
pub struct DhtEntry {
    /// The peer's node id (its DHT key).
    pub node_id: NodeId,
    /// Reachable host.
    pub host: String,
    /// P2P listen port.
    pub p2p_port: u16,
    /// Last time the entry was seen or confirmed.
    pub last_seen: Instant,
    /// Consecutive failures talking to this peer.
    pub fail_count: u32,
}

#[derive(Debug)]
struct Bucket {
    /// Oldest at the front; a hit moves the entry to the back.
    entries: VecDeque<DhtEntry>,
    last_activity: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }
}

/// XOR distance between two 128-bit ids, as a comparable integer.
fn distance(a: &NodeId, b: &NodeId) -> u128 {
    let mut xor = [0u8; 16];
    for (i, byte) in xor.iter_mut().enumerate() {
        *byte = a.as_bytes()[i] ^ b.as_bytes()[i];
    }
    u128::from_be_bytes(xor)
}

/// The k-bucket routing table.
#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    /// Creates an empty table centered on the local id.
    #[must_use]
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            buckets: (0..128).map(|_| Bucket::new()).collect(),
        }
    }

    /// Bucket index for an id: position of the highest differing bit.
    /// `None` for the local id itself.
    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        let d = distance(&self.self_id, id);
        if d == 0 {
            None
        } else {
            Some(127 - d.leading_zeros() as usize)
        }
    }

    /// Inserts or refreshes an entry.
    ///
    /// A known id moves to the back of its bucket. When the bucket is
    /// full, the first stale-or-failing entry is evicted; with none, the
    /// insert is rejected — long-lived peers are worth more than churn.
    /// Returns true when the entry ended up in the table.
    pub fn upsert(&mut self, entry: DhtEntry) -> bool {
        let Some(index) = self.bucket_index(&entry.node_id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        bucket.last_activity = Instant::now();

        if let Some(pos) = bucket
            .entries
            .iter()
            .position(|e| e.node_id == entry.node_id)
        {
            let mut existing = bucket.entries.remove(pos).expect("position just found");
            existing.host = entry.host;
            existing.p2p_port = entry.p2p_port;
            existing.last_seen = Instant::now();
            existing.fail_count = 0;
            bucket.entries.push_back(existing);
            return true;
        }

        if bucket.entries.len() < K {
            bucket.entries.push_back(entry);
            return true;
        }

        let evict = bucket.entries.iter().position(|e| {
            e.last_seen.elapsed() > ENTRY_STALE || e.fail_count >= ENTRY_MAX_FAILS
        });
        match evict {
            Some(pos) => {
                bucket.entries.remove(pos);
                bucket.entries.push_back(entry);
                true
            }
            None => false,
        }
    }

    /// Bumps an entry's failure count.
    pub fn mark_failed(&mut self, node_id: &NodeId) {
        if let Some(index) = self.bucket_index(node_id) {
            if let Some(entry) = self.buckets[index]
                .entries
                .iter_mut()
                .find(|e| e.node_id == *node_id)
            {
                entry.fail_count += 1;
            }
        }
    }

    /// The up-to-`count` entries closest to `target` by XOR distance.
    #[must_use]
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<DhtEntry> {
        let mut all: Vec<DhtEntry> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect();
        all.sort_by_key(|e| distance(&e.node_id, target));
        all.truncate(count);
        all
    }

    /// Total entries across all buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    /// True when no entries are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-bucket occupancy for the topology view.
    #[must_use]
    pub fn bucket_occupancy(&self) -> Vec<usize> {
        self.buckets.iter().map(|b| b.entries.len()).collect()
    }

    /// Indexes of non-empty buckets idle past the refresh window.
    fn stale_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.entries.is_empty() && b.last_activity.elapsed() > BUCKET_IDLE)
            .map(|(i, _)| i)
            .collect()
    }

    /// A random id falling inside the given bucket's distance range.
    fn random_id_in_bucket(&self, index: usize) -> NodeId {
        use rand::Rng;
        let below: u128 = if index == 0 {
            0
        } else {
            rand::thread_rng().gen::<u128>() & ((1u128 << index) - 1)
        };
        let mask = (1u128 << index) | below;
        let self_bits = u128::from_be_bytes(*self.self_id.as_bytes());
        NodeId::from_bytes((self_bits ^ mask).to_be_bytes())
    }
}

/// The DHT driver: message handlers plus the announce/refresh loop.
pub struct Dht {
    self_id: NodeId,
    advertised_port: u16,
    table: Mutex<RoutingTable>,
    response_seen: Notify,
}

impl Dht {
    /// Creates the DHT for the local node.
    #[must_use]
    pub fn new(self_id: NodeId, advertised_port: u16) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            advertised_port,
            table: Mutex::new(RoutingTable::new(self_id)),
            response_seen: Notify::new(),
        })
    }

    /// Records a peer confirmed live by the mesh.
    pub fn record_peer(&self, node_id: NodeId, host: &str, p2p_port: u16) {
        self.table.lock().upsert(DhtEntry {
            node_id,
            host: host.to_string(),
            p2p_port,
            last_seen: Instant::now(),
            fail_count: 0,
        });
    }

    /// Answers a lookup with our K closest entries.
    #[must_use]
    pub fn handle_lookup(&self, req: &DhtLookup) -> DhtLookupRsp {
        let closer = self
            .table
            .lock()
            .closest(&req.target, K)
            .into_iter()
            .map(|e| PexEntry {
                node_id: e.node_id,
                host: e.host,
                p2p_port: e.p2p_port,
                role: voidlux_core::NodeRole::Worker,
            })
            .collect();
        DhtLookupRsp {
            target: req.target,
            closer,
        }
    }

    /// Folds a lookup response into the table and the observer funnel.
    pub fn handle_lookup_rsp(&self, rsp: &DhtLookupRsp, observer: &Arc<dyn PeerObserver>) {
        {
            let mut table = self.table.lock();
            for entry in &rsp.closer {
                if entry.node_id == self.self_id {
                    continue;
                }
                table.upsert(DhtEntry {
                    node_id: entry.node_id,
                    host: entry.host.clone(),
                    p2p_port: entry.p2p_port,
                    last_seen: Instant::now(),
                    fail_count: 0,
                });
                observer.observe(
                    &entry.host,
                    entry.p2p_port,
                    Some(entry.node_id),
                    Some(entry.role),
                );
            }
        }
        self.response_seen.notify_waiters();
    }

    /// Records an announce. `src_host` (the TCP peer address) stands in
    /// when the announcer did not know its own reachable host.
    pub fn handle_announce(
        &self,
        msg: &DhtAnnounce,
        src_host: &str,
        observer: &Arc<dyn PeerObserver>,
    ) {
        if msg.node_id == self.self_id {
            return;
        }
        let host = if msg.host.is_empty() || msg.host == "0.0.0.0" {
            src_host
        } else {
            &msg.host
        };
        self.record_peer(msg.node_id, host, msg.p2p_port);
        observer.observe(host, msg.p2p_port, Some(msg.node_id), None);
    }

    /// Iterative lookup: query the α closest known peers, wait for
    /// responses to improve the candidate set, stop after five rounds or
    /// when a round brings no improvement.
    pub async fn iterative_lookup(&self, target: NodeId, mesh: &Arc<MeshServer>) {
        let mut best = self
            .table
            .lock()
            .closest(&target, 1)
            .first()
            .map(|e| distance(&e.node_id, &target));

        for round in 0..LOOKUP_ROUNDS {
            let candidates = self.table.lock().closest(&target, ALPHA);
            if candidates.is_empty() {
                break;
            }

            let mut queried = 0;
            for entry in &candidates {
                let msg = Message::DhtLookup(DhtLookup {
                    target,
                    from: self.self_id,
                });
                if mesh.send_to(&entry.node_id, &msg).await {
                    queried += 1;
                } else {
                    self.table.lock().mark_failed(&entry.node_id);
                }
            }
            if queried == 0 {
                break;
            }

            let _ = tokio::time::timeout(ROUND_TIMEOUT, self.response_seen.notified()).await;

            let now_best = self
                .table
                .lock()
                .closest(&target, 1)
                .first()
                .map(|e| distance(&e.node_id, &target));
            let improved = match (best, now_best) {
                (Some(prev), Some(now)) => now < prev,
                (None, Some(_)) => true,
                _ => false,
            };
            debug!(round, improved, "dht lookup round");
            if !improved {
                break;
            }
            best = now_best;
        }
    }

    /// Current table size.
    #[must_use]
    pub fn known_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Per-bucket occupancy snapshot.
    #[must_use]
    pub fn bucket_occupancy(&self) -> Vec<usize> {
        self.table.lock().bucket_occupancy()
    }

    /// The announce/refresh loop: every 30 s announce ourselves to the K
    /// closest peers and refresh any bucket idle past five minutes.
    pub async fn run(
        self: Arc<Self>,
        mesh: Arc<MeshServer>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let closest = self.table.lock().closest(&self.self_id, K);
                    for entry in closest {
                        let msg = Message::DhtAnnounce(DhtAnnounce {
                            node_id: self.self_id,
                            host: String::new(),
                            p2p_port: self.advertised_port,
                        });
                        if !mesh.send_to(&entry.node_id, &msg).await {
                            self.table.lock().mark_failed(&entry.node_id);
                        }
                    }

                    let stale = self.table.lock().stale_buckets();
                    for index in stale {
                        let target = self.table.lock().random_id_in_bucket(index);
                        self.iterative_lookup(target, &mesh).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(node_id: NodeId) -> DhtEntry {
        DhtEntry {
            node_id,
            host: "10.0.0.1".into(),
            p2p_port: 7000,
            last_seen: Instant::now(),
            fail_count: 0,
        }
    }

    fn id_with_prefix(first: u8) -> NodeId {
        let mut bytes = [0u8; 16];
        bytes[0] = first;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn bucket_index_by_highest_differing_bit() {
        let table = RoutingTable::new(NodeId::from_bytes([0u8; 16]));
        // MSB differs: bucket 127.
        assert_eq!(table.bucket_index(&id_with_prefix(0x80)), Some(127));
        // Second bit differs: bucket 126.
        assert_eq!(table.bucket_index(&id_with_prefix(0x40)), Some(126));
        // Self: no bucket.
        assert_eq!(table.bucket_index(&NodeId::from_bytes([0u8; 16])), None);
    }

    #[test]
    fn upsert_moves_known_entry_to_back() {
        let mut table = RoutingTable::new(NodeId::from_bytes([0u8; 16]));
        let a = id_with_prefix(0x81);
        let b = id_with_prefix(0x82);

        assert!(table.upsert(entry(a)));
        assert!(table.upsert(entry(b)));

        // Re-seeing `a` moves it behind `b`.
        assert!(table.upsert(entry(a)));
        let bucket = &table.buckets[127];
        assert_eq!(bucket.entries.back().unwrap().node_id, a);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn full_bucket_rejects_fresh_entries() {
        let mut table = RoutingTable::new(NodeId::from_bytes([0u8; 16]));
        for i in 0..K as u8 {
            assert!(table.upsert(entry(id_with_prefix(0x80 | (i + 1)))));
        }
        // All K entries are fresh and healthy: the newcomer is rejected.
        assert!(!table.upsert(entry(id_with_prefix(0x9f))));
        assert_eq!(table.len(), K);
    }

    #[test]
    fn full_bucket_evicts_failing_entry() {
        let mut table = RoutingTable::new(NodeId::from_bytes([0u8; 16]));
        let victim = id_with_prefix(0x81);
        table.upsert(entry(victim));
        for i in 1..K as u8 {
            table.upsert(entry(id_with_prefix(0x80 | (i + 1))));
        }
        for _ in 0..ENTRY_MAX_FAILS {
            table.mark_failed(&victim);
        }

        let newcomer = id_with_prefix(0x9f);
        assert!(table.upsert(entry(newcomer)));
        assert_eq!(table.len(), K);
        assert!(table.buckets[127]
            .entries
            .iter()
            .all(|e| e.node_id != victim));
    }

    #[test]
    fn closest_orders_by_xor_distance() {
        let mut table = RoutingTable::new(NodeId::from_bytes([0u8; 16]));
        let near = id_with_prefix(0x01);
        let mid = id_with_prefix(0x10);
        let far = id_with_prefix(0x80);
        table.upsert(entry(far));
        table.upsert(entry(near));
        table.upsert(entry(mid));

        let target = NodeId::from_bytes([0u8; 16]);
        let closest = table.closest(&target, 2);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0].node_id, near);
        assert_eq!(closest[1].node_id, mid);
    }

    #[test]
    fn random_refresh_id_lands_in_bucket() {
        let table = RoutingTable::new(NodeId::generate());
        for index in [0usize, 5, 64, 127] {
            let id = table.random_id_in_bucket(index);
            assert_eq!(table.bucket_index(&id), Some(index));
        }
    }

    #[test]
    fn lookup_response_feeds_table_and_observer() {
        use parking_lot::Mutex as PlMutex;

        #[derive(Default)]
        struct Sink {
            count: PlMutex<usize>,
        }
        impl PeerObserver for Sink {
            fn observe(
                &self,
                _host: &str,
                _p2p_port: u16,
                _node_id: Option<NodeId>,
                _role: Option<voidlux_core::NodeRole>,
            ) {
                *self.count.lock() += 1;
            }
        }

        let me = NodeId::generate();
        let dht = Dht::new(me, 7000);
        let sink: Arc<Sink> = Arc::new(Sink::default());
        let observer: Arc<dyn PeerObserver> = sink.clone();

        let rsp = DhtLookupRsp {
            target: NodeId::generate(),
            closer: vec![
                PexEntry {
                    node_id: NodeId::generate(),
                    host: "10.0.0.2".into(),
                    p2p_port: 7001,
                    role: voidlux_core::NodeRole::Worker,
                },
                // Our own id must be skipped.
                PexEntry {
                    node_id: me,
                    host: "10.0.0.3".into(),
                    p2p_port: 7002,
                    role: voidlux_core::NodeRole::Worker,
                },
            ],
        };
        dht.handle_lookup_rsp(&rsp, &observer);

        assert_eq!(dht.known_count(), 1);
        assert_eq!(*sink.count.lock(), 1);
    }

    #[test]
    fn lookup_answers_with_closest() {
        let dht = Dht::new(NodeId::from_bytes([0u8; 16]), 7000);
        for i in 1..=12u8 {
            dht.record_peer(id_with_prefix(i), "10.0.0.1", 7000);
        }
        let rsp = dht.handle_lookup(&DhtLookup {
            target: id_with_prefix(1),
            from: NodeId::generate(),
        });
        assert!(rsp.closer.len() <= K);
        assert!(!rsp.closer.is_empty());
        assert_eq!(rsp.closer[0].node_id, id_with_prefix(1));
    }
}
