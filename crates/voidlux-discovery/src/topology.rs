//! Diagnostic snapshot of what this node can see.

use crate::Dht;
use serde::Serialize;
use std::sync::Arc;
use voidlux_core::{NodeId, NodeRole, PeerInfo};
use voidlux_mesh::PeerManager;

/// A point-in-time view of the mesh from one node, served to the
/// dashboard by the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct TopologyView {
    /// The observing node.
    pub node_id: NodeId,
    /// Its role.
    pub role: NodeRole,
    /// Peers currently online.
    pub peers: Vec<PeerInfo>,
    /// Known dial addresses (connected or not).
    pub known_addresses: usize,
    /// DHT table size.
    pub dht_entries: usize,
    /// Non-empty DHT buckets, as `(index, occupancy)`.
    pub dht_buckets: Vec<(usize, usize)>,
}

impl TopologyView {
    /// Builds the snapshot.
    #[must_use]
    pub fn snapshot(
        node_id: NodeId,
        role: NodeRole,
        peers: &Arc<PeerManager>,
        dht: &Arc<Dht>,
    ) -> Self {
        let dht_buckets = dht
            .bucket_occupancy()
            .into_iter()
            .enumerate()
            .filter(|(_, n)| *n > 0)
            .collect();
        Self {
            node_id,
            role,
            peers: peers.online_peers(),
            known_addresses: peers.known_address_count(),
            dht_entries: dht.known_count(),
            dht_buckets,
        }
    }
}
