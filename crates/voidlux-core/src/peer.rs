//! Peer descriptor shared between mesh, discovery, and gossip.

use crate::{NodeId, NodeRole, Timestamp};
use serde::{Deserialize, Serialize};

/// A currently-known other node.
///
/// The live connection handle is owned by the mesh; this record carries
/// everything the rest of the system needs to know about the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's node id.
    pub node_id: NodeId,
    /// Reachable host.
    pub host: String,
    /// P2P listen port.
    pub p2p_port: u16,
    /// HTTP control-plane port.
    pub http_port: u16,
    /// Role the peer announced (and, when auth is on, proved).
    pub role: NodeRole,
    /// Whether the peer passed the HMAC handshake.
    pub authenticated: bool,
    /// Last time any message arrived from the peer.
    pub last_seen: Timestamp,
    /// Exponential moving average of round-trip latency.
    pub latency_ms: f64,
}

impl PeerInfo {
    /// Creates a record for a freshly-seen peer.
    #[must_use]
    pub fn new(node_id: NodeId, host: impl Into<String>, p2p_port: u16, role: NodeRole) -> Self {
        Self {
            node_id,
            host: host.into(),
            p2p_port,
            http_port: 0,
            role,
            authenticated: false,
            last_seen: Timestamp::now(),
            latency_ms: 0.0,
        }
    }

    /// Updates the last-seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen = Timestamp::now();
    }

    /// Folds a latency sample into the EMA (alpha = 0.3).
    pub fn record_latency(&mut self, sample_ms: f64) {
        if self.latency_ms == 0.0 {
            self.latency_ms = sample_ms;
        } else {
            self.latency_ms = 0.3 * sample_ms + 0.7 * self.latency_ms;
        }
    }

    /// The `host:p2p_port` dial address.
    #[must_use]
    pub fn p2p_addr(&self) -> String {
        format!("{}:{}", self.host, self.p2p_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_ema_converges() {
        let mut peer = PeerInfo::new(NodeId::generate(), "10.0.0.1", 7000, NodeRole::Worker);
        peer.record_latency(100.0);
        assert_eq!(peer.latency_ms, 100.0);
        peer.record_latency(50.0);
        assert!(peer.latency_ms < 100.0 && peer.latency_ms > 50.0);
    }
}
