//! # VoidLux Discovery
//!
//! Three parallel mechanisms feed candidate peers into the mesh:
//!
//! 1. **UDP beacons** — broadcast every 10 s, multicast (TTL 4) every
//!    15 s, both carrying `{node_id, p2p_port, role}`.
//! 2. **Kademlia DHT** — 128-bit keyspace, K=8, α=3; iterative lookups
//!    over the existing TCP mesh, periodic self-announce and stale
//!    bucket refresh.
//! 3. **PEX** — every 30 s each node shares its connected peer list.
//!
//! Every source funnels into one [`PeerObserver::observe`] call, which
//! drops self-observations and feeds the peer manager's dial queue.

mod dht;
mod pex;
mod topology;
mod udp;

pub use dht::{Dht, DhtEntry, RoutingTable, ALPHA, K};
pub use pex::run_pex;
pub use topology::TopologyView;
pub use udp::{DiscoveryBeacon, UdpConfig, UdpDiscovery};

use voidlux_core::{NodeId, NodeRole};

/// The funnel every discovery source reports into.
pub trait PeerObserver: Send + Sync + 'static {
    /// A peer address was observed. Implementations dedupe by node id,
    /// drop self-observations, and enqueue a dial when not connected.
    fn observe(&self, host: &str, p2p_port: u16, node_id: Option<NodeId>, role: Option<NodeRole>);
}
