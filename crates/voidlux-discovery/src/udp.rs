//! UDP broadcast and multicast beacons.

use crate::PeerObserver;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, warn};
use voidlux_core::{NodeId, NodeRole};

/// The multicast group discovery uses.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 77, 86, 76);

/// Broadcast cadence.
const BROADCAST_INTERVAL: Duration = Duration::from_secs(10);
/// Multicast cadence.
const MULTICAST_INTERVAL: Duration = Duration::from_secs(15);

/// The JSON datagram both beacon flavors carry. Broadcast omits the
/// role and http port; multicast includes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryBeacon {
    /// Always `"HELLO"`.
    pub proto: String,
    /// The announcing node.
    pub node_id: NodeId,
    /// Its P2P listen port.
    pub p2p_port: u16,
    /// Its role (multicast only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<NodeRole>,
    /// Its HTTP port (multicast only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
}

/// UDP discovery configuration.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// This node's id (own beacons are ignored on receive).
    pub node_id: NodeId,
    /// Advertised P2P port.
    pub p2p_port: u16,
    /// Advertised HTTP port.
    pub http_port: u16,
    /// Advertised role.
    pub role: NodeRole,
    /// UDP port beacons travel on. The multicast socket binds the next
    /// port up so both can coexist on one host.
    pub discovery_port: u16,
}

/// Broadcast + multicast beacon tasks.
pub struct UdpDiscovery {
    config: UdpConfig,
}

impl UdpDiscovery {
    /// Creates the discovery driver.
    #[must_use]
    pub fn new(config: UdpConfig) -> Self {
        Self { config }
    }

    /// Spawns the broadcast and multicast tasks. Socket setup failures
    /// are logged and the affected mechanism is skipped; discovery has
    /// two other legs.
    pub fn spawn(
        self,
        observer: Arc<dyn PeerObserver>,
        shutdown: watch::Receiver<bool>,
    ) {
        let config = self.config.clone();
        let obs = Arc::clone(&observer);
        let sd = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_broadcast(config, obs, sd).await {
                warn!(error = %e, "udp broadcast discovery stopped");
            }
        });

        let config = self.config;
        tokio::spawn(async move {
            if let Err(e) = run_multicast(config, observer, shutdown).await {
                warn!(error = %e, "multicast discovery stopped");
            }
        });
    }
}

async fn run_broadcast(
    config: UdpConfig,
    observer: Arc<dyn PeerObserver>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", config.discovery_port)).await?;
    socket.set_broadcast(true)?;
    let target = SocketAddr::from((Ipv4Addr::BROADCAST, config.discovery_port));

    let beacon = DiscoveryBeacon {
        proto: "HELLO".into(),
        node_id: config.node_id,
        p2p_port: config.p2p_port,
        role: None,
        http_port: None,
    };
    let payload = serde_json::to_vec(&beacon).expect("beacon serializes");

    let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&payload, target).await {
                    debug!(error = %e, "broadcast beacon send failed");
                }
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, src)) => handle_beacon(&buf[..n], src, &config, &observer),
                    Err(e) => debug!(error = %e, "broadcast recv failed"),
                }
            }
        }
    }
    Ok(())
}

async fn run_multicast(
    config: UdpConfig,
    observer: Arc<dyn PeerObserver>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let port = config.discovery_port + 1;
    let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
    socket.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(4)?;
    socket.set_multicast_loop_v4(false)?;
    let target = SocketAddr::from((MULTICAST_GROUP, port));

    let beacon = DiscoveryBeacon {
        proto: "HELLO".into(),
        node_id: config.node_id,
        p2p_port: config.p2p_port,
        role: Some(config.role),
        http_port: Some(config.http_port),
    };
    let payload = serde_json::to_vec(&beacon).expect("beacon serializes");

    let mut ticker = tokio::time::interval(MULTICAST_INTERVAL);
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&payload, target).await {
                    debug!(error = %e, "multicast beacon send failed");
                }
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, src)) => handle_beacon(&buf[..n], src, &config, &observer),
                    Err(e) => debug!(error = %e, "multicast recv failed"),
                }
            }
        }
    }
    Ok(())
}

fn handle_beacon(
    data: &[u8],
    src: SocketAddr,
    config: &UdpConfig,
    observer: &Arc<dyn PeerObserver>,
) {
    let Ok(beacon) = serde_json::from_slice::<DiscoveryBeacon>(data) else {
        return; // foreign traffic on the port
    };
    if beacon.proto != "HELLO" || beacon.node_id == config.node_id {
        return;
    }
    debug!(
        node = %beacon.node_id.short(),
        src = %src,
        p2p_port = beacon.p2p_port,
        "beacon received"
    );
    observer.observe(
        &src.ip().to_string(),
        beacon.p2p_port,
        Some(beacon.node_id),
        beacon.role,
    );
}
