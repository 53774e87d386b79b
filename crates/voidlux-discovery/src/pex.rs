//! Peer exchange: periodically share the connected peer list.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use voidlux_mesh::{MeshServer, PeerManager};
use voidlux_wire::{Message, Pex, PexEntry};

/// PEX broadcast cadence.
const PEX_INTERVAL: Duration = Duration::from_secs(30);

/// Broadcasts our connected peers every 30 seconds. Receiving sides
/// feed entries into the observer funnel (wired in the node).
pub async fn run_pex(
    mesh: Arc<MeshServer>,
    peers: Arc<PeerManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(PEX_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let entries: Vec<PexEntry> = peers
                    .online_peers()
                    .into_iter()
                    .map(|p| PexEntry {
                        node_id: p.node_id,
                        host: p.host,
                        p2p_port: p.p2p_port,
                        role: p.role,
                    })
                    .collect();
                if entries.is_empty() {
                    continue;
                }
                mesh.broadcast(&Message::Pex(Pex { peers: entries }), None).await;
            }
        }
    }
}
