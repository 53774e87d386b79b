//! Callback seam between the transport and the layers above it.

use crate::Connection;
use std::net::SocketAddr;
use std::sync::Arc;
use voidlux_core::NodeId;
use voidlux_wire::{Hello, Message};

/// Implemented by the node wiring; receives decoded, auth-filtered
/// traffic from the mesh.
///
/// Callbacks run on connection receive tasks and must return promptly;
/// anything slow belongs in a spawned task.
pub trait MeshHandler: Send + Sync + 'static {
    /// A connection passed the auth gate (or sent HELLO on an open
    /// mesh). Fired once per connection.
    fn on_peer_ready(&self, conn: Arc<Connection>, hello: Hello);

    /// A post-auth domain message arrived.
    fn on_message(&self, conn: Arc<Connection>, msg: Message);

    /// The connection went away.
    fn on_disconnect(&self, addr: SocketAddr, node_id: Option<NodeId>);

    /// A keepalive round-trip completed.
    fn on_latency(&self, _node_id: NodeId, _rtt_ms: f64) {}
}
