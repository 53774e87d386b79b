//! A single authenticated TCP connection to a peer.

use crate::{MeshError, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use voidlux_core::NodeId;
use voidlux_wire::{encode_frame, Hello, Message};

/// Mutable per-connection state guarded by the auth gate.
#[derive(Debug, Default)]
pub(crate) struct ConnState {
    /// The HELLO the remote side sent, once received.
    pub hello: Option<Hello>,
    /// The nonce we challenged the remote with, and when.
    pub sent_nonce: Option<(String, Instant)>,
    /// True once the remote proved the shared secret (or immediately
    /// after HELLO when no secret is configured).
    pub authenticated: bool,
    /// Guards the one-shot ready callback.
    pub ready_fired: bool,
    /// Outstanding keepalive probe: sequence number and send time.
    pub pending_ping: Option<(u64, Instant)>,
}

/// One live peer connection: the write half plus handshake state.
///
/// The read half is consumed by the receive task the server spawns; it
/// never appears here.
pub struct Connection {
    /// Remote socket address (the ephemeral peer address, not the
    /// peer's listen address).
    pub remote_addr: SocketAddr,
    /// True for connections we dialed, false for accepted ones.
    pub outbound: bool,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    pub(crate) state: RwLock<ConnState>,
}

impl Connection {
    pub(crate) fn new(remote_addr: SocketAddr, writer: OwnedWriteHalf, outbound: bool) -> Self {
        Self {
            remote_addr,
            outbound,
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            state: RwLock::new(ConnState::default()),
        }
    }

    /// Encodes and sends one message.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let envelope = msg.encode()?;
        self.send_frame(&encode_frame(&envelope)?).await
    }

    /// Sends a pre-encoded frame (broadcast encodes once, sends many).
    pub async fn send_frame(&self, frame: &Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(MeshError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        Ok(())
    }

    /// The remote's node id, once its HELLO arrived.
    #[must_use]
    pub fn node_id(&self) -> Option<NodeId> {
        self.state.read().hello.as_ref().map(|h| h.node_id)
    }

    /// The remote's HELLO, once received.
    #[must_use]
    pub fn hello(&self) -> Option<Hello> {
        self.state.read().hello.clone()
    }

    /// True once the remote passed the auth gate.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state.read().authenticated
    }

    /// True once either side closed the connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the connection closed and shuts down the write half. The
    /// receive task observes EOF and finishes the cleanup.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Marks closed without touching the socket (receive side observed
    /// EOF first).
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .field("node_id", &self.node_id())
            .field("authenticated", &self.is_authenticated())
            .field("closed", &self.is_closed())
            .finish()
    }
}
