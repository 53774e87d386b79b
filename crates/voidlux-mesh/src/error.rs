//! Mesh errors.

use thiserror::Error;

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Socket-level failure. Transient: the peer manager redials later.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Codec failure. A protocol violation; the connection closes.
    #[error("wire error: {0}")]
    Wire(#[from] voidlux_wire::WireError),

    /// The connection is already closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// No live connection to the requested node.
    #[error("not connected to node {0}")]
    NotConnected(String),

    /// The HMAC handshake failed.
    #[error("authentication failed: {0}")]
    AuthFailed(String),
}

/// A specialized Result type for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;
