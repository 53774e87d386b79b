//! # VoidLux Mesh
//!
//! The TCP transport layer: listener, outbound dialer, per-connection
//! receive loops, broadcast fanout, the HMAC challenge/response auth
//! gate, and the peer manager that keeps the mesh connected.
//!
//! Upper layers never touch sockets. They implement [`MeshHandler`] and
//! receive decoded, auth-filtered messages; they send through
//! [`MeshServer::broadcast`] and [`MeshServer::send_to`]. That trait
//! boundary is what keeps the transport/gossip dependency cycle out of
//! the crate graph.

mod auth;
mod connection;
mod error;
mod handler;
mod peers;
mod server;

pub use auth::{compute_auth_hmac, AuthGate, AuthOutcome};
pub use connection::Connection;
pub use error::{MeshError, Result};
pub use handler::MeshHandler;
pub use peers::PeerManager;
pub use server::{MeshConfig, MeshServer};
