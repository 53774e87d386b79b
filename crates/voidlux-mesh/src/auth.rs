//! HMAC-SHA256 challenge/response connection gatekeeper.
//!
//! When a shared secret is configured the mesh is closed: a peer must
//! prove knowledge of the secret before any non-auth message is
//! delivered to upper layers. The role claimed in HELLO is bound into
//! the MAC input, so a worker cannot pass verification while claiming
//! to be an emperor.

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use voidlux_core::{NodeId, NodeRole};

type HmacSha256 = Hmac<Sha256>;

/// Challenge nonces expire after this long.
pub(crate) const NONCE_TTL: Duration = Duration::from_secs(30);

/// Protocol violators are ignored for this long.
const BLACKLIST_TTL: Duration = Duration::from_secs(60);

/// Domain-separated MAC input, versioned so the scheme can rotate.
fn auth_material(nonce: &str, node_id: &NodeId, role: NodeRole) -> String {
    format!("voidlux:auth:v1:{}:{}:{}", nonce, node_id.to_hex(), role)
}

/// Computes the hex HMAC a peer must present for a challenge.
#[must_use]
pub fn compute_auth_hmac(secret: &str, nonce: &str, node_id: &NodeId, role: NodeRole) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(auth_material(nonce, node_id, role).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Result of verifying an AUTH_RESPONSE.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The peer proved the secret.
    Accepted,
    /// Verification failed; the connection must close.
    Rejected(String),
}

/// The per-node auth gate: secret, nonce issuing, and the violation
/// blacklist.
pub struct AuthGate {
    secret: Option<String>,
    blacklist: Mutex<HashMap<NodeId, Instant>>,
}

impl AuthGate {
    /// Creates a gate. With no secret the mesh is open and every HELLO
    /// is accepted as-is.
    #[must_use]
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret,
            blacklist: Mutex::new(HashMap::new()),
        }
    }

    /// True when a shared secret is configured.
    #[must_use]
    pub fn requires_auth(&self) -> bool {
        self.secret.is_some()
    }

    /// Issues a fresh 256-bit challenge nonce.
    #[must_use]
    pub fn issue_nonce(&self) -> String {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Computes our response to a peer's challenge.
    ///
    /// Returns `None` when no secret is configured (we cannot answer,
    /// and the peer will reject us — mismatched deployments fail fast).
    #[must_use]
    pub fn answer_challenge(
        &self,
        nonce: &str,
        own_node_id: &NodeId,
        own_role: NodeRole,
    ) -> Option<String> {
        self.secret
            .as_deref()
            .map(|secret| compute_auth_hmac(secret, nonce, own_node_id, own_role))
    }

    /// Verifies a peer's AUTH_RESPONSE against the nonce we issued and
    /// the HELLO it sent. Comparison is constant-time.
    pub fn verify(
        &self,
        presented_hmac: &str,
        nonce: &str,
        issued_at: Instant,
        hello_node_id: &NodeId,
        hello_role: NodeRole,
        response_node_id: &NodeId,
        response_role: NodeRole,
    ) -> AuthOutcome {
        let Some(secret) = self.secret.as_deref() else {
            return AuthOutcome::Accepted;
        };

        if issued_at.elapsed() > NONCE_TTL {
            return AuthOutcome::Rejected("challenge expired".into());
        }
        if response_node_id != hello_node_id {
            return AuthOutcome::Rejected("node id drift from HELLO".into());
        }
        if response_role != hello_role {
            return AuthOutcome::Rejected("role drift from HELLO".into());
        }

        let Ok(presented) = hex::decode(presented_hmac) else {
            return AuthOutcome::Rejected("malformed hmac".into());
        };

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(auth_material(nonce, hello_node_id, hello_role).as_bytes());
        match mac.verify_slice(&presented) {
            Ok(()) => AuthOutcome::Accepted,
            Err(_) => AuthOutcome::Rejected("hmac mismatch".into()),
        }
    }

    /// Blacklists a node id after a protocol violation.
    pub fn blacklist(&self, node_id: NodeId) {
        self.blacklist.lock().insert(node_id, Instant::now());
    }

    /// True while a node id remains blacklisted. Expired entries are
    /// dropped on the way through.
    pub fn is_blacklisted(&self, node_id: &NodeId) -> bool {
        let mut blacklist = self.blacklist.lock();
        match blacklist.get(node_id) {
            Some(since) if since.elapsed() < BLACKLIST_TTL => true,
            Some(_) => {
                blacklist.remove(node_id);
                false
            }
            None => false,
        }
    }
}
