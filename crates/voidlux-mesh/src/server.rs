//! The TCP mesh server: listener, dialer, receive loops, fanout.

use crate::auth::{AuthGate, AuthOutcome};
use crate::connection::Connection;
use crate::{MeshError, MeshHandler, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use voidlux_core::{NodeId, NodeRole};
use voidlux_wire::{AuthResponse, FrameDecoder, Hello, Message, Ping, Pong};

/// Mesh configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// This node's id, announced in HELLO.
    pub node_id: NodeId,
    /// This node's role, announced in HELLO and bound into auth.
    pub role: NodeRole,
    /// Address the listener binds.
    pub listen_addr: SocketAddr,
    /// Port advertised to peers (the listener port, not an ephemeral one).
    pub p2p_port: u16,
    /// HTTP control-plane port advertised to peers.
    pub http_port: u16,
    /// Shared secret; when set the mesh is closed.
    pub auth_secret: Option<String>,
    /// Close a connection after this long without bytes.
    pub idle_timeout: Duration,
    /// PING cadence on live connections.
    pub keepalive_interval: Duration,
}

impl MeshConfig {
    /// Config with production timeouts for the given identity.
    #[must_use]
    pub fn new(node_id: NodeId, role: NodeRole, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            role,
            listen_addr,
            p2p_port: listen_addr.port(),
            http_port: 0,
            auth_secret: None,
            idle_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(20),
        }
    }
}

/// The mesh transport. One per node.
pub struct MeshServer {
    config: MeshConfig,
    gate: AuthGate,
    /// Live connections keyed by remote socket address. Outbound
    /// entries are keyed by the dialed address, which is what makes
    /// duplicate-dial dedup work.
    connections: DashMap<SocketAddr, Arc<Connection>>,
    /// Node id to connection address, populated on HELLO.
    by_node: DashMap<NodeId, SocketAddr>,
    handler: RwLock<Option<Arc<dyn MeshHandler>>>,
    local_addr: RwLock<Option<SocketAddr>>,
    ping_seq: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    /// Self-handle for spawning receive tasks from `&self` methods.
    me: std::sync::Weak<MeshServer>,
}

impl MeshServer {
    /// Creates a mesh server. Call [`MeshServer::start`] to bind.
    #[must_use]
    pub fn new(config: MeshConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let gate = AuthGate::new(config.auth_secret.clone());
        Arc::new_cyclic(|me| Self {
            config,
            gate,
            connections: DashMap::new(),
            by_node: DashMap::new(),
            handler: RwLock::new(None),
            local_addr: RwLock::new(None),
            ping_seq: AtomicU64::new(0),
            shutdown_tx,
            me: me.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.me.upgrade().expect("mesh server alive while in use")
    }

    /// Installs the upper-layer handler. Must happen before `start`.
    pub fn set_handler(&self, handler: Arc<dyn MeshHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// The auth gate (shared with the node wiring for blacklisting).
    #[must_use]
    pub fn gate(&self) -> &AuthGate {
        &self.gate
    }

    /// The bound listen address, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Binds the listener and spawns the accept and keepalive loops.
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let socket = match self.config.listen_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(self.config.listen_addr)?;
        let listener = socket.listen(1024)?;
        let addr = listener.local_addr()?;
        *self.local_addr.write() = Some(addr);

        info!(addr = %addr, node_id = %self.config.node_id.short(), "mesh listening");

        let server = self.arc();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                debug!(peer = %peer_addr, "accepted connection");
                                server.adopt(stream, peer_addr, false).await;
                            }
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                            }
                        }
                    }
                }
            }
        });

        let server = self.arc();
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.config.keepalive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => server.send_keepalives().await,
                }
            }
        });

        Ok(addr)
    }

    /// Dials a peer. A live connection to the same address is returned
    /// instead of opening a second one.
    pub async fn connect_to(&self, host: &str, port: u16) -> Result<Arc<Connection>> {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                MeshError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for {host}:{port}"),
                ))
            })?;

        if let Some(existing) = self.connections.get(&addr) {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing.value()));
            }
        }

        let stream = TcpStream::connect(addr).await?;
        debug!(peer = %addr, "dialed peer");
        self.adopt(stream, addr, true)
            .await
            .ok_or(MeshError::ConnectionClosed)
    }

    /// Registers a stream, spawns its receive task, and sends our HELLO.
    async fn adopt(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        outbound: bool,
    ) -> Option<Arc<Connection>> {
        let (read, write) = stream.into_split();
        let conn = Arc::new(Connection::new(addr, write, outbound));
        self.connections.insert(addr, Arc::clone(&conn));

        let server = self.arc();
        let recv_conn = Arc::clone(&conn);
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            server.run_recv_loop(recv_conn, read, shutdown).await;
        });

        // An ephemeral listener (port 0 in config) advertises the port
        // it actually bound.
        let advertised_port = if self.config.p2p_port != 0 {
            self.config.p2p_port
        } else {
            self.local_addr().map_or(0, |a| a.port())
        };
        let hello = Message::Hello(Hello {
            node_id: self.config.node_id,
            p2p_port: advertised_port,
            http_port: self.config.http_port,
            role: self.config.role,
        });
        if let Err(e) = conn.send(&hello).await {
            debug!(peer = %addr, error = %e, "hello send failed");
            self.drop_connection(&conn).await;
            return None;
        }
        Some(conn)
    }

    /// Fans a message out to every ready connection. Send failures are
    /// logged and dropped; gossip tolerates loss.
    pub async fn broadcast(&self, msg: &Message, exclude_addr: Option<SocketAddr>) {
        let frame = match msg.encode().and_then(|e| voidlux_wire::encode_frame(&e)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "broadcast encode failed");
                return;
            }
        };

        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|entry| {
                let conn = entry.value();
                conn.is_authenticated()
                    && !conn.is_closed()
                    && Some(conn.remote_addr) != exclude_addr
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for conn in targets {
            if let Err(e) = conn.send_frame(&frame).await {
                debug!(peer = %conn.remote_addr, error = %e, "broadcast send dropped");
            }
        }
    }

    /// Sends to one node. Returns false when no live connection exists
    /// or the send failed.
    pub async fn send_to(&self, node_id: &NodeId, msg: &Message) -> bool {
        let Some(conn) = self.connection_for(node_id) else {
            return false;
        };
        match conn.send(msg).await {
            Ok(()) => true,
            Err(e) => {
                debug!(node = %node_id.short(), error = %e, "directed send failed");
                false
            }
        }
    }

    /// The live connection for a node id, if any.
    #[must_use]
    pub fn connection_for(&self, node_id: &NodeId) -> Option<Arc<Connection>> {
        let addr = *self.by_node.get(node_id)?;
        let conn = self.connections.get(&addr)?;
        (!conn.is_closed()).then(|| Arc::clone(conn.value()))
    }

    /// Node ids with ready connections.
    #[must_use]
    pub fn connected_node_ids(&self) -> Vec<NodeId> {
        self.by_node
            .iter()
            .filter(|entry| {
                self.connections
                    .get(entry.value())
                    .is_some_and(|c| c.is_authenticated() && !c.is_closed())
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// True when a live connection exists to the given remote address.
    #[must_use]
    pub fn has_connection_to(&self, addr: &SocketAddr) -> bool {
        self.connections
            .get(addr)
            .is_some_and(|c| !c.is_closed())
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|e| !e.value().is_closed())
            .count()
    }

    /// Stops the listener, keepalives, and every connection.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let conns: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for conn in conns {
            conn.close().await;
        }
        self.connections.clear();
        self.by_node.clear();
    }

    async fn send_keepalives(&self) {
        let conns: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|e| !e.value().is_closed())
            .map(|e| Arc::clone(e.value()))
            .collect();

        for conn in conns {
            let seq = self.ping_seq.fetch_add(1, Ordering::Relaxed);
            conn.state.write().pending_ping = Some((seq, Instant::now()));
            if let Err(e) = conn.send(&Message::Ping(Ping { seq })).await {
                debug!(peer = %conn.remote_addr, error = %e, "keepalive send failed");
            }
        }
    }

    async fn run_recv_loop(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut read: OwnedReadHalf,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 16 * 1024];

        'outer: loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = timeout(self.config.idle_timeout, read.read(&mut buf)) => {
                    match result {
                        // No bytes for the idle window: close.
                        Err(_) => {
                            debug!(peer = %conn.remote_addr, "idle timeout");
                            break;
                        }
                        Ok(Ok(0)) => break, // EOF
                        Ok(Ok(n)) => {
                            decoder.feed(&buf[..n]);
                            loop {
                                match decoder.next_frame() {
                                    Ok(Some(frame)) => {
                                        if let Err(e) = self.handle_frame(&conn, &frame).await {
                                            debug!(peer = %conn.remote_addr, error = %e, "closing connection");
                                            break 'outer;
                                        }
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        // Unframeable stream: protocol violation.
                                        warn!(peer = %conn.remote_addr, error = %e, "frame violation");
                                        if let Some(node_id) = conn.node_id() {
                                            if conn.is_authenticated() {
                                                self.gate.blacklist(node_id);
                                            }
                                        }
                                        break 'outer;
                                    }
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            debug!(peer = %conn.remote_addr, error = %e, "read error");
                            break;
                        }
                    }
                }
            }
        }

        self.drop_connection(&conn).await;
    }

    async fn handle_frame(&self, conn: &Arc<Connection>, frame: &[u8]) -> Result<()> {
        let msg = match Message::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                if let Some(node_id) = conn.node_id() {
                    if conn.is_authenticated() {
                        self.gate.blacklist(node_id);
                    }
                }
                return Err(e.into());
            }
        };

        let opcode = msg.opcode();
        if !conn.is_authenticated() && !opcode.allowed_pre_auth() {
            return Err(MeshError::AuthFailed(format!(
                "{opcode} before authentication"
            )));
        }

        match msg {
            Message::Hello(hello) => self.handle_hello(conn, hello).await,
            Message::AuthChallenge(challenge) => {
                let hmac = self
                    .gate
                    .answer_challenge(&challenge.nonce, &self.config.node_id, self.config.role)
                    // No local secret on a closed mesh: present an empty
                    // proof and let the peer reject us.
                    .unwrap_or_default();
                conn.send(&Message::AuthResponse(AuthResponse {
                    hmac,
                    node_id: self.config.node_id,
                    role: self.config.role,
                }))
                .await
            }
            Message::AuthResponse(response) => self.handle_auth_response(conn, response).await,
            Message::AuthReject(reject) => {
                warn!(peer = %conn.remote_addr, reason = %reject.reason, "peer rejected our auth");
                Err(MeshError::AuthFailed(reject.reason))
            }
            Message::Ping(ping) => conn.send(&Message::Pong(Pong { seq: ping.seq })).await,
            Message::Pong(pong) => {
                let pending = conn.state.write().pending_ping.take();
                if let Some((seq, sent_at)) = pending {
                    if seq == pong.seq {
                        if let Some(node_id) = conn.node_id() {
                            let rtt_ms = sent_at.elapsed().as_secs_f64() * 1000.0;
                            if let Some(handler) = self.handler.read().clone() {
                                handler.on_latency(node_id, rtt_ms);
                            }
                        }
                    }
                }
                Ok(())
            }
            other => {
                if let Some(handler) = self.handler.read().clone() {
                    handler.on_message(Arc::clone(conn), other);
                }
                Ok(())
            }
        }
    }

    async fn handle_hello(&self, conn: &Arc<Connection>, hello: Hello) -> Result<()> {
        if hello.node_id == self.config.node_id {
            // Dialed ourselves through a broadcast echo.
            return Err(MeshError::AuthFailed("self connection".into()));
        }
        if self.gate.is_blacklisted(&hello.node_id) {
            return Err(MeshError::AuthFailed("blacklisted".into()));
        }

        debug!(
            peer = %conn.remote_addr,
            node = %hello.node_id.short(),
            role = %hello.role,
            "hello received"
        );

        conn.state.write().hello = Some(hello.clone());
        self.by_node.insert(hello.node_id, conn.remote_addr);

        if self.gate.requires_auth() {
            let nonce = self.gate.issue_nonce();
            conn.state.write().sent_nonce = Some((nonce.clone(), Instant::now()));
            conn.send(&Message::AuthChallenge(voidlux_wire::AuthChallenge { nonce }))
                .await
        } else {
            self.mark_ready(conn, hello);
            Ok(())
        }
    }

    async fn handle_auth_response(
        &self,
        conn: &Arc<Connection>,
        response: AuthResponse,
    ) -> Result<()> {
        let (hello, nonce) = {
            let state = conn.state.read();
            (state.hello.clone(), state.sent_nonce.clone())
        };
        let Some(hello) = hello else {
            return Err(MeshError::AuthFailed("auth response before hello".into()));
        };
        let Some((nonce, issued_at)) = nonce else {
            return Err(MeshError::AuthFailed("unsolicited auth response".into()));
        };

        match self.gate.verify(
            &response.hmac,
            &nonce,
            issued_at,
            &hello.node_id,
            hello.role,
            &response.node_id,
            response.role,
        ) {
            AuthOutcome::Accepted => {
                debug!(node = %hello.node_id.short(), "peer authenticated");
                self.mark_ready(conn, hello);
                Ok(())
            }
            AuthOutcome::Rejected(reason) => {
                let _ = conn
                    .send(&Message::AuthReject(voidlux_wire::AuthReject {
                        reason: reason.clone(),
                    }))
                    .await;
                Err(MeshError::AuthFailed(reason))
            }
        }
    }

    fn mark_ready(&self, conn: &Arc<Connection>, hello: Hello) {
        let fire = {
            let mut state = conn.state.write();
            state.authenticated = true;
            let fire = !state.ready_fired;
            state.ready_fired = true;
            fire
        };
        if fire {
            if let Some(handler) = self.handler.read().clone() {
                handler.on_peer_ready(Arc::clone(conn), hello);
            }
        }
    }

    async fn drop_connection(&self, conn: &Arc<Connection>) {
        conn.mark_closed();
        let node_id = conn.node_id();

        // Only clear map entries that still point at this connection;
        // a redial may have replaced them already.
        if let Some(entry) = self.connections.get(&conn.remote_addr) {
            if Arc::ptr_eq(entry.value(), conn) {
                drop(entry);
                self.connections.remove(&conn.remote_addr);
            }
        }
        if let Some(id) = node_id {
            if let Some(entry) = self.by_node.get(&id) {
                if *entry.value() == conn.remote_addr {
                    drop(entry);
                    self.by_node.remove(&id);
                }
            }
        }

        if let Some(handler) = self.handler.read().clone() {
            handler.on_disconnect(conn.remote_addr, node_id);
        }
    }
}
