//! Mesh transport E2E tests over loopback TCP.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use voidlux_core::{NodeId, NodeRole};
use voidlux_mesh::{Connection, MeshConfig, MeshHandler, MeshServer};
use voidlux_wire::{Hello, Message, Ping};

/// Records everything the mesh delivers, for assertions.
#[derive(Default)]
struct Recorder {
    ready: Mutex<Vec<Hello>>,
    messages: Mutex<Vec<Message>>,
    disconnects: Mutex<Vec<Option<NodeId>>>,
}

impl MeshHandler for Recorder {
    fn on_peer_ready(&self, _conn: Arc<Connection>, hello: Hello) {
        self.ready.lock().push(hello);
    }

    fn on_message(&self, _conn: Arc<Connection>, msg: Message) {
        self.messages.lock().push(msg);
    }

    fn on_disconnect(&self, _addr: SocketAddr, node_id: Option<NodeId>) {
        self.disconnects.lock().push(node_id);
    }
}

fn server(role: NodeRole, secret: Option<&str>) -> (Arc<MeshServer>, Arc<Recorder>) {
    let mut config = MeshConfig::new(
        NodeId::generate(),
        role,
        "127.0.0.1:0".parse().unwrap(),
    );
    config.auth_secret = secret.map(String::from);
    let mesh = MeshServer::new(config);
    let recorder = Arc::new(Recorder::default());
    mesh.set_handler(recorder.clone());
    (mesh, recorder)
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn open_mesh_handshake() {
    let (a, rec_a) = server(NodeRole::Emperor, None);
    let (b, rec_b) = server(NodeRole::Worker, None);

    let addr_a = a.start().await.unwrap();
    b.start().await.unwrap();

    b.connect_to("127.0.0.1", addr_a.port()).await.unwrap();

    assert!(wait_until(|| !rec_a.ready.lock().is_empty()).await);
    assert!(wait_until(|| !rec_b.ready.lock().is_empty()).await);

    assert_eq!(rec_a.ready.lock()[0].node_id, b.node_id());
    assert_eq!(rec_b.ready.lock()[0].node_id, a.node_id());
    assert_eq!(rec_b.ready.lock()[0].role, NodeRole::Emperor);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn shared_secret_handshake_succeeds() {
    let (a, rec_a) = server(NodeRole::Worker, Some("the-secret"));
    let (b, rec_b) = server(NodeRole::Worker, Some("the-secret"));

    let addr_a = a.start().await.unwrap();
    b.start().await.unwrap();
    b.connect_to("127.0.0.1", addr_a.port()).await.unwrap();

    assert!(wait_until(|| !rec_a.ready.lock().is_empty()).await);
    assert!(wait_until(|| !rec_b.ready.lock().is_empty()).await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn mismatched_secrets_close_both_sides() {
    let (a, rec_a) = server(NodeRole::Worker, Some("secret-one"));
    let (b, rec_b) = server(NodeRole::Worker, Some("secret-two"));

    let addr_a = a.start().await.unwrap();
    b.start().await.unwrap();
    let _ = b.connect_to("127.0.0.1", addr_a.port()).await;

    // Verification fails on both sides; the connection dies.
    assert!(wait_until(|| a.connection_count() == 0 && b.connection_count() == 0).await);
    assert!(rec_a.ready.lock().is_empty());
    assert!(rec_b.ready.lock().is_empty());

    // Nothing domain-level crossed the wire.
    assert!(rec_a.messages.lock().is_empty());
    assert!(rec_b.messages.lock().is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn secretless_dialer_rejected_by_closed_mesh() {
    let (a, rec_a) = server(NodeRole::Worker, Some("closed"));
    let (b, _rec_b) = server(NodeRole::Worker, None);

    let addr_a = a.start().await.unwrap();
    b.start().await.unwrap();
    let _ = b.connect_to("127.0.0.1", addr_a.port()).await;

    assert!(wait_until(|| a.connection_count() == 0).await);
    assert!(rec_a.ready.lock().is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn broadcast_reaches_ready_peers() {
    let (a, _rec_a) = server(NodeRole::Emperor, None);
    let (b, rec_b) = server(NodeRole::Worker, None);
    let (c, rec_c) = server(NodeRole::Worker, None);

    let addr_a = a.start().await.unwrap();
    b.start().await.unwrap();
    c.start().await.unwrap();

    b.connect_to("127.0.0.1", addr_a.port()).await.unwrap();
    c.connect_to("127.0.0.1", addr_a.port()).await.unwrap();
    assert!(wait_until(|| a.connected_node_ids().len() == 2).await);

    // CensusRequest is a domain message, delivered via on_message.
    a.broadcast(
        &Message::CensusRequest(voidlux_wire::CensusRequest { from: a.node_id() }),
        None,
    )
    .await;

    assert!(wait_until(|| !rec_b.messages.lock().is_empty()).await);
    assert!(wait_until(|| !rec_c.messages.lock().is_empty()).await);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn send_to_targets_one_node() {
    let (a, _rec_a) = server(NodeRole::Emperor, None);
    let (b, rec_b) = server(NodeRole::Worker, None);
    let (c, rec_c) = server(NodeRole::Worker, None);

    let addr_a = a.start().await.unwrap();
    b.start().await.unwrap();
    c.start().await.unwrap();
    b.connect_to("127.0.0.1", addr_a.port()).await.unwrap();
    c.connect_to("127.0.0.1", addr_a.port()).await.unwrap();
    assert!(wait_until(|| a.connected_node_ids().len() == 2).await);

    let msg = Message::CensusRequest(voidlux_wire::CensusRequest { from: a.node_id() });
    assert!(a.send_to(&b.node_id(), &msg).await);

    assert!(wait_until(|| !rec_b.messages.lock().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rec_c.messages.lock().is_empty());

    // Unknown node id: no connection.
    assert!(!a.send_to(&NodeId::generate(), &msg).await);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn duplicate_dial_returns_existing_connection() {
    let (a, _rec_a) = server(NodeRole::Worker, None);
    let (b, _rec_b) = server(NodeRole::Worker, None);

    let addr_a = a.start().await.unwrap();
    b.start().await.unwrap();

    let first = b.connect_to("127.0.0.1", addr_a.port()).await.unwrap();
    let second = b.connect_to("127.0.0.1", addr_a.port()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn pre_auth_domain_message_closes_connection() {
    let (a, rec_a) = server(NodeRole::Worker, Some("closed"));
    let addr_a = a.start().await.unwrap();

    // A raw client that skips the handshake and fires a domain message.
    use tokio::io::AsyncWriteExt;
    let mut stream = tokio::net::TcpStream::connect(addr_a).await.unwrap();
    let msg = Message::Ping(Ping { seq: 1 });
    // Ping is allowed pre-auth; a census request is not.
    let frame = voidlux_wire::encode_frame(&msg.encode().unwrap()).unwrap();
    stream.write_all(&frame).await.unwrap();

    let bad = Message::CensusRequest(voidlux_wire::CensusRequest {
        from: NodeId::generate(),
    });
    let frame = voidlux_wire::encode_frame(&bad.encode().unwrap()).unwrap();
    stream.write_all(&frame).await.unwrap();

    assert!(wait_until(|| a.connection_count() == 0).await);
    assert!(rec_a.messages.lock().is_empty());

    a.shutdown().await;
}
