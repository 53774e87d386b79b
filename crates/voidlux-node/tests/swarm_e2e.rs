//! Multi-node swarm E2E tests over loopback TCP.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use voidlux_consensus::ElectionConfig;
use voidlux_core::{Agent, AgentId, NodeRole, SwarmEvent, Task, TaskStatus};
use voidlux_node::{Node, NodeConfig};

fn fast_election() -> ElectionConfig {
    ElectionConfig {
        heartbeat_interval: Duration::from_secs(1),
        stale_after: Duration::from_secs(3),
        tally_base: Duration::from_millis(300),
        tally_jitter: Duration::from_millis(200),
    }
}

fn config(role: NodeRole, data_dir: &TempDir, seeds: Vec<String>) -> NodeConfig {
    NodeConfig {
        role,
        listen_host: "127.0.0.1".into(),
        p2p_port: 0,
        http_port: 0,
        discovery_port: 0,
        udp_discovery: false,
        data_dir: data_dir.path().to_path_buf(),
        seeds,
        auth_secret: None,
        cluster_size: None,
        log_level: "warn".into(),
        log_format: "pretty".into(),
        election: fast_election(),
    }
}

async fn start(role: NodeRole, data_dir: &TempDir, seeds: Vec<String>) -> Arc<Node> {
    Node::start(config(role, data_dir, seeds)).await.unwrap()
}

fn seed_of(node: &Node) -> String {
    format!("127.0.0.1:{}", node.p2p_addr().port())
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn tasks_gossip_between_nodes() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    let a = start(NodeRole::Emperor, &dir_a, vec![]).await;
    let b = start(NodeRole::Worker, &dir_b, vec![seed_of(&a)]).await;

    assert!(wait_until(|| a.peer_count() == 1 && b.peer_count() == 1).await);

    let task = a
        .enqueue(Task::new("replicate me", "detail", a.node_id()))
        .await
        .unwrap();

    assert!(
        wait_until(|| b.get_task(&task.id).ok().flatten().is_some()).await,
        "task did not replicate to B"
    );
    let replicated = b.get_task(&task.id).unwrap().unwrap();
    assert_eq!(replicated.title, "replicate me");
    assert_eq!(replicated.status, TaskStatus::Pending);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn two_node_claim_race_has_one_winner() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    // Two workers: no emperor means no dispatcher interference.
    let a = start(NodeRole::Worker, &dir_a, vec![]).await;
    let b = start(NodeRole::Worker, &dir_b, vec![seed_of(&a)]).await;
    assert!(wait_until(|| a.peer_count() == 1 && b.peer_count() == 1).await);

    let task = a
        .enqueue(Task::new("contested", "d", a.node_id()))
        .await
        .unwrap();
    assert!(wait_until(|| b.get_task(&task.id).ok().flatten().is_some()).await);

    // Both nodes claim concurrently for different agents.
    let agent_a = AgentId::generate();
    let agent_b = AgentId::generate();
    let (won_a, won_b) = tokio::join!(a.claim(&task.id, &agent_a), b.claim(&task.id, &agent_b));
    // Each local conditional UPDATE can win locally; gossip resolves.
    assert!(won_a.unwrap() || won_b.unwrap());

    // Both replicas converge on a single winner.
    assert!(
        wait_until(|| {
            let ta = a.get_task(&task.id).unwrap().unwrap();
            let tb = b.get_task(&task.id).unwrap().unwrap();
            ta.assigned_to.is_some()
                && ta.assigned_to == tb.assigned_to
                && ta.assigned_node == tb.assigned_node
        })
        .await,
        "claim race did not converge"
    );

    let winner = a.get_task(&task.id).unwrap().unwrap();
    assert!(winner.assigned_to == Some(agent_a) || winner.assigned_to == Some(agent_b));
    assert_eq!(winner.status, TaskStatus::Claimed);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn emperor_dispatches_to_idle_agent() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    let a = start(NodeRole::Emperor, &dir_a, vec![]).await;
    let b = start(NodeRole::Worker, &dir_b, vec![seed_of(&a)]).await;
    assert!(wait_until(|| a.peer_count() == 1 && b.peer_count() == 1).await);

    // One idle agent on each node.
    let a1 = a
        .register_agent(Agent::new("a1", "claude", a.node_id()))
        .await
        .unwrap();
    let a2 = b
        .register_agent(Agent::new("a2", "claude", b.node_id()))
        .await
        .unwrap();

    // The emperor's replica must see both agents before dispatch counts.
    assert!(wait_until(|| a.agents().unwrap().len() == 2).await);

    let task = a
        .enqueue(Task::new("do work", "d", a.node_id()))
        .await
        .unwrap();

    // Exactly one agent ends up owning the task; it reaches in_progress.
    assert!(
        wait_until(|| {
            a.get_task(&task.id)
                .unwrap()
                .map(|t| t.status == TaskStatus::InProgress)
                .unwrap_or(false)
        })
        .await,
        "task never dispatched"
    );

    let assigned = a.get_task(&task.id).unwrap().unwrap().assigned_to.unwrap();
    assert!(assigned == a1.id || assigned == a2.id);

    // The other agent stays idle on both replicas.
    assert!(
        wait_until(|| {
            let busy: Vec<_> = a
                .agents()
                .unwrap()
                .into_iter()
                .filter(|ag| ag.status == voidlux_core::AgentStatus::Busy)
                .collect();
            busy.len() == 1 && busy[0].id == assigned
        })
        .await
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn leader_failover_elects_survivor() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let dir_c = TempDir::new().unwrap();

    let a = start(NodeRole::Emperor, &dir_a, vec![]).await;
    let b = start(NodeRole::Worker, &dir_b, vec![seed_of(&a)]).await;
    let c = start(
        NodeRole::Worker,
        &dir_c,
        vec![seed_of(&a), seed_of(&b)],
    )
    .await;

    assert!(wait_until(|| b.peer_count() == 2 && c.peer_count() == 2).await);
    assert!(
        wait_until(|| {
            b.leader().leader == Some(a.node_id()) && c.leader().leader == Some(a.node_id())
        })
        .await,
        "workers never accepted the configured emperor"
    );
    let old_term = b.leader().term;

    let mut events_b = b.subscribe_events();

    // Regicide.
    a.shutdown().await;

    // A survivor claims the throne and both agree on it.
    assert!(
        wait_until(|| {
            let lb = b.leader();
            let lc = c.leader();
            lb.term > old_term
                && lb.leader.is_some()
                && lb.leader == lc.leader
                && (lb.leader == Some(b.node_id()) || lb.leader == Some(c.node_id()))
        })
        .await,
        "no survivor won the election"
    );

    // The lowest node id wins deterministically.
    let expected = b.node_id().min(c.node_id());
    assert_eq!(b.leader().leader, Some(expected));

    // The survivor observed the change on its event bus.
    let mut saw_change = false;
    while let Ok(event) = events_b.try_recv() {
        if let SwarmEvent::LeaderChanged { leader, term } = event {
            if term > old_term && leader == Some(expected) {
                saw_change = true;
            }
        }
    }
    assert!(saw_change, "LeaderChanged never fired on the survivor");

    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn consensus_commits_across_cluster_and_syncs_late_joiner() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let dir_c = TempDir::new().unwrap();

    // Pin the cluster-size estimate so the proposal genuinely needs
    // the follower's vote (quorum 2 of 2), not just the self-vote.
    let mut config_a = config(NodeRole::Emperor, &dir_a, vec![]);
    config_a.cluster_size = Some(2);
    let a = Node::start(config_a).await.unwrap();

    let mut config_b = config(NodeRole::Worker, &dir_b, vec![seed_of(&a)]);
    config_b.cluster_size = Some(2);
    let b = Node::start(config_b).await.unwrap();
    assert!(wait_until(|| a.peer_count() == 1 && b.peer_count() == 1).await);

    let id = a
        .propose("config_change", serde_json::json!({"x": 2}))
        .await
        .unwrap();

    // Both members commit the entry.
    assert!(
        wait_until(|| {
            let on_a = a.read_stale().unwrap().iter().any(|e| e.id == id);
            let on_b = b.read_stale().unwrap().iter().any(|e| e.id == id);
            on_a && on_b
        })
        .await,
        "proposal did not commit cluster-wide"
    );

    // The leader serves a consistent read while it holds quorum.
    let entries = a.read_consistent().unwrap();
    assert!(entries.iter().any(|e| e.id == id));
    // Followers must not.
    assert!(b.read_consistent().is_err());

    // A late joiner converges through consensus-log anti-entropy.
    let c = start(NodeRole::Worker, &dir_c, vec![seed_of(&a)]).await;
    assert!(
        wait_until(|| c.read_stale().unwrap().iter().any(|e| e.id == id)).await,
        "late joiner never synced the log"
    );

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn orphaned_tasks_requeue_on_restart() {
    let dir = TempDir::new().unwrap();

    let node = start(NodeRole::Worker, &dir, vec![]).await;
    let task = node
        .enqueue(Task::new("orphan", "d", node.node_id()))
        .await
        .unwrap();
    assert!(node.claim(&task.id, &AgentId::generate()).await.unwrap());
    let claimed = node.get_task(&task.id).unwrap().unwrap();
    assert_eq!(claimed.status, TaskStatus::Claimed);
    let lamport_before = claimed.lamport_ts;

    // Simulated crash: shut down with the claim still held.
    node.shutdown().await;
    drop(node);

    // Same data dir: the restart finds its own unfinished assignment.
    let node = start(NodeRole::Worker, &dir, vec![]).await;
    let recovered = node.get_task(&task.id).unwrap().unwrap();
    assert_eq!(recovered.status, TaskStatus::Pending);
    assert!(recovered.assigned_to.is_none());
    assert!(recovered.lamport_ts > lamport_before);

    node.shutdown().await;
}

#[tokio::test]
async fn mismatched_secrets_keep_meshes_apart() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    let mut config_a = config(NodeRole::Worker, &dir_a, vec![]);
    config_a.auth_secret = Some("alpha".into());
    let a = Node::start(config_a).await.unwrap();

    let mut config_b = config(NodeRole::Worker, &dir_b, vec![seed_of(&a)]);
    config_b.auth_secret = Some("beta".into());
    let b = Node::start(config_b).await.unwrap();

    // The handshake fails; a task created on A must never reach B.
    let task = a
        .enqueue(Task::new("secret work", "d", a.node_id()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(a.peer_count(), 0);
    assert_eq!(b.peer_count(), 0);
    assert!(b.get_task(&task.id).unwrap().is_none());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn agent_registry_converges_and_census_reannounces() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    let a = start(NodeRole::Emperor, &dir_a, vec![]).await;
    let b = start(NodeRole::Worker, &dir_b, vec![seed_of(&a)]).await;
    assert!(wait_until(|| a.peer_count() == 1 && b.peer_count() == 1).await);

    let agent = b
        .register_agent(Agent::new("remote", "claude", b.node_id()))
        .await
        .unwrap();

    assert!(
        wait_until(|| a.agents().unwrap().iter().any(|ag| ag.id == agent.id)).await,
        "agent registration never reached the emperor"
    );

    // Deregistration converges the same way.
    assert!(b.deregister_agent(&agent.id).await.unwrap());
    assert!(
        wait_until(|| a.agents().unwrap().iter().all(|ag| ag.id != agent.id)).await,
        "agent deregistration never reached the emperor"
    );

    a.shutdown().await;
    b.shutdown().await;
}
