//! The gossip engine: typed push broadcast, receive-side application,
//! and pull anti-entropy.

use crate::{LamportClock, SeenCache};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};
use voidlux_core::{
    wins, Agent, AgentAction, Lamport, NodeId, Result, SwarmEvent, Task, TaskAction, TaskStatus,
};
use voidlux_mesh::{Connection, MeshServer};
use voidlux_storage::SwarmStore;
use voidlux_wire::{
    AgentDeregister, AgentHeartbeat, AgentRegister, AgentSyncRsp, Message, TaskCancel, TaskClaim,
    TaskComplete, TaskCreate, TaskFail, TaskSyncReq, TaskSyncRsp, TaskUpdate,
};

/// Anti-entropy cadence.
const SYNC_INTERVAL: Duration = Duration::from_secs(120);
/// Row cap per sync response.
const SYNC_BATCH: usize = 500;
/// Clock persistence cadence.
const CLOCK_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Seam to the task queue's concurrent-claim resolution; the resolver
/// lives with the queue, not here.
pub trait ClaimResolver: Send + Sync + 'static {
    /// A remote TASK_CLAIM arrived. Returns true when the remote claim
    /// now stands in local storage (and should be re-flooded).
    fn on_remote_claim(&self, claim: &TaskClaim) -> bool;
}

/// Push gossip + pull anti-entropy for tasks and agents.
pub struct GossipEngine {
    node_id: NodeId,
    clock: Arc<LamportClock>,
    seen: SeenCache,
    mesh: Arc<MeshServer>,
    store: Arc<SwarmStore>,
    events: broadcast::Sender<SwarmEvent>,
    claim_resolver: RwLock<Option<Arc<dyn ClaimResolver>>>,
}

impl GossipEngine {
    /// Wires the engine to its collaborators.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        clock: Arc<LamportClock>,
        mesh: Arc<MeshServer>,
        store: Arc<SwarmStore>,
        events: broadcast::Sender<SwarmEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            clock,
            seen: SeenCache::new(),
            mesh,
            store,
            events,
            claim_resolver: RwLock::new(None),
        })
    }

    /// Installs the claim resolver (done by the task queue at wiring).
    pub fn set_claim_resolver(&self, resolver: Arc<dyn ClaimResolver>) {
        *self.claim_resolver.write() = Some(resolver);
    }

    /// The shared clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<LamportClock> {
        &self.clock
    }

    /// Advances the clock for a local event.
    pub fn tick(&self) -> Lamport {
        self.clock.tick()
    }

    // ---- send side -------------------------------------------------

    /// Broadcasts a freshly created task (already stamped and stored).
    pub async fn announce_task_create(&self, task: &Task) {
        let msg = Message::TaskCreate(TaskCreate { task: task.clone() });
        self.mark_and_broadcast(&msg).await;
        self.emit(SwarmEvent::Task {
            action: TaskAction::Created,
            task: Box::new(task.clone()),
        });
    }

    /// Broadcasts a won local claim.
    pub async fn announce_task_claim(&self, claim: TaskClaim) {
        let msg = Message::TaskClaim(claim);
        self.mark_and_broadcast(&msg).await;
    }

    /// Broadcasts a task row change (requeue, progress, status move).
    pub async fn announce_task_update(&self, task: &Task, action: TaskAction) {
        let msg = Message::TaskUpdate(TaskUpdate { task: task.clone() });
        self.mark_and_broadcast(&msg).await;
        self.emit(SwarmEvent::Task {
            action,
            task: Box::new(task.clone()),
        });
    }

    /// Broadcasts a completion.
    pub async fn announce_task_complete(&self, task: &Task) {
        let msg = Message::TaskComplete(TaskComplete {
            task_id: task.id,
            result: task.result.clone(),
            node_id: self.node_id,
            lamport_ts: task.lamport_ts,
        });
        self.mark_and_broadcast(&msg).await;
        self.emit(SwarmEvent::Task {
            action: TaskAction::Completed,
            task: Box::new(task.clone()),
        });
    }

    /// Broadcasts a failure.
    pub async fn announce_task_fail(&self, task: &Task) {
        let msg = Message::TaskFail(TaskFail {
            task_id: task.id,
            error: task.error.clone().unwrap_or_default(),
            node_id: self.node_id,
            lamport_ts: task.lamport_ts,
        });
        self.mark_and_broadcast(&msg).await;
        self.emit(SwarmEvent::Task {
            action: TaskAction::Failed,
            task: Box::new(task.clone()),
        });
    }

    /// Broadcasts a cancellation.
    pub async fn announce_task_cancel(&self, task: &Task) {
        let msg = Message::TaskCancel(TaskCancel {
            task_id: task.id,
            node_id: self.node_id,
            lamport_ts: task.lamport_ts,
        });
        self.mark_and_broadcast(&msg).await;
        self.emit(SwarmEvent::Task {
            action: TaskAction::Cancelled,
            task: Box::new(task.clone()),
        });
    }

    /// Broadcasts an agent registration.
    pub async fn announce_agent_register(&self, agent: &Agent) {
        let msg = Message::AgentRegister(AgentRegister {
            agent: agent.clone(),
        });
        self.mark_and_broadcast(&msg).await;
        self.emit(SwarmEvent::Agent {
            action: AgentAction::Registered,
            agent: Box::new(agent.clone()),
        });
    }

    /// Broadcasts an agent heartbeat.
    pub async fn announce_agent_heartbeat(&self, agent: &Agent) {
        let msg = Message::AgentHeartbeat(AgentHeartbeat {
            agent_id: agent.id,
            node_id: agent.node_id,
            status: agent.status,
            current_task_id: agent.current_task_id,
            lamport_ts: agent.lamport_ts,
        });
        self.mark_and_broadcast(&msg).await;
    }

    /// Broadcasts an agent removal.
    pub async fn announce_agent_deregister(&self, agent: &Agent) {
        let msg = Message::AgentDeregister(AgentDeregister {
            agent_id: agent.id,
            node_id: agent.node_id,
            lamport_ts: agent.lamport_ts,
        });
        self.mark_and_broadcast(&msg).await;
        self.emit(SwarmEvent::Agent {
            action: AgentAction::Deregistered,
            agent: Box::new(agent.clone()),
        });
    }

    async fn mark_and_broadcast(&self, msg: &Message) {
        if let Some(key) = dedup_key(msg) {
            self.seen.insert(&key);
        }
        self.mesh.broadcast(msg, None).await;
    }

    // ---- receive side ----------------------------------------------

    /// Applies an incoming gossip or sync message. Returns `Ok(true)`
    /// when the message belonged to this layer; storage failures
    /// propagate (they are fatal to the node).
    pub async fn handle_message(&self, conn: &Arc<Connection>, msg: &Message) -> Result<bool> {
        // Pull sync is request/response, not flood: no dedup involved.
        match msg {
            Message::TaskSyncReq(req) => {
                let tasks = self.store.tasks_since(req.since_lamport, SYNC_BATCH)?;
                let rsp = Message::TaskSyncRsp(TaskSyncRsp { tasks });
                if let Err(e) = conn.send(&rsp).await {
                    debug!(error = %e, "task sync response failed");
                }
                return Ok(true);
            }
            Message::TaskSyncRsp(rsp) => {
                for task in &rsp.tasks {
                    self.clock.witness(task.lamport_ts);
                    self.store.merge_task(task)?;
                }
                debug!(count = rsp.tasks.len(), "task sync applied");
                return Ok(true);
            }
            Message::AgentSyncReq(_) => {
                let agents = self.store.list_agents()?;
                let rsp = Message::AgentSyncRsp(AgentSyncRsp { agents });
                if let Err(e) = conn.send(&rsp).await {
                    debug!(error = %e, "agent sync response failed");
                }
                return Ok(true);
            }
            Message::AgentSyncRsp(rsp) => {
                for agent in &rsp.agents {
                    self.clock.witness(agent.lamport_ts);
                    self.merge_agent(agent)?;
                }
                debug!(count = rsp.agents.len(), "agent sync applied");
                return Ok(true);
            }
            _ => {}
        }

        let Some(key) = dedup_key(msg) else {
            return Ok(false); // not a gossip message
        };
        if !self.seen.insert(&key) {
            return Ok(true); // duplicate: the flood already got here
        }
        if let Some(lamport) = gossip_lamport(msg) {
            self.clock.witness(lamport);
        }

        let rebroadcast = self.apply(msg)?;
        if rebroadcast {
            self.mesh.broadcast(msg, Some(conn.remote_addr)).await;
        }
        Ok(true)
    }

    fn apply(&self, msg: &Message) -> Result<bool> {
        match msg {
            Message::TaskCreate(m) => {
                let applied = self.store.merge_task(&m.task)?;
                if applied {
                    self.emit(SwarmEvent::Task {
                        action: TaskAction::Created,
                        task: Box::new(m.task.clone()),
                    });
                }
                Ok(true)
            }
            Message::TaskClaim(m) => {
                let resolver = self.claim_resolver.read().clone();
                let applied = match resolver {
                    Some(resolver) => resolver.on_remote_claim(m),
                    None => {
                        warn!(task_id = %m.task_id, "claim received before resolver wired");
                        false
                    }
                };
                if applied {
                    if let Some(task) = self.store.get_task(&m.task_id)? {
                        self.emit(SwarmEvent::Task {
                            action: TaskAction::Claimed,
                            task: Box::new(task),
                        });
                    }
                }
                Ok(applied)
            }
            Message::TaskUpdate(m) => {
                let applied = self.store.merge_task(&m.task)?;
                if applied {
                    let action = if m.task.status == TaskStatus::Pending {
                        TaskAction::Requeued
                    } else {
                        TaskAction::Updated
                    };
                    self.emit(SwarmEvent::Task {
                        action,
                        task: Box::new(m.task.clone()),
                    });
                }
                Ok(applied)
            }
            Message::TaskComplete(m) => {
                let applied = self.store.transition_task(
                    &m.task_id,
                    TaskStatus::Completed,
                    m.result.as_deref(),
                    None,
                    m.lamport_ts,
                )?;
                if applied {
                    if let Some(task) = self.store.get_task(&m.task_id)? {
                        self.emit(SwarmEvent::Task {
                            action: TaskAction::Completed,
                            task: Box::new(task),
                        });
                    }
                }
                Ok(true)
            }
            Message::TaskFail(m) => {
                let applied = self.store.transition_task(
                    &m.task_id,
                    TaskStatus::Failed,
                    None,
                    Some(&m.error),
                    m.lamport_ts,
                )?;
                if applied {
                    if let Some(task) = self.store.get_task(&m.task_id)? {
                        self.emit(SwarmEvent::Task {
                            action: TaskAction::Failed,
                            task: Box::new(task),
                        });
                    }
                }
                Ok(true)
            }
            Message::TaskCancel(m) => {
                let applied = self.store.transition_task(
                    &m.task_id,
                    TaskStatus::Cancelled,
                    None,
                    None,
                    m.lamport_ts,
                )?;
                if applied {
                    if let Some(task) = self.store.get_task(&m.task_id)? {
                        self.emit(SwarmEvent::Task {
                            action: TaskAction::Cancelled,
                            task: Box::new(task),
                        });
                    }
                }
                Ok(true)
            }
            Message::AgentRegister(m) => {
                let applied = self.merge_agent(&m.agent)?;
                if applied {
                    self.emit(SwarmEvent::Agent {
                        action: AgentAction::Registered,
                        agent: Box::new(m.agent.clone()),
                    });
                }
                Ok(true)
            }
            Message::AgentHeartbeat(m) => {
                if let Some(mut agent) = self.store.get_agent(&m.agent_id)? {
                    if wins(
                        (m.lamport_ts, &m.node_id),
                        (agent.lamport_ts, &agent.node_id),
                    ) {
                        agent.status = m.status;
                        agent.current_task_id = m.current_task_id;
                        agent.last_heartbeat = voidlux_core::Timestamp::now();
                        agent.lamport_ts = m.lamport_ts;
                        self.store.upsert_agent(&agent)?;
                        self.emit(SwarmEvent::Agent {
                            action: AgentAction::Heartbeat,
                            agent: Box::new(agent),
                        });
                    }
                }
                Ok(true)
            }
            Message::AgentDeregister(m) => {
                if let Some(agent) = self.store.get_agent(&m.agent_id)? {
                    if m.node_id == agent.node_id {
                        self.store.delete_agent(&m.agent_id)?;
                        self.emit(SwarmEvent::Agent {
                            action: AgentAction::Deregistered,
                            agent: Box::new(agent),
                        });
                    }
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Last-writer-wins agent merge by `(lamport_ts, owning node)`.
    fn merge_agent(&self, incoming: &Agent) -> Result<bool> {
        match self.store.get_agent(&incoming.id)? {
            None => {
                self.store.upsert_agent(incoming)?;
                Ok(true)
            }
            Some(local) => {
                if wins(
                    (incoming.lamport_ts, &incoming.node_id),
                    (local.lamport_ts, &local.node_id),
                ) {
                    self.store.upsert_agent(incoming)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    // ---- anti-entropy ----------------------------------------------

    /// Eagerly pulls the agent view from a fresh peer connection.
    pub async fn request_agent_sync(&self, conn: &Arc<Connection>) {
        let msg = Message::AgentSyncReq(voidlux_wire::AgentSyncReq { from: self.node_id });
        if let Err(e) = conn.send(&msg).await {
            debug!(error = %e, "eager agent sync request failed");
        }
    }

    /// The 120-second pull loop: pick one random connected peer and ask
    /// for tasks past our watermark, plus a periodic agent refresh.
    pub async fn run_anti_entropy(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_round().await {
                        warn!(error = %e, "anti-entropy round failed");
                    }
                }
            }
        }
    }

    async fn sync_round(&self) -> Result<()> {
        use rand::seq::SliceRandom;

        let peers = self.mesh.connected_node_ids();
        let Some(peer) = peers.choose(&mut rand::thread_rng()) else {
            return Ok(());
        };

        let since = self.store.max_task_lamport()?;
        let req = Message::TaskSyncReq(TaskSyncReq {
            since_lamport: since,
            from: self.node_id,
        });
        if self.mesh.send_to(peer, &req).await {
            debug!(peer = %peer.short(), since = %since, "anti-entropy task sync requested");
        }

        let agent_req = Message::AgentSyncReq(voidlux_wire::AgentSyncReq { from: self.node_id });
        self.mesh.send_to(peer, &agent_req).await;
        Ok(())
    }

    /// Persists the clock every five seconds and once on shutdown.
    pub async fn run_clock_persistence(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(CLOCK_FLUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.store.save_lamport_clock(self.clock.current()) {
                        warn!(error = %e, "clock persistence failed");
                    }
                }
            }
        }
        let _ = self.store.save_lamport_clock(self.clock.current());
    }

    fn emit(&self, event: SwarmEvent) {
        let _ = self.events.send(event);
    }
}

/// Dedup key per gossip message: `(type, entity id, action disambiguator)`.
fn dedup_key(msg: &Message) -> Option<String> {
    match msg {
        Message::TaskCreate(m) => Some(format!("task_create:{}", m.task.id)),
        Message::TaskClaim(m) => Some(format!(
            "task_claim:{}:{}:{}",
            m.task_id, m.node_id, m.lamport_ts
        )),
        Message::TaskUpdate(m) => Some(format!("task_update:{}:{}", m.task.id, m.task.lamport_ts)),
        Message::TaskComplete(m) => Some(format!("task_complete:{}", m.task_id)),
        Message::TaskFail(m) => Some(format!("task_fail:{}:{}", m.task_id, m.lamport_ts)),
        Message::TaskCancel(m) => Some(format!("task_cancel:{}", m.task_id)),
        Message::AgentRegister(m) => Some(format!(
            "agent_register:{}:{}",
            m.agent.id, m.agent.lamport_ts
        )),
        Message::AgentHeartbeat(m) => {
            Some(format!("agent_hb:{}:{}", m.agent_id, m.lamport_ts))
        }
        Message::AgentDeregister(m) => Some(format!("agent_dereg:{}", m.agent_id)),
        _ => None,
    }
}

/// The Lamport stamp carried by a gossip message, for clock witnessing.
fn gossip_lamport(msg: &Message) -> Option<Lamport> {
    match msg {
        Message::TaskCreate(m) => Some(m.task.lamport_ts),
        Message::TaskClaim(m) => Some(m.lamport_ts),
        Message::TaskUpdate(m) => Some(m.task.lamport_ts),
        Message::TaskComplete(m) => Some(m.lamport_ts),
        Message::TaskFail(m) => Some(m.lamport_ts),
        Message::TaskCancel(m) => Some(m.lamport_ts),
        Message::AgentRegister(m) => Some(m.agent.lamport_ts),
        Message::AgentHeartbeat(m) => Some(m.lamport_ts),
        Message::AgentDeregister(m) => Some(m.lamport_ts),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voidlux_core::NodeRole;
    use voidlux_mesh::MeshConfig;

    fn engine() -> (Arc<GossipEngine>, Arc<SwarmStore>, broadcast::Receiver<SwarmEvent>) {
        let node_id = NodeId::generate();
        let store = Arc::new(SwarmStore::open_in_memory().unwrap());
        let clock = Arc::new(LamportClock::new(Lamport::ZERO));
        let mesh = MeshServer::new(MeshConfig::new(
            node_id,
            NodeRole::Worker,
            "127.0.0.1:0".parse().unwrap(),
        ));
        let (events, rx) = broadcast::channel(64);
        let engine = GossipEngine::new(node_id, clock, mesh, Arc::clone(&store), events);
        (engine, store, rx)
    }

    #[test]
    fn dedup_keys_distinguish_actions() {
        let task = Task::new("t", "d", NodeId::generate());
        let create = Message::TaskCreate(TaskCreate { task: task.clone() });
        let complete = Message::TaskComplete(TaskComplete {
            task_id: task.id,
            result: None,
            node_id: NodeId::generate(),
            lamport_ts: Lamport(1),
        });
        assert_ne!(dedup_key(&create), dedup_key(&complete));
    }

    #[test]
    fn non_gossip_messages_have_no_key() {
        let msg = Message::Ping(voidlux_wire::Ping { seq: 1 });
        assert!(dedup_key(&msg).is_none());
    }

    #[tokio::test]
    async fn duplicate_apply_is_noop() {
        let (engine, store, _rx) = engine();

        let mut task = Task::new("t", "d", NodeId::generate());
        task.lamport_ts = Lamport(5);
        let msg = Message::TaskCreate(TaskCreate { task: task.clone() });
        let key = dedup_key(&msg).unwrap();

        // First arrival: fresh, applied.
        assert!(engine.seen.insert(&key));
        engine.apply(&msg).unwrap();
        assert!(store.get_task(&task.id).unwrap().is_some());

        // Second arrival: dropped by the cache before apply.
        assert!(!engine.seen.insert(&key));
    }

    #[tokio::test]
    async fn remote_complete_is_terminal_once() {
        let (engine, store, _rx) = engine();

        let task = Task::new("t", "d", NodeId::generate());
        store.insert_task(&task).unwrap();

        let complete = Message::TaskComplete(TaskComplete {
            task_id: task.id,
            result: Some("done".into()),
            node_id: NodeId::generate(),
            lamport_ts: Lamport(7),
        });
        engine.apply(&complete).unwrap();
        assert_eq!(
            store.get_task(&task.id).unwrap().unwrap().status,
            TaskStatus::Completed
        );

        // A later fail does not overwrite the terminal state.
        let fail = Message::TaskFail(TaskFail {
            task_id: task.id,
            error: "too late".into(),
            node_id: NodeId::generate(),
            lamport_ts: Lamport(9),
        });
        engine.apply(&fail).unwrap();
        assert_eq!(
            store.get_task(&task.id).unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn agent_merge_respects_lamport() {
        let (engine, store, _rx) = engine();

        let mut agent = Agent::new("a1", "claude", NodeId::generate());
        agent.lamport_ts = Lamport(5);
        assert!(engine.merge_agent(&agent).unwrap());

        // A stale copy loses.
        let mut stale = agent.clone();
        stale.name = "stale".into();
        stale.lamport_ts = Lamport(2);
        assert!(!engine.merge_agent(&stale).unwrap());
        assert_eq!(store.get_agent(&agent.id).unwrap().unwrap().name, "a1");

        // A newer copy wins.
        let mut fresh = agent.clone();
        fresh.name = "fresh".into();
        fresh.lamport_ts = Lamport(9);
        assert!(engine.merge_agent(&fresh).unwrap());
        assert_eq!(store.get_agent(&agent.id).unwrap().unwrap().name, "fresh");
    }

    #[tokio::test]
    async fn heartbeat_updates_status() {
        let (engine, store, _rx) = engine();

        let mut agent = Agent::new("a1", "claude", NodeId::generate());
        agent.lamport_ts = Lamport(1);
        store.upsert_agent(&agent).unwrap();

        let task_id = voidlux_core::TaskId::generate();
        let hb = Message::AgentHeartbeat(AgentHeartbeat {
            agent_id: agent.id,
            node_id: agent.node_id,
            status: voidlux_core::AgentStatus::Busy,
            current_task_id: Some(task_id),
            lamport_ts: Lamport(4),
        });
        engine.apply(&hb).unwrap();

        let loaded = store.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(loaded.status, voidlux_core::AgentStatus::Busy);
        assert_eq!(loaded.current_task_id, Some(task_id));
    }

    #[tokio::test]
    async fn deregister_requires_owner() {
        let (engine, store, _rx) = engine();

        let agent = Agent::new("a1", "claude", NodeId::generate());
        store.upsert_agent(&agent).unwrap();

        // Wrong owner: ignored.
        let bogus = Message::AgentDeregister(AgentDeregister {
            agent_id: agent.id,
            node_id: NodeId::generate(),
            lamport_ts: Lamport(10),
        });
        engine.apply(&bogus).unwrap();
        assert!(store.get_agent(&agent.id).unwrap().is_some());

        // Owner: removed.
        let real = Message::AgentDeregister(AgentDeregister {
            agent_id: agent.id,
            node_id: agent.node_id,
            lamport_ts: Lamport(11),
        });
        engine.apply(&real).unwrap();
        assert!(store.get_agent(&agent.id).unwrap().is_none());
    }
}
