//! The agent registry and monitor.

use crate::AgentBridge;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use voidlux_core::{Agent, AgentId, AgentStatus, Error, NodeId, Result, TaskId};
use voidlux_gossip::GossipEngine;
use voidlux_storage::SwarmStore;
use voidlux_tasks::{Dispatcher, TaskQueue};
use voidlux_wire::TaskAssign;

/// Owner heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Local liveness poll cadence.
const MONITOR_INTERVAL: Duration = Duration::from_secs(10);
/// Remote agents unheard past this are pruned from the local view.
const REMOTE_STALE_SECS: u64 = 90;

/// Owns this node's agents and mirrors everyone else's.
pub struct AgentRegistry {
    node_id: NodeId,
    store: Arc<SwarmStore>,
    gossip: Arc<GossipEngine>,
    queue: Arc<TaskQueue>,
    dispatcher: Arc<Dispatcher>,
    bridge: RwLock<Arc<dyn AgentBridge>>,
    /// The leader this node currently recognizes, kept fresh by the
    /// node wiring; assignments from anyone else are refused.
    recognized_leader: RwLock<Option<NodeId>>,
}

impl AgentRegistry {
    /// Wires the registry to its collaborators.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        store: Arc<SwarmStore>,
        gossip: Arc<GossipEngine>,
        queue: Arc<TaskQueue>,
        dispatcher: Arc<Dispatcher>,
        bridge: Arc<dyn AgentBridge>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            store,
            gossip,
            queue,
            dispatcher,
            bridge: RwLock::new(bridge),
            recognized_leader: RwLock::new(None),
        })
    }

    /// Swaps the session bridge (used by tests and the node wiring).
    pub fn set_bridge(&self, bridge: Arc<dyn AgentBridge>) {
        *self.bridge.write() = bridge;
    }

    /// Updates the leader this node accepts assignments from.
    pub fn set_recognized_leader(&self, leader: Option<NodeId>) {
        *self.recognized_leader.write() = leader;
    }

    /// Registers a locally-hosted agent and gossips it.
    pub async fn register(&self, mut agent: Agent) -> Result<Agent> {
        agent.node_id = self.node_id;
        agent.lamport_ts = self.gossip.tick();
        self.store.upsert_agent(&agent)?;
        info!(agent_id = %agent.id, name = %agent.name, "agent registered");
        self.gossip.announce_agent_register(&agent).await;
        self.dispatcher.trigger();
        Ok(agent)
    }

    /// Removes a locally-owned agent. Only the owner may delete.
    pub async fn deregister(&self, agent_id: &AgentId) -> Result<bool> {
        let Some(mut agent) = self.store.get_agent(agent_id)? else {
            return Ok(false);
        };
        if agent.node_id != self.node_id {
            return Err(Error::conflict("agent owned by another node"));
        }
        agent.lamport_ts = self.gossip.tick();
        self.store.delete_agent(agent_id)?;
        info!(agent_id = %agent_id, "agent deregistered");
        self.gossip.announce_agent_deregister(&agent).await;
        Ok(true)
    }

    /// A TASK_ASSIGN arrived. `from` is the sending node (`None` means
    /// the local dispatcher). An assignment from a node this one does
    /// not recognize as leader is refused: the task goes back to pending
    /// so the live emperor re-dispatches it. The same holds when the
    /// named agent cannot take the work before anything was claimed.
    pub async fn handle_assign(&self, from: Option<NodeId>, assign: &TaskAssign) -> Result<()> {
        if let Some(sender) = from {
            let recognized = *self.recognized_leader.read();
            if recognized != Some(sender) {
                warn!(
                    task_id = %assign.task_id,
                    sender = %sender.short(),
                    "assignment from unrecognized leader refused"
                );
                self.queue
                    .requeue(&assign.task_id, "stale assignment: sender is not the leader")
                    .await?;
                return Ok(());
            }
        }

        let Some(agent) = self.store.get_agent(&assign.agent_id)? else {
            self.queue
                .requeue(&assign.task_id, "assigned agent unknown")
                .await?;
            return Ok(());
        };
        if agent.node_id != self.node_id {
            debug!(agent_id = %agent.id, "assignment for agent hosted elsewhere ignored");
            return Ok(());
        }
        if agent.status != AgentStatus::Idle {
            self.queue
                .requeue(&assign.task_id, "assigned agent is not idle")
                .await?;
            return Ok(());
        }

        // Claim first: losing the race here is normal, not a failure.
        if !self.queue.claim(&assign.task_id, &assign.agent_id).await? {
            debug!(task_id = %assign.task_id, "assignment lost the claim race");
            return Ok(());
        }

        let Some(task) = self.store.get_task(&assign.task_id)? else {
            return Ok(());
        };

        self.mark_agent(&agent.id, AgentStatus::Busy, Some(assign.task_id))
            .await?;

        let handoff = self.bridge.read().start_task(&agent, &task);
        match handoff {
            Ok(()) => {
                self.queue.start(&assign.task_id).await?;
                info!(
                    task_id = %assign.task_id,
                    agent_id = %agent.id,
                    "task handed to agent"
                );
            }
            Err(reason) => {
                warn!(task_id = %assign.task_id, reason = %reason, "agent handoff failed");
                self.queue.fail(&assign.task_id, &reason).await?;
                self.mark_agent(&agent.id, AgentStatus::Idle, None).await?;
            }
        }
        Ok(())
    }

    /// An agent finished its task: record the outcome and free it.
    pub async fn finish_task(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        result: std::result::Result<Option<String>, String>,
    ) -> Result<()> {
        match result {
            Ok(output) => {
                self.queue.complete(task_id, output.as_deref()).await?;
            }
            Err(reason) => {
                self.queue.fail(task_id, &reason).await?;
            }
        }
        self.mark_agent(agent_id, AgentStatus::Idle, None).await?;
        self.dispatcher.assignment_settled(agent_id);
        Ok(())
    }

    /// A local agent lost a claim race: free it without failing anything.
    pub async fn release_after_lost_claim(&self, agent_id: &AgentId) -> Result<()> {
        self.mark_agent(agent_id, AgentStatus::Idle, None).await?;
        self.dispatcher.assignment_settled(agent_id);
        Ok(())
    }

    /// CENSUS_REQUEST from the leader: re-announce every local agent so
    /// last-writer-wins converges the cluster view.
    pub async fn announce_census(&self) -> Result<usize> {
        let mut count = 0;
        for mut agent in self.store.agents_on_node(&self.node_id)? {
            agent.lamport_ts = self.gossip.tick();
            agent.last_heartbeat = voidlux_core::Timestamp::now();
            self.store.upsert_agent(&agent)?;
            self.gossip.announce_agent_register(&agent).await;
            count += 1;
        }
        debug!(count, "census announced");
        Ok(count)
    }

    async fn mark_agent(
        &self,
        agent_id: &AgentId,
        status: AgentStatus,
        current_task: Option<TaskId>,
    ) -> Result<()> {
        let lamport = self.gossip.tick();
        self.store
            .set_agent_status(agent_id, status, current_task.as_ref(), lamport)?;
        if let Some(agent) = self.store.get_agent(agent_id)? {
            self.gossip.announce_agent_heartbeat(&agent).await;
        }
        Ok(())
    }

    /// Heartbeat + wellness loop for locally-owned agents, plus remote
    /// staleness pruning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        let beats_per_heartbeat =
            (HEARTBEAT_INTERVAL.as_secs() / MONITOR_INTERVAL.as_secs()).max(1);
        let mut beat: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            beat += 1;

            if let Err(e) = self.monitor_pass().await {
                warn!(error = %e, "agent monitor pass failed");
            }

            if beat % beats_per_heartbeat == 0 {
                if let Err(e) = self.heartbeat_pass().await {
                    warn!(error = %e, "agent heartbeat pass failed");
                }
                match self.store.prune_stale_agents(&self.node_id, REMOTE_STALE_SECS) {
                    Ok(0) => {}
                    Ok(n) => debug!(pruned = n, "stale remote agents pruned"),
                    Err(e) => warn!(error = %e, "agent prune failed"),
                }
            }
        }
    }

    /// Polls local sessions; dead agents are removed and their tasks
    /// failed so the dispatcher can reassign.
    async fn monitor_pass(&self) -> Result<()> {
        for agent in self.store.agents_on_node(&self.node_id)? {
            if self.bridge.read().is_alive(&agent) {
                continue;
            }
            warn!(agent_id = %agent.id, name = %agent.name, "agent session died");
            if let Some(task_id) = agent.current_task_id {
                self.queue.fail(&task_id, "agent died").await?;
            }
            let mut dead = agent.clone();
            dead.lamport_ts = self.gossip.tick();
            self.store.delete_agent(&agent.id)?;
            self.gossip.announce_agent_deregister(&dead).await;
        }
        Ok(())
    }

    async fn heartbeat_pass(&self) -> Result<()> {
        for mut agent in self.store.agents_on_node(&self.node_id)? {
            agent.lamport_ts = self.gossip.tick();
            agent.last_heartbeat = voidlux_core::Timestamp::now();
            self.store.upsert_agent(&agent)?;
            self.gossip.announce_agent_heartbeat(&agent).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::{broadcast, Notify};
    use voidlux_consensus::{ElectionConfig, Elector, PartitionDetector};
    use voidlux_core::{Lamport, NodeRole, SwarmEvent, Task, TaskStatus};
    use voidlux_gossip::LamportClock;
    use voidlux_mesh::{MeshConfig, MeshServer, PeerManager};

    /// Bridge that can be told to refuse handoffs or report death.
    #[derive(Default)]
    struct ScriptedBridge {
        refuse: Mutex<Option<String>>,
        dead: Mutex<bool>,
    }

    impl AgentBridge for ScriptedBridge {
        fn start_task(&self, _agent: &Agent, _task: &Task) -> std::result::Result<(), String> {
            match self.refuse.lock().clone() {
                Some(reason) => Err(reason),
                None => Ok(()),
            }
        }

        fn is_alive(&self, _agent: &Agent) -> bool {
            !*self.dead.lock()
        }
    }

    struct Fixture {
        registry: Arc<AgentRegistry>,
        store: Arc<SwarmStore>,
        queue: Arc<TaskQueue>,
        bridge: Arc<ScriptedBridge>,
        node_id: NodeId,
    }

    fn fixture() -> Fixture {
        let node_id = NodeId::generate();
        let store = Arc::new(SwarmStore::open_in_memory().unwrap());
        let clock = Arc::new(LamportClock::new(Lamport::ZERO));
        let mesh = MeshServer::new(MeshConfig::new(
            node_id,
            NodeRole::Worker,
            "127.0.0.1:0".parse().unwrap(),
        ));
        let (events, _): (broadcast::Sender<SwarmEvent>, _) = broadcast::channel(64);
        let gossip = GossipEngine::new(
            node_id,
            Arc::clone(&clock),
            Arc::clone(&mesh),
            Arc::clone(&store),
            events,
        );
        let wake = Arc::new(Notify::new());
        let queue = TaskQueue::new(node_id, Arc::clone(&store), Arc::clone(&gossip), Arc::clone(&wake));

        let peers = Arc::new(PeerManager::new(node_id));
        let partition = PartitionDetector::new(peers, 1);
        let elector = Elector::new(
            node_id,
            ElectionConfig::default(),
            Arc::clone(&mesh),
            clock,
            Box::new(|| 0),
        );
        let dispatcher = Dispatcher::new(
            node_id,
            Arc::clone(&store),
            mesh,
            elector,
            partition,
            wake,
        );

        let bridge = Arc::new(ScriptedBridge::default());
        let registry = AgentRegistry::new(
            node_id,
            Arc::clone(&store),
            gossip,
            Arc::clone(&queue),
            dispatcher,
            Arc::clone(&bridge) as Arc<dyn AgentBridge>,
        );
        registry.set_recognized_leader(Some(node_id));

        Fixture {
            registry,
            store,
            queue,
            bridge,
            node_id,
        }
    }

    #[tokio::test]
    async fn register_claims_ownership() {
        let fx = fixture();
        let agent = fx
            .registry
            .register(Agent::new("a1", "claude", NodeId::generate()))
            .await
            .unwrap();
        // Ownership is forced to the registering node.
        assert_eq!(agent.node_id, fx.node_id);
        assert!(agent.lamport_ts > Lamport::ZERO);
    }

    #[tokio::test]
    async fn deregister_refuses_foreign_agents() {
        let fx = fixture();
        let mut foreign = Agent::new("theirs", "claude", NodeId::generate());
        foreign.lamport_ts = Lamport(1);
        fx.store.upsert_agent(&foreign).unwrap();

        assert!(fx.registry.deregister(&foreign.id).await.is_err());
        assert!(fx.store.get_agent(&foreign.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn assignment_executes_task() {
        let fx = fixture();
        let agent = fx
            .registry
            .register(Agent::new("a1", "claude", fx.node_id))
            .await
            .unwrap();
        let task = fx
            .queue
            .enqueue(Task::new("t", "d", fx.node_id))
            .await
            .unwrap();

        fx.registry
            .handle_assign(
                None,
                &TaskAssign {
                    task_id: task.id,
                    agent_id: agent.id,
                    node_id: fx.node_id,
                },
            )
            .await
            .unwrap();

        let loaded = fx.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::InProgress);
        assert_eq!(loaded.assigned_to, Some(agent.id));

        let agent_row = fx.store.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(agent_row.status, AgentStatus::Busy);
        assert_eq!(agent_row.current_task_id, Some(task.id));
    }

    #[tokio::test]
    async fn failed_handoff_fails_task_and_frees_agent() {
        let fx = fixture();
        *fx.bridge.refuse.lock() = Some("session wedged".into());

        let agent = fx
            .registry
            .register(Agent::new("a1", "claude", fx.node_id))
            .await
            .unwrap();
        let task = fx
            .queue
            .enqueue(Task::new("t", "d", fx.node_id))
            .await
            .unwrap();

        fx.registry
            .handle_assign(
                None,
                &TaskAssign {
                    task_id: task.id,
                    agent_id: agent.id,
                    node_id: fx.node_id,
                },
            )
            .await
            .unwrap();

        let loaded = fx.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("session wedged"));
        assert_eq!(
            fx.store.get_agent(&agent.id).unwrap().unwrap().status,
            AgentStatus::Idle
        );
    }

    #[tokio::test]
    async fn assignment_from_unrecognized_leader_leaves_task_pending() {
        let fx = fixture();
        let agent = fx
            .registry
            .register(Agent::new("a1", "claude", fx.node_id))
            .await
            .unwrap();
        let task = fx
            .queue
            .enqueue(Task::new("t", "d", fx.node_id))
            .await
            .unwrap();

        // A deposed emperor still sending assignments.
        let usurper = NodeId::generate();
        fx.registry
            .handle_assign(
                Some(usurper),
                &TaskAssign {
                    task_id: task.id,
                    agent_id: agent.id,
                    node_id: fx.node_id,
                },
            )
            .await
            .unwrap();

        // Refused without executing: the live emperor will re-dispatch.
        let loaded = fx.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert!(loaded.assigned_to.is_none());
        assert_eq!(
            fx.store.get_agent(&agent.id).unwrap().unwrap().status,
            AgentStatus::Idle
        );
    }

    #[tokio::test]
    async fn finish_task_completes_and_frees() {
        let fx = fixture();
        let agent = fx
            .registry
            .register(Agent::new("a1", "claude", fx.node_id))
            .await
            .unwrap();
        let task = fx
            .queue
            .enqueue(Task::new("t", "d", fx.node_id))
            .await
            .unwrap();
        fx.registry
            .handle_assign(
                None,
                &TaskAssign {
                    task_id: task.id,
                    agent_id: agent.id,
                    node_id: fx.node_id,
                },
            )
            .await
            .unwrap();

        fx.registry
            .finish_task(&agent.id, &task.id, Ok(Some("all green".into())))
            .await
            .unwrap();

        let loaded = fx.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.result.as_deref(), Some("all green"));
        assert_eq!(
            fx.store.get_agent(&agent.id).unwrap().unwrap().status,
            AgentStatus::Idle
        );
    }

    #[tokio::test]
    async fn dead_agent_fails_its_task() {
        let fx = fixture();
        let agent = fx
            .registry
            .register(Agent::new("a1", "claude", fx.node_id))
            .await
            .unwrap();
        let task = fx
            .queue
            .enqueue(Task::new("t", "d", fx.node_id))
            .await
            .unwrap();
        fx.registry
            .handle_assign(
                None,
                &TaskAssign {
                    task_id: task.id,
                    agent_id: agent.id,
                    node_id: fx.node_id,
                },
            )
            .await
            .unwrap();

        *fx.bridge.dead.lock() = true;
        fx.registry.monitor_pass().await.unwrap();

        let loaded = fx.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("agent died"));
        assert!(fx.store.get_agent(&agent.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn census_reannounces_local_agents() {
        let fx = fixture();
        fx.registry
            .register(Agent::new("a1", "claude", fx.node_id))
            .await
            .unwrap();
        fx.registry
            .register(Agent::new("a2", "claude", fx.node_id))
            .await
            .unwrap();

        // A foreign agent is not ours to announce.
        let mut foreign = Agent::new("theirs", "claude", NodeId::generate());
        foreign.lamport_ts = Lamport(1);
        fx.store.upsert_agent(&foreign).unwrap();

        assert_eq!(fx.registry.announce_census().await.unwrap(), 2);
    }
}
