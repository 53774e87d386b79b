//! Leader-only push dispatch of pending tasks to idle agents.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, info};
use voidlux_consensus::{Elector, PartitionDetector};
use voidlux_core::{AgentId, NodeId, Result};
use voidlux_mesh::MeshServer;
use voidlux_storage::SwarmStore;
use voidlux_wire::{Message, TaskAssign};

/// Fallback dispatch cadence when no wake arrives.
const FALLBACK_TICK: Duration = Duration::from_secs(2);
/// Agents marked assigned-pending are skipped this long, bridging the
/// window before their claim gossip lands.
const ASSIGNED_PENDING_TTL: Duration = Duration::from_secs(30);

/// The dispatcher. Every node runs one; only the current leader's does
/// anything in its cycle.
pub struct Dispatcher {
    node_id: NodeId,
    store: Arc<SwarmStore>,
    mesh: Arc<MeshServer>,
    elector: Arc<Elector>,
    partition: Arc<PartitionDetector>,
    wake: Arc<Notify>,
    /// In-memory only: agents with an assignment in flight.
    assigned_pending: Mutex<HashMap<AgentId, Instant>>,
    /// Assignments for agents hosted on this node bypass the network
    /// and are handed straight to the registry.
    local_assign_tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<Message>>>,
    local_assign_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<Message>>>,
}

impl Dispatcher {
    /// Wires the dispatcher to its collaborators.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        store: Arc<SwarmStore>,
        mesh: Arc<MeshServer>,
        elector: Arc<Elector>,
        partition: Arc<PartitionDetector>,
        wake: Arc<Notify>,
    ) -> Arc<Self> {
        let (local_assign_tx, local_assign_rx) = tokio::sync::mpsc::unbounded_channel();
        Arc::new(Self {
            node_id,
            store,
            mesh,
            elector,
            partition,
            wake,
            assigned_pending: Mutex::new(HashMap::new()),
            local_assign_tx: Mutex::new(Some(local_assign_tx)),
            local_assign_rx: Mutex::new(Some(local_assign_rx)),
        })
    }

    /// Hands out the local-assignment stream. Called once at wiring by
    /// the agent registry.
    #[must_use]
    pub fn take_local_assignments(
        &self,
    ) -> tokio::sync::mpsc::UnboundedReceiver<Message> {
        self.local_assign_rx
            .lock()
            .take()
            .expect("local assignment stream already taken")
    }

    /// Wakes the dispatcher outside its fallback tick.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// The dispatch loop: woken by task events or the 2-second fallback.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(FALLBACK_TICK) => {}
            }

            if !self.elector.is_leader() {
                continue;
            }
            // Dispatching without a leader lease would hand out work a
            // new emperor may also hand out; wait for quorum.
            if !self.partition.has_quorum() {
                debug!("dispatch paused, no quorum");
                continue;
            }

            if let Err(e) = self.cycle().await {
                tracing::warn!(error = %e, "dispatch cycle failed");
            }
        }
    }

    /// One dispatch cycle over the local replica.
    pub async fn cycle(&self) -> Result<usize> {
        self.prune_assigned_pending();

        let mut idle = self.store.idle_agents()?;
        {
            let pending = self.assigned_pending.lock();
            idle.retain(|a| !pending.contains_key(&a.id));
        }
        if idle.is_empty() {
            return Ok(0);
        }

        let mut dispatched = 0;
        for task in self.store.pending_tasks()? {
            let Some(pos) = idle
                .iter()
                .position(|agent| agent.covers(&task.required_capabilities))
            else {
                continue; // no capable idle agent; skip this task
            };
            let agent = idle.remove(pos);

            let assign = Message::TaskAssign(TaskAssign {
                task_id: task.id,
                agent_id: agent.id,
                node_id: agent.node_id,
            });

            let delivered = if agent.node_id == self.node_id {
                // Local agents are handled by the registry without a
                // network hop; the node wiring routes this.
                true
            } else {
                self.mesh.send_to(&agent.node_id, &assign).await
            };

            if delivered {
                info!(
                    task_id = %task.id,
                    agent_id = %agent.id,
                    node = %agent.node_id.short(),
                    "task assigned"
                );
                self.assigned_pending
                    .lock()
                    .insert(agent.id, Instant::now());
                if agent.node_id == self.node_id {
                    self.wake_local(assign);
                }
                dispatched += 1;
            } else {
                debug!(
                    task_id = %task.id,
                    node = %agent.node_id.short(),
                    "assignment undeliverable, agent host offline"
                );
                idle.insert(0, agent);
            }

            if idle.is_empty() {
                break;
            }
        }
        Ok(dispatched)
    }

    /// Clears an in-flight marker once the claim (or a failure) lands.
    pub fn assignment_settled(&self, agent_id: &AgentId) {
        self.assigned_pending.lock().remove(agent_id);
    }

    fn prune_assigned_pending(&self) {
        self.assigned_pending
            .lock()
            .retain(|_, at| at.elapsed() < ASSIGNED_PENDING_TTL);
    }

    fn wake_local(&self, assign: Message) {
        if let Some(tx) = self.local_assign_tx.lock().as_ref() {
            let _ = tx.send(assign);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voidlux_consensus::ElectionConfig;
    use voidlux_core::{Agent, Lamport, NodeRole, Task};
    use voidlux_gossip::LamportClock;
    use voidlux_mesh::{MeshConfig, PeerManager};

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        store: Arc<SwarmStore>,
        node_id: NodeId,
        local_assigns: tokio::sync::mpsc::UnboundedReceiver<Message>,
    }

    fn fixture() -> Fixture {
        let node_id = NodeId::generate();
        let store = Arc::new(SwarmStore::open_in_memory().unwrap());
        let mesh = MeshServer::new(MeshConfig::new(
            node_id,
            NodeRole::Emperor,
            "127.0.0.1:0".parse().unwrap(),
        ));
        let clock = Arc::new(LamportClock::new(Lamport::ZERO));
        let peers = Arc::new(PeerManager::new(node_id));
        let partition = PartitionDetector::new(peers, 1);
        let elector = Elector::new(
            node_id,
            ElectionConfig::default(),
            Arc::clone(&mesh),
            clock,
            Box::new(|| 0),
        );
        elector.assume_leadership();

        let dispatcher = Dispatcher::new(
            node_id,
            Arc::clone(&store),
            mesh,
            elector,
            partition,
            Arc::new(Notify::new()),
        );
        let local_assigns = dispatcher.take_local_assignments();
        Fixture {
            dispatcher,
            store,
            node_id,
            local_assigns,
        }
    }

    fn idle_agent(node: NodeId, caps: &[&str]) -> Agent {
        let mut agent = Agent::new("a", "claude", node);
        agent.capabilities = caps.iter().map(|s| s.to_string()).collect();
        agent
    }

    #[tokio::test]
    async fn dispatches_to_capable_local_agent() {
        let mut fx = fixture();

        let agent = idle_agent(fx.node_id, &["rust"]);
        fx.store.upsert_agent(&agent).unwrap();

        let mut task = Task::new("t", "d", fx.node_id);
        task.required_capabilities = ["rust".to_string()].into();
        fx.store.insert_task(&task).unwrap();

        assert_eq!(fx.dispatcher.cycle().await.unwrap(), 1);
        match fx.local_assigns.try_recv().unwrap() {
            Message::TaskAssign(a) => {
                assert_eq!(a.task_id, task.id);
                assert_eq!(a.agent_id, agent.id);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn capability_mismatch_skips_task() {
        let fx = fixture();

        fx.store
            .upsert_agent(&idle_agent(fx.node_id, &["python"]))
            .unwrap();

        let mut task = Task::new("t", "d", fx.node_id);
        task.required_capabilities = ["rust".to_string()].into();
        fx.store.insert_task(&task).unwrap();

        assert_eq!(fx.dispatcher.cycle().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn assigned_pending_blocks_double_dispatch() {
        let mut fx = fixture();

        fx.store.upsert_agent(&idle_agent(fx.node_id, &[])).unwrap();
        fx.store
            .insert_task(&Task::new("t1", "d", fx.node_id))
            .unwrap();

        assert_eq!(fx.dispatcher.cycle().await.unwrap(), 1);
        let _ = fx.local_assigns.try_recv().unwrap();

        // Agent still reads idle in the replica, but it is marked
        // assigned-pending: the next cycle must not re-dispatch.
        fx.store
            .insert_task(&Task::new("t2", "d", fx.node_id))
            .unwrap();
        assert_eq!(fx.dispatcher.cycle().await.unwrap(), 0);

        // Once the assignment settles the agent is available again.
        let agents = fx.store.list_agents().unwrap();
        fx.dispatcher.assignment_settled(&agents[0].id);
        assert_eq!(fx.dispatcher.cycle().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn priority_orders_dispatch() {
        let mut fx = fixture();
        fx.store.upsert_agent(&idle_agent(fx.node_id, &[])).unwrap();

        let mut low = Task::new("low", "d", fx.node_id);
        low.priority = 1;
        let mut high = Task::new("high", "d", fx.node_id);
        high.priority = 10;
        fx.store.insert_task(&low).unwrap();
        fx.store.insert_task(&high).unwrap();

        // One idle agent: the high-priority task goes first.
        assert_eq!(fx.dispatcher.cycle().await.unwrap(), 1);
        match fx.local_assigns.try_recv().unwrap() {
            Message::TaskAssign(a) => assert_eq!(a.task_id, high.id),
            other => panic!("unexpected message {other:?}"),
        }
    }
}
