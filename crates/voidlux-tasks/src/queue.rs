//! The distributed task queue, local edge.

use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};
use voidlux_core::{AgentId, NodeId, Result, Task, TaskAction, TaskId, TaskStatus, Timestamp};
use voidlux_gossip::GossipEngine;
use voidlux_storage::SwarmStore;
use voidlux_wire::TaskClaim;

/// Local mutations on the shared task set. Every mutation stamps a
/// fresh Lamport value, hits storage first, then gossips.
pub struct TaskQueue {
    node_id: NodeId,
    store: Arc<SwarmStore>,
    gossip: Arc<GossipEngine>,
    /// Wakes the dispatcher after anything that may free or create work.
    dispatch: Arc<Notify>,
}

impl TaskQueue {
    /// Wires the queue to its collaborators.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        store: Arc<SwarmStore>,
        gossip: Arc<GossipEngine>,
        dispatch: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            store,
            gossip,
            dispatch,
        })
    }

    /// Inserts a new task and gossips TASK_CREATE.
    pub async fn enqueue(&self, mut task: Task) -> Result<Task> {
        task.lamport_ts = self.gossip.tick();
        self.store.insert_task(&task)?;
        info!(task_id = %task.id, title = %task.title, "task enqueued");
        self.gossip.announce_task_create(&task).await;
        self.dispatch.notify_one();
        Ok(task)
    }

    /// Atomically claims a pending task for a locally-owned agent.
    /// Returns false when someone else got there first.
    pub async fn claim(&self, task_id: &TaskId, agent_id: &AgentId) -> Result<bool> {
        let lamport = self.gossip.tick();
        let won = self
            .store
            .claim_task(task_id, agent_id, &self.node_id, lamport)?;
        if won {
            info!(task_id = %task_id, agent_id = %agent_id, "task claimed locally");
            self.gossip
                .announce_task_claim(TaskClaim {
                    task_id: *task_id,
                    agent_id: *agent_id,
                    node_id: self.node_id,
                    lamport_ts: lamport,
                    claimed_at: Timestamp::now(),
                })
                .await;
        }
        Ok(won)
    }

    /// Moves a claimed task into execution.
    pub async fn start(&self, task_id: &TaskId) -> Result<bool> {
        self.transition(task_id, TaskStatus::InProgress, None, None)
            .await
    }

    /// Completes a task. Terminal; later writers lose.
    pub async fn complete(&self, task_id: &TaskId, result: Option<&str>) -> Result<bool> {
        let lamport = self.gossip.tick();
        let applied =
            self.store
                .transition_task(task_id, TaskStatus::Completed, result, None, lamport)?;
        if applied {
            if let Some(task) = self.store.get_task(task_id)? {
                self.gossip.announce_task_complete(&task).await;
            }
            self.dispatch.notify_one();
        }
        Ok(applied)
    }

    /// Fails a task with a reason. Terminal.
    pub async fn fail(&self, task_id: &TaskId, error: &str) -> Result<bool> {
        let lamport = self.gossip.tick();
        let applied =
            self.store
                .transition_task(task_id, TaskStatus::Failed, None, Some(error), lamport)?;
        if applied {
            warn!(task_id = %task_id, error, "task failed");
            if let Some(task) = self.store.get_task(task_id)? {
                self.gossip.announce_task_fail(&task).await;
            }
            self.dispatch.notify_one();
        }
        Ok(applied)
    }

    /// Cancels a task. Terminal.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<bool> {
        let lamport = self.gossip.tick();
        let applied =
            self.store
                .transition_task(task_id, TaskStatus::Cancelled, None, None, lamport)?;
        if applied {
            if let Some(task) = self.store.get_task(task_id)? {
                self.gossip.announce_task_cancel(&task).await;
            }
        }
        Ok(applied)
    }

    /// Resets a non-terminal task to pending and gossips the new row.
    pub async fn requeue(&self, task_id: &TaskId, reason: &str) -> Result<bool> {
        let lamport = self.gossip.tick();
        let applied = self.store.requeue_task(task_id, lamport)?;
        if applied {
            info!(task_id = %task_id, reason, "task requeued");
            if let Some(task) = self.store.get_task(task_id)? {
                self.gossip
                    .announce_task_update(&task, TaskAction::Requeued)
                    .await;
            }
            self.dispatch.notify_one();
        }
        Ok(applied)
    }

    /// Records executor progress on a running task.
    pub async fn update_progress(&self, task_id: &TaskId, progress: &str) -> Result<bool> {
        let lamport = self.gossip.tick();
        let applied = self.store.record_progress(task_id, progress, lamport)?;
        if applied {
            if let Some(task) = self.store.get_task(task_id)? {
                self.gossip
                    .announce_task_update(&task, TaskAction::Updated)
                    .await;
            }
        }
        Ok(applied)
    }

    /// Startup orphan recovery: every non-terminal task this node was
    /// executing when it died goes back to pending with a Lamport bump.
    pub async fn recover_orphans(&self) -> Result<usize> {
        let orphans = self.store.orphaned_tasks(&self.node_id)?;
        let count = orphans.len();
        for task in orphans {
            warn!(task_id = %task.id, status = %task.status, "recovering orphaned task");
            self.requeue(&task.id, "orphaned at restart").await?;
        }
        Ok(count)
    }

    async fn transition(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool> {
        let lamport = self.gossip.tick();
        let applied = self
            .store
            .transition_task(task_id, status, result, error, lamport)?;
        if applied {
            if let Some(task) = self.store.get_task(task_id)? {
                self.gossip
                    .announce_task_update(&task, TaskAction::Updated)
                    .await;
            }
        }
        Ok(applied)
    }

    /// Read access for the control plane.
    pub fn get(&self, task_id: &TaskId) -> Result<Option<Task>> {
        Ok(self.store.get_task(task_id)?)
    }

    /// All tasks, for the control plane.
    pub fn list(&self) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;
    use voidlux_core::{Lamport, NodeRole, SwarmEvent};
    use voidlux_gossip::LamportClock;
    use voidlux_mesh::{MeshConfig, MeshServer};

    fn queue() -> (Arc<TaskQueue>, Arc<SwarmStore>, NodeId) {
        let node_id = NodeId::generate();
        let store = Arc::new(SwarmStore::open_in_memory().unwrap());
        let clock = Arc::new(LamportClock::new(Lamport::ZERO));
        let mesh = MeshServer::new(MeshConfig::new(
            node_id,
            NodeRole::Worker,
            "127.0.0.1:0".parse().unwrap(),
        ));
        let (events, _): (broadcast::Sender<SwarmEvent>, _) = broadcast::channel(64);
        let gossip = GossipEngine::new(node_id, clock, mesh, Arc::clone(&store), events);
        let queue = TaskQueue::new(node_id, Arc::clone(&store), gossip, Arc::new(Notify::new()));
        (queue, store, node_id)
    }

    #[tokio::test]
    async fn enqueue_stamps_lamport() {
        let (queue, store, _) = queue();
        let task = queue
            .enqueue(Task::new("t", "d", NodeId::generate()))
            .await
            .unwrap();
        assert!(task.lamport_ts > Lamport::ZERO);
        assert_eq!(
            store.get_task(&task.id).unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn claim_then_lifecycle() {
        let (queue, store, node_id) = queue();
        let task = queue
            .enqueue(Task::new("t", "d", node_id))
            .await
            .unwrap();

        let agent = AgentId::generate();
        assert!(queue.claim(&task.id, &agent).await.unwrap());
        assert!(!queue.claim(&task.id, &AgentId::generate()).await.unwrap());

        assert!(queue.start(&task.id).await.unwrap());
        assert_eq!(
            store.get_task(&task.id).unwrap().unwrap().status,
            TaskStatus::InProgress
        );

        assert!(queue.complete(&task.id, Some("done")).await.unwrap());
        let done = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.as_deref(), Some("done"));

        // Terminal: nothing else applies.
        assert!(!queue.fail(&task.id, "late").await.unwrap());
        assert!(!queue.requeue(&task.id, "late").await.unwrap());
    }

    #[tokio::test]
    async fn orphan_recovery_requeues_local_assignments() {
        let (queue, store, node_id) = queue();

        // A task this node was executing when it crashed.
        let task = queue.enqueue(Task::new("t", "d", node_id)).await.unwrap();
        queue.claim(&task.id, &AgentId::generate()).await.unwrap();
        queue.start(&task.id).await.unwrap();

        // A task assigned elsewhere stays untouched.
        let other = queue.enqueue(Task::new("o", "d", node_id)).await.unwrap();
        store
            .write_claim(
                &other.id,
                &AgentId::generate(),
                &NodeId::generate(),
                Lamport(99),
                Timestamp::now(),
            )
            .unwrap();

        let before = store.get_task(&task.id).unwrap().unwrap().lamport_ts;
        let recovered = queue.recover_orphans().await.unwrap();
        assert_eq!(recovered, 1);

        let requeued = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert!(requeued.assigned_to.is_none());
        assert!(requeued.lamport_ts > before);

        assert_eq!(
            store.get_task(&other.id).unwrap().unwrap().status,
            TaskStatus::Claimed
        );
    }

    #[tokio::test]
    async fn cancel_is_terminal() {
        let (queue, store, node_id) = queue();
        let task = queue.enqueue(Task::new("t", "d", node_id)).await.unwrap();
        assert!(queue.cancel(&task.id).await.unwrap());
        assert_eq!(
            store.get_task(&task.id).unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
        assert!(!queue.claim(&task.id, &AgentId::generate()).await.unwrap());
    }
}
