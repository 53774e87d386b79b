//! Concurrent-claim resolution.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};
use voidlux_core::{wins, AgentId, NodeId, Task};
use voidlux_gossip::ClaimResolver;
use voidlux_storage::SwarmStore;
use voidlux_wire::TaskClaim;

/// Called when a concurrent claim race cost this node's agent its
/// assignment; the agent layer frees the agent and fails its handoff.
pub type LocalLossHook = Box<dyn Fn(&Task, AgentId) + Send + Sync>;

/// Settles remote TASK_CLAIM messages against the local row.
///
/// Two nodes can both win their local `pending → claimed` update before
/// either's gossip lands. Every node resolves the race identically: the
/// claim with the larger `(lamport_ts, node_id)` pair stands, and the
/// losing node cancels its own agent's assignment.
pub struct QueueClaimResolver {
    node_id: NodeId,
    store: Arc<SwarmStore>,
    on_local_loss: RwLock<Option<LocalLossHook>>,
}

impl QueueClaimResolver {
    /// Creates the resolver.
    #[must_use]
    pub fn new(node_id: NodeId, store: Arc<SwarmStore>) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            store,
            on_local_loss: RwLock::new(None),
        })
    }

    /// Installs the losing-side hook (wired by the agent registry).
    pub fn set_local_loss_hook(&self, hook: LocalLossHook) {
        *self.on_local_loss.write() = Some(hook);
    }
}

impl ClaimResolver for QueueClaimResolver {
    fn on_remote_claim(&self, claim: &TaskClaim) -> bool {
        let local = match self.store.get_task(&claim.task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                // The claim outran its TASK_CREATE; anti-entropy will
                // deliver the row, and the claim fields ride along.
                debug!(task_id = %claim.task_id, "claim for unknown task dropped");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "claim resolution read failed");
                return false;
            }
        };

        if local.status.is_terminal() {
            return false;
        }

        match (local.assigned_to, local.assigned_node) {
            (Some(local_agent), Some(local_node)) => {
                if local_agent == claim.agent_id && local_node == claim.node_id {
                    return false; // the same claim, already applied
                }
                if wins(
                    (claim.lamport_ts, &claim.node_id),
                    (local.lamport_ts, &local_node),
                ) {
                    // The remote claim stands; if the displaced winner
                    // was us, our agent lost the race.
                    if local_node == self.node_id {
                        info!(
                            task_id = %claim.task_id,
                            winner = %claim.node_id.short(),
                            "lost claim race, releasing local assignment"
                        );
                        if let Some(hook) = self.on_local_loss.read().as_ref() {
                            hook(&local, local_agent);
                        }
                    }
                    self.apply(claim)
                } else {
                    debug!(
                        task_id = %claim.task_id,
                        "remote claim loses to local assignment"
                    );
                    false
                }
            }
            _ => {
                // Still pending here: accept the remote claim.
                self.apply(claim)
            }
        }
    }
}

impl QueueClaimResolver {
    fn apply(&self, claim: &TaskClaim) -> bool {
        match self.store.write_claim(
            &claim.task_id,
            &claim.agent_id,
            &claim.node_id,
            claim.lamport_ts,
            claim.claimed_at,
        ) {
            Ok(applied) => applied,
            Err(e) => {
                warn!(error = %e, "claim write failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use voidlux_core::{Lamport, TaskStatus, Timestamp};

    fn setup() -> (Arc<QueueClaimResolver>, Arc<SwarmStore>, NodeId) {
        let node_id = NodeId::from_bytes([5; 16]);
        let store = Arc::new(SwarmStore::open_in_memory().unwrap());
        let resolver = QueueClaimResolver::new(node_id, Arc::clone(&store));
        (resolver, store, node_id)
    }

    fn claim(task: &Task, node: NodeId, lamport: u64) -> TaskClaim {
        TaskClaim {
            task_id: task.id,
            agent_id: AgentId::generate(),
            node_id: node,
            lamport_ts: Lamport(lamport),
            claimed_at: Timestamp::now(),
        }
    }

    #[test]
    fn pending_task_accepts_remote_claim() {
        let (resolver, store, _) = setup();
        let task = Task::new("t", "d", NodeId::generate());
        store.insert_task(&task).unwrap();

        let remote = claim(&task, NodeId::from_bytes([9; 16]), 4);
        assert!(resolver.on_remote_claim(&remote));

        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Claimed);
        assert_eq!(loaded.assigned_to, Some(remote.agent_id));
        assert_eq!(loaded.assigned_node, Some(remote.node_id));
    }

    #[test]
    fn unknown_task_claim_dropped() {
        let (resolver, _, _) = setup();
        let task = Task::new("t", "d", NodeId::generate());
        assert!(!resolver.on_remote_claim(&claim(&task, NodeId::generate(), 4)));
    }

    #[test]
    fn higher_lamport_claim_displaces_local_winner() {
        let (resolver, store, me) = setup();

        let losses: Arc<Mutex<Vec<AgentId>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&losses);
        resolver.set_local_loss_hook(Box::new(move |_task, agent| {
            sink.lock().push(agent);
        }));

        let task = Task::new("t", "d", NodeId::generate());
        store.insert_task(&task).unwrap();

        // Our local claim at Lamport 3.
        let our_agent = AgentId::generate();
        store.claim_task(&task.id, &our_agent, &me, Lamport(3)).unwrap();

        // A concurrent remote claim at Lamport 5 wins.
        let remote = claim(&task, NodeId::from_bytes([9; 16]), 5);
        assert!(resolver.on_remote_claim(&remote));

        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.assigned_node, Some(remote.node_id));
        assert_eq!(&*losses.lock(), &[our_agent]);
    }

    #[test]
    fn lower_lamport_claim_is_refused() {
        let (resolver, store, me) = setup();
        let task = Task::new("t", "d", NodeId::generate());
        store.insert_task(&task).unwrap();

        let our_agent = AgentId::generate();
        store.claim_task(&task.id, &our_agent, &me, Lamport(8)).unwrap();

        let remote = claim(&task, NodeId::from_bytes([9; 16]), 5);
        assert!(!resolver.on_remote_claim(&remote));

        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.assigned_to, Some(our_agent));
        assert_eq!(loaded.assigned_node, Some(me));
    }

    #[test]
    fn equal_lamport_resolves_by_node_id() {
        let (resolver, store, me) = setup();
        let task = Task::new("t", "d", NodeId::generate());
        store.insert_task(&task).unwrap();
        store
            .claim_task(&task.id, &AgentId::generate(), &me, Lamport(5))
            .unwrap();

        // me = [5; 16]; a higher node id at the same Lamport wins...
        let higher = claim(&task, NodeId::from_bytes([9; 16]), 5);
        assert!(resolver.on_remote_claim(&higher));

        // ...and a lower one loses.
        let (resolver2, store2, me2) = setup();
        let task2 = Task::new("t2", "d", NodeId::generate());
        store2.insert_task(&task2).unwrap();
        store2
            .claim_task(&task2.id, &AgentId::generate(), &me2, Lamport(5))
            .unwrap();
        let lower = claim(&task2, NodeId::from_bytes([1; 16]), 5);
        assert!(!resolver2.on_remote_claim(&lower));
    }

    #[test]
    fn terminal_task_never_reclaimed() {
        let (resolver, store, _) = setup();
        let task = Task::new("t", "d", NodeId::generate());
        store.insert_task(&task).unwrap();
        store
            .transition_task(&task.id, TaskStatus::Completed, Some("ok"), None, Lamport(2))
            .unwrap();

        assert!(!resolver.on_remote_claim(&claim(&task, NodeId::generate(), 50)));
        assert_eq!(
            store.get_task(&task.id).unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[test]
    fn duplicate_claim_is_noop() {
        let (resolver, store, _) = setup();
        let task = Task::new("t", "d", NodeId::generate());
        store.insert_task(&task).unwrap();

        let remote = claim(&task, NodeId::from_bytes([9; 16]), 4);
        assert!(resolver.on_remote_claim(&remote));
        assert!(!resolver.on_remote_claim(&remote));
    }
}
