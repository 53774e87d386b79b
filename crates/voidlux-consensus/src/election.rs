//! Leader election: heartbeats, candidacy, lowest-id convergence.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use voidlux_core::NodeId;
use voidlux_gossip::LamportClock;
use voidlux_mesh::MeshServer;
use voidlux_wire::{ElectionStart, ElectionVictory, EmperorHeartbeat, Message};

/// Election timing knobs.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Leader heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Follower declares the throne vacant after this long.
    pub stale_after: Duration,
    /// Base candidate tally wait.
    pub tally_base: Duration,
    /// Uniform jitter added to the tally wait (prevents split votes).
    pub tally_jitter: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
            tally_base: Duration::from_secs(5),
            tally_jitter: Duration::from_secs(3),
        }
    }
}

/// Per-node election role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectorState {
    /// Accepting a leader's heartbeats.
    Follower,
    /// Running in an election.
    Candidate,
    /// Holding the throne.
    Leader,
}

/// The leader view published to the rest of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderInfo {
    /// The accepted leader, or none while the throne is vacant.
    pub leader: Option<NodeId>,
    /// The term the leader holds.
    pub term: u64,
}

#[derive(Debug)]
struct ElectorInner {
    state: ElectorState,
    current_term: u64,
    leader_id: Option<NodeId>,
    last_heartbeat: Instant,
    /// Candidates seen this election, self included while running.
    candidates: BTreeSet<NodeId>,
    /// When the running candidacy tallies.
    tally_at: Option<Instant>,
}

/// The single elector implementation.
pub struct Elector {
    node_id: NodeId,
    config: ElectionConfig,
    mesh: Arc<MeshServer>,
    clock: Arc<LamportClock>,
    inner: Mutex<ElectorInner>,
    leader_tx: watch::Sender<LeaderInfo>,
    /// Supplies the latest committed log index for election messages.
    log_index: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl Elector {
    /// Creates a follower with a vacant throne.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        config: ElectionConfig,
        mesh: Arc<MeshServer>,
        clock: Arc<LamportClock>,
        log_index: Box<dyn Fn() -> u64 + Send + Sync>,
    ) -> Arc<Self> {
        let (leader_tx, _) = watch::channel(LeaderInfo {
            leader: None,
            term: 0,
        });
        Arc::new(Self {
            node_id,
            config,
            mesh,
            clock,
            inner: Mutex::new(ElectorInner {
                state: ElectorState::Follower,
                current_term: 0,
                leader_id: None,
                last_heartbeat: Instant::now(),
                candidates: BTreeSet::new(),
                tally_at: None,
            }),
            leader_tx,
            log_index,
        })
    }

    /// An emperor-by-configuration seats itself at term 1.
    pub fn assume_leadership(&self) {
        let mut inner = self.inner.lock();
        inner.state = ElectorState::Leader;
        inner.current_term = 1;
        inner.leader_id = Some(self.node_id);
        drop(inner);
        self.publish(Some(self.node_id), 1);
        info!(term = 1, "assumed leadership by configuration");
    }

    /// The current leader view.
    #[must_use]
    pub fn leader(&self) -> LeaderInfo {
        *self.leader_tx.borrow()
    }

    /// True while this node holds the throne.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.inner.lock().state == ElectorState::Leader
    }

    /// The current term.
    #[must_use]
    pub fn current_term(&self) -> u64 {
        self.inner.lock().current_term
    }

    /// Subscribes to leader changes. Fires exactly once per accepted
    /// change.
    #[must_use]
    pub fn watch_leader(&self) -> watch::Receiver<LeaderInfo> {
        self.leader_tx.subscribe()
    }

    fn publish(&self, leader: Option<NodeId>, term: u64) {
        let info = LeaderInfo { leader, term };
        self.leader_tx.send_if_modified(|current| {
            if *current == info {
                false
            } else {
                *current = info;
                true
            }
        });
    }

    /// A leader heartbeat arrived.
    pub async fn on_heartbeat(&self, msg: &EmperorHeartbeat) {
        self.clock.witness(msg.lamport_ts);
        let reassert = {
            let mut inner = self.inner.lock();
            // Equal terms settle on the lowest node id, the same rule
            // elections use; a deposed emperor's final heartbeat loses.
            let accept = msg.term > inner.current_term
                || (msg.term == inner.current_term
                    && inner.leader_id.map_or(true, |l| msg.node_id <= l));
            if accept {
                // Accept: a heartbeat during an election cancels it.
                let changed = inner.leader_id != Some(msg.node_id);
                inner.current_term = msg.term;
                inner.leader_id = Some(msg.node_id);
                inner.last_heartbeat = Instant::now();
                if inner.state != ElectorState::Leader || msg.node_id != self.node_id {
                    inner.state = ElectorState::Follower;
                }
                inner.candidates.clear();
                inner.tally_at = None;
                if changed {
                    info!(
                        leader = %msg.node_id.short(),
                        term = msg.term,
                        "accepted emperor heartbeat"
                    );
                }
                drop(inner);
                self.publish(Some(msg.node_id), msg.term);
                false
            } else {
                // Stale term. A sitting leader reasserts itself.
                inner.state == ElectorState::Leader
            }
        };
        if reassert {
            self.send_heartbeat().await;
        }
    }

    /// A candidacy announcement arrived.
    pub async fn on_election_start(&self, msg: &ElectionStart) {
        self.clock.witness(msg.lamport_ts);
        let action = {
            let mut inner = self.inner.lock();
            if inner.state == ElectorState::Leader && inner.current_term >= msg.term {
                // We still hold the throne; remind the challenger.
                Action::Reassert
            } else if msg.term > inner.current_term {
                // Adopt the newer term and join the race.
                inner.current_term = msg.term;
                inner.state = ElectorState::Candidate;
                inner.leader_id = None;
                inner.candidates.clear();
                inner.candidates.insert(msg.node_id);
                inner.candidates.insert(self.node_id);
                inner.tally_at = Some(Instant::now() + self.tally_wait());
                Action::Join(msg.term)
            } else if msg.term == inner.current_term
                && inner.state == ElectorState::Candidate
            {
                inner.candidates.insert(msg.node_id);
                Action::None
            } else {
                Action::None
            }
        };

        match action {
            Action::Reassert => self.send_heartbeat().await,
            Action::Join(term) => {
                debug!(term, "joining election");
                self.broadcast_candidacy(term).await;
            }
            Action::None => {}
        }
    }

    /// A victory announcement arrived.
    pub fn on_victory(&self, msg: &ElectionVictory) {
        self.clock.witness(msg.lamport_ts);
        let mut inner = self.inner.lock();
        let accept = msg.term > inner.current_term
            || (msg.term == inner.current_term
                && inner.leader_id.map_or(true, |l| msg.node_id <= l));
        if accept {
            inner.current_term = msg.term;
            inner.leader_id = Some(msg.node_id);
            inner.state = if msg.node_id == self.node_id {
                ElectorState::Leader
            } else {
                ElectorState::Follower
            };
            inner.last_heartbeat = Instant::now();
            inner.candidates.clear();
            inner.tally_at = None;
            info!(leader = %msg.node_id.short(), term = msg.term, "accepted election victory");
            drop(inner);
            self.publish(Some(msg.node_id), msg.term);
        }
    }

    fn tally_wait(&self) -> Duration {
        let jitter_ms = self.config.tally_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_ms)
        };
        self.config.tally_base + Duration::from_millis(jitter)
    }

    async fn send_heartbeat(&self) {
        let (term, lamport) = {
            let inner = self.inner.lock();
            (inner.current_term, self.clock.tick())
        };
        let msg = Message::EmperorHeartbeat(EmperorHeartbeat {
            node_id: self.node_id,
            term,
            lamport_ts: lamport,
            log_index: (self.log_index)(),
        });
        self.mesh.broadcast(&msg, None).await;
    }

    async fn broadcast_candidacy(&self, term: u64) {
        let msg = Message::ElectionStart(ElectionStart {
            node_id: self.node_id,
            term,
            log_index: (self.log_index)(),
            lamport_ts: self.clock.tick(),
        });
        self.mesh.broadcast(&msg, None).await;
    }

    async fn broadcast_victory(&self, term: u64) {
        let msg = Message::ElectionVictory(ElectionVictory {
            node_id: self.node_id,
            term,
            lamport_ts: self.clock.tick(),
        });
        self.mesh.broadcast(&msg, None).await;
    }

    /// The election driver: heartbeats while leading, staleness watch
    /// while following, tally when a candidacy matures.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        // Backdated so a configured leader heartbeats on its first tick.
        let mut last_heartbeat_sent = Instant::now()
            .checked_sub(self.config.heartbeat_interval)
            .unwrap_or_else(Instant::now);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            enum Step {
                Heartbeat,
                StartElection(u64),
                Tally(u64, bool),
                Idle,
            }

            let step = {
                let mut inner = self.inner.lock();
                match inner.state {
                    ElectorState::Leader => {
                        if last_heartbeat_sent.elapsed() >= self.config.heartbeat_interval {
                            Step::Heartbeat
                        } else {
                            Step::Idle
                        }
                    }
                    ElectorState::Follower => {
                        if inner.last_heartbeat.elapsed() > self.config.stale_after {
                            inner.current_term += 1;
                            inner.state = ElectorState::Candidate;
                            inner.leader_id = None;
                            inner.candidates.clear();
                            inner.candidates.insert(self.node_id);
                            inner.tally_at = Some(Instant::now() + self.tally_wait());
                            Step::StartElection(inner.current_term)
                        } else {
                            Step::Idle
                        }
                    }
                    ElectorState::Candidate => match inner.tally_at {
                        Some(at) if Instant::now() >= at => {
                            let winner = inner
                                .candidates
                                .iter()
                                .min()
                                .copied()
                                .unwrap_or(self.node_id);
                            let won = winner == self.node_id;
                            let term = inner.current_term;
                            if won {
                                inner.state = ElectorState::Leader;
                                inner.leader_id = Some(self.node_id);
                            } else {
                                // Wait for the winner's victory; fall back
                                // to the staleness timer if it never comes.
                                inner.state = ElectorState::Follower;
                                inner.last_heartbeat = Instant::now();
                            }
                            inner.candidates.clear();
                            inner.tally_at = None;
                            Step::Tally(term, won)
                        }
                        _ => Step::Idle,
                    },
                }
            };

            match step {
                Step::Heartbeat => {
                    self.send_heartbeat().await;
                    last_heartbeat_sent = Instant::now();
                }
                Step::StartElection(term) => {
                    warn!(term, "emperor heartbeat stale, starting election");
                    self.broadcast_candidacy(term).await;
                }
                Step::Tally(term, won) => {
                    if won {
                        info!(term, "won election");
                        self.publish(Some(self.node_id), term);
                        self.broadcast_victory(term).await;
                        self.send_heartbeat().await;
                        last_heartbeat_sent = Instant::now();
                    } else {
                        debug!(term, "lost election tally, awaiting victory");
                    }
                }
                Step::Idle => {}
            }
        }
    }
}

enum Action {
    Reassert,
    Join(u64),
    None,
}
