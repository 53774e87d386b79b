//! Partition detection with hysteresis.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};
use voidlux_mesh::PeerManager;

/// Evaluation cadence.
const EVAL_INTERVAL: Duration = Duration::from_secs(5);
/// A peer counts as reachable when seen this recently.
const REACHABLE_WINDOW: Duration = Duration::from_secs(30);
/// Quorum must stay lost this long before we declare a partition.
const PARTITION_GRACE: Duration = Duration::from_secs(15);

/// Tracks whether this node can still see a majority of the cluster.
///
/// The cluster-size estimate starts at the configured seed count and is
/// updated by committed `membership_change` operations.
pub struct PartitionDetector {
    peers: Arc<PeerManager>,
    cluster_size: AtomicUsize,
    state: Mutex<DetectorState>,
    partitioned_tx: watch::Sender<bool>,
}

#[derive(Debug)]
struct DetectorState {
    partitioned: bool,
    below_quorum_since: Option<Instant>,
}

impl PartitionDetector {
    /// Creates a detector with an initial cluster-size estimate.
    #[must_use]
    pub fn new(peers: Arc<PeerManager>, initial_cluster_size: usize) -> Arc<Self> {
        let (partitioned_tx, _) = watch::channel(false);
        Arc::new(Self {
            peers,
            cluster_size: AtomicUsize::new(initial_cluster_size.max(1)),
            state: Mutex::new(DetectorState {
                partitioned: false,
                below_quorum_since: None,
            }),
            partitioned_tx,
        })
    }

    /// The current cluster-size estimate (peers + self).
    #[must_use]
    pub fn cluster_size(&self) -> usize {
        self.cluster_size.load(Ordering::SeqCst)
    }

    /// Updates the estimate from a committed membership change.
    pub fn set_cluster_size(&self, size: usize) {
        let size = size.max(1);
        self.cluster_size.store(size, Ordering::SeqCst);
        info!(cluster_size = size, "cluster size estimate updated");
    }

    /// Votes needed for a majority of the estimated cluster.
    #[must_use]
    pub fn quorum_required(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Instantaneous quorum check: reachable peers + self form a
    /// majority. Used as the leader-lease gate for consistent reads.
    #[must_use]
    pub fn has_quorum(&self) -> bool {
        let reachable = self.peers.seen_within(REACHABLE_WINDOW).len();
        reachable + 1 > self.cluster_size() / 2
    }

    /// True while the node considers itself partitioned.
    #[must_use]
    pub fn is_partitioned(&self) -> bool {
        *self.partitioned_tx.borrow()
    }

    /// Subscribes to partition transitions.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.partitioned_tx.subscribe()
    }

    /// One evaluation step. Entering a partition requires the grace
    /// period to pass without quorum; healing is immediate.
    pub fn evaluate(&self) {
        let quorum = self.has_quorum();
        let mut state = self.state.lock();

        if quorum {
            state.below_quorum_since = None;
            if state.partitioned {
                state.partitioned = false;
                info!("partition healed, quorum restored");
                drop(state);
                let _ = self.partitioned_tx.send(false);
            }
            return;
        }

        match state.below_quorum_since {
            None => {
                state.below_quorum_since = Some(Instant::now());
            }
            Some(since) if !state.partitioned && since.elapsed() >= PARTITION_GRACE => {
                state.partitioned = true;
                warn!(
                    cluster_size = self.cluster_size(),
                    "quorum lost, entering partition mode"
                );
                drop(state);
                let _ = self.partitioned_tx.send(true);
            }
            Some(_) => {}
        }
    }

    /// The 5-second evaluation loop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(EVAL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.evaluate(),
            }
        }
    }
}
