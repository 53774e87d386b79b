//! The node's Lamport clock.

use std::sync::atomic::{AtomicU64, Ordering};
use voidlux_core::Lamport;

/// A monotonic logical clock shared by every component on the node.
///
/// `tick` advances for local events; `witness` folds in a remote
/// timestamp so causality is never inverted. The value is persisted
/// periodically and restored at startup.
#[derive(Debug)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    /// Creates a clock starting at the persisted value.
    #[must_use]
    pub fn new(initial: Lamport) -> Self {
        Self {
            counter: AtomicU64::new(initial.value()),
        }
    }

    /// Advances the clock for a local event and returns the new value.
    pub fn tick(&self) -> Lamport {
        Lamport(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Folds in a remote timestamp: `counter = max(counter, remote) + 1`.
    pub fn witness(&self, remote: Lamport) -> Lamport {
        let mut current = self.counter.load(Ordering::SeqCst);
        loop {
            let next = current.max(remote.value()) + 1;
            match self.counter.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Lamport(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// The current value, without advancing.
    #[must_use]
    pub fn current(&self) -> Lamport {
        Lamport(self.counter.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tick_is_monotone() {
        let clock = LamportClock::new(Lamport::ZERO);
        assert_eq!(clock.tick(), Lamport(1));
        assert_eq!(clock.tick(), Lamport(2));
        assert_eq!(clock.current(), Lamport(2));
    }

    #[test]
    fn witness_jumps_past_remote() {
        let clock = LamportClock::new(Lamport(5));
        assert_eq!(clock.witness(Lamport(10)), Lamport(11));
        // A remote value behind us still advances by one.
        assert_eq!(clock.witness(Lamport(3)), Lamport(12));
    }

    #[test]
    fn restored_clock_continues() {
        let clock = LamportClock::new(Lamport(100));
        assert_eq!(clock.tick(), Lamport(101));
    }

    #[test]
    fn concurrent_ticks_never_collide() {
        use std::sync::Arc;
        let clock = Arc::new(LamportClock::new(Lamport::ZERO));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let clock = Arc::clone(&clock);
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| clock.tick().value()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8000);
    }
}
