//! Live-handle bookkeeping and round-robin worker selection.
//!
//! Both live behind one lock in the dispatcher. Every method here is a
//! structural update only; callers never hold the lock across I/O.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::relay::HandleId;

/// Where a dispatched handle went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveEntry {
    /// Index of the owning worker.
    pub worker: usize,
    pub peer: SocketAddr,
}

/// Handles dispatched and not yet finished.
#[derive(Debug)]
pub(crate) struct LiveSet {
    handles: HashMap<HandleId, LiveEntry>,
    /// Worker the next dispatch goes to.
    next_worker: usize,
    pool_size: usize,
}

impl LiveSet {
    pub(crate) fn new(pool_size: usize) -> Self {
        Self {
            handles: HashMap::new(),
            next_worker: 0,
            pool_size: pool_size.max(1),
        }
    }

    /// Pick the next worker and record `id` as owned by it.
    pub(crate) fn assign(&mut self, id: HandleId, peer: SocketAddr) -> usize {
        let worker = self.next_worker;
        self.next_worker = (self.next_worker + 1) % self.pool_size;
        self.handles.insert(id, LiveEntry { worker, peer });
        worker
    }

    /// Forget `id`. `None` if it was already gone.
    pub(crate) fn remove(&mut self, id: HandleId) -> Option<LiveEntry> {
        self.handles.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    /// Drop every remaining entry, returning them.
    pub(crate) fn drain(&mut self) -> Vec<(HandleId, LiveEntry)> {
        self.handles.drain().collect()
    }

    /// Live handle count per worker index.
    pub(crate) fn per_worker(&self) -> Vec<usize> {
        let mut counts = vec![0; self.pool_size];
        for entry in self.handles.values() {
            counts[entry.worker] += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.0.2.1:40000".parse().unwrap()
    }

    #[test]
    fn test_round_robin_order() {
        let mut live = LiveSet::new(3);
        let workers: Vec<_> = (0..7).map(|_| live.assign(HandleId::next(), peer())).collect();
        assert_eq!(workers, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(live.len(), 7);
    }

    #[test]
    fn test_fairness_over_multiple_of_pool() {
        let mut live = LiveSet::new(4);
        for _ in 0..12 {
            live.assign(HandleId::next(), peer());
        }
        assert_eq!(live.per_worker(), vec![3, 3, 3, 3]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut live = LiveSet::new(2);
        let id = HandleId::next();
        live.assign(id, peer());

        assert_eq!(live.remove(id), Some(LiveEntry { worker: 0, peer: peer() }));
        assert_eq!(live.remove(id), None);
        assert_eq!(live.len(), 0);
    }

    #[test]
    fn test_zero_pool_treated_as_one() {
        let mut live = LiveSet::new(0);
        assert_eq!(live.assign(HandleId::next(), peer()), 0);
        assert_eq!(live.assign(HandleId::next(), peer()), 0);
    }

    #[test]
    fn test_drain_empties() {
        let mut live = LiveSet::new(2);
        live.assign(HandleId::next(), peer());
        live.assign(HandleId::next(), peer());

        assert_eq!(live.drain().len(), 2);
        assert_eq!(live.len(), 0);
    }
}
