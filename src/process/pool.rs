//! Fixed-size pool of backend process slots.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::process::server::ServerProcess;

/// Round-robin slot selector.
/// Stores an internal counter to rotate through slots.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// `counter mod len`; `len` must be non-zero.
    pub fn next_index(&self, len: usize) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % len
    }
}

/// Slots may be empty or hold a process that is no longer ready; either
/// triggers re-creation on the next request routed there.
#[derive(Debug, Default)]
pub struct ProcessPool {
    slots: Vec<Option<Arc<ServerProcess>>>,
}

impl ProcessPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size.max(1)).map(|_| None).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<ServerProcess>> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Ready occupant of `index`, if any.
    pub fn ready(&self, index: usize) -> Option<Arc<ServerProcess>> {
        self.get(index).filter(|p| p.is_ready()).cloned()
    }

    pub fn take(&mut self, index: usize) -> Option<Arc<ServerProcess>> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    pub fn put(&mut self, index: usize, process: Arc<ServerProcess>) -> Option<Arc<ServerProcess>> {
        self.slots.get_mut(index).and_then(|slot| slot.replace(process))
    }

    /// Remove `process` from its slot if it still occupies it.
    pub fn remove(&mut self, process: &Arc<ServerProcess>) -> Option<Arc<ServerProcess>> {
        let slot = self.slots.get_mut(process.slot())?;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, process)) {
            slot.take()
        } else {
            None
        }
    }

    /// Empty every slot and resize the pool.
    pub fn drain(&mut self, new_size: usize) -> Vec<Arc<ServerProcess>> {
        let drained = self.slots.drain(..).flatten().collect();
        self.slots = (0..new_size.max(1)).map(|_| None).collect();
        drained
    }

    pub fn occupants(&self) -> impl Iterator<Item = &Arc<ServerProcess>> {
        self.slots.iter().flatten()
    }

    pub fn ready_count(&self) -> usize {
        self.occupants().filter(|p| p.is_ready()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_wraps() {
        let rr = RoundRobin::new();
        let picks: Vec<_> = (0..7).map(|_| rr.next_index(3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn pool_has_at_least_one_slot() {
        let mut pool = ProcessPool::new(0);
        assert_eq!(pool.len(), 1);
        assert!(pool.get(0).is_none());
        assert!(pool.drain(4).is_empty());
        assert_eq!(pool.len(), 4);
    }
}
