//! Processes of a step's tree that are still alive.

use std::collections::HashSet;

use parking_lot::Mutex;

/// Concurrency-safe set of live pids.
///
/// Mutations report whether they emptied the set, so exactly one caller
/// observes each non-empty to empty transition.
#[derive(Debug, Default)]
pub struct ActiveProcessSet {
    pids: Mutex<HashSet<u32>>,
}

impl ActiveProcessSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pid. Returns `false` if it was already present.
    pub fn add(&self, pid: u32) -> bool {
        self.pids.lock().insert(pid)
    }

    /// Removes a pid. Returns `true` if this removal emptied the set.
    pub fn remove(&self, pid: u32) -> bool {
        let mut pids = self.pids.lock();
        pids.remove(&pid) && pids.is_empty()
    }

    /// Removes every pid for which `alive` returns `false`.
    ///
    /// Returns the removed pids and whether the removals emptied the set.
    pub fn retain_alive(&self, alive: impl Fn(u32) -> bool) -> (Vec<u32>, bool) {
        let mut pids = self.pids.lock();
        let dead: Vec<u32> = pids.iter().copied().filter(|pid| !alive(*pid)).collect();
        for pid in &dead {
            let _ = pids.remove(pid);
        }
        let emptied = !dead.is_empty() && pids.is_empty();
        (dead, emptied)
    }

    /// Returns `true` if no process is tracked.
    pub fn is_empty(&self) -> bool {
        self.pids.lock().is_empty()
    }

    /// Returns the number of tracked processes.
    pub fn len(&self) -> usize {
        self.pids.lock().len()
    }

    /// Returns the tracked pids in ascending order.
    pub fn snapshot(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.pids.lock().iter().copied().collect();
        pids.sort_unstable();
        pids
    }
}
