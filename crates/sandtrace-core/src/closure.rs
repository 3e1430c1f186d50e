//! Per-session memory of which accesses were already reported.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use sandtrace_common::constants::CLOSURE_LOCK_TIMEOUT_MS;
use sandtrace_common::types::RequestedAccess;

/// Map from canonical path to the closure of every access reported for it.
///
/// Lookups and updates wait a bounded time for the lock. A lookup that
/// times out counts as a miss and an update that times out is dropped, so
/// contention can only cause extra reports, never lost ones.
#[derive(Debug)]
pub struct AccessClosure {
    entries: Mutex<HashMap<String, RequestedAccess>>,
    lock_timeout: Duration,
}

impl Default for AccessClosure {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessClosure {
    /// Creates an empty closure with the default lock timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(Duration::from_millis(CLOSURE_LOCK_TIMEOUT_MS))
    }

    /// Creates an empty closure with a custom lock timeout.
    #[must_use]
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    /// Returns `true` if `access` on `path` is implied by what was already
    /// recorded. An empty access set is never covered.
    pub fn covers(&self, path: &str, access: RequestedAccess) -> bool {
        if access.is_empty() {
            return false;
        }
        let Some(entries) = self.entries.try_lock_for(self.lock_timeout) else {
            tracing::trace!(path, "closure lock contended, treating as miss");
            return false;
        };
        entries.get(path).is_some_and(|known| known.contains(access))
    }

    /// Adds `access` and everything it implies to the entry for `path`.
    ///
    /// Returns `false` if the lock could not be taken in time.
    pub fn record(&self, path: &str, access: RequestedAccess) -> bool {
        let Some(mut entries) = self.entries.try_lock_for(self.lock_timeout) else {
            tracing::trace!(path, "closure lock contended, update dropped");
            return false;
        };
        *entries.entry(path.to_owned()).or_default() |= access.closure();
        true
    }

    /// Returns the recorded access closure of `path`.
    pub fn recorded(&self, path: &str) -> Option<RequestedAccess> {
        self.entries.lock().get(path).copied()
    }

    /// Returns the number of distinct paths recorded.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
