//! Descriptor-to-path cache of the calling process.

use parking_lot::Mutex;
use sandtrace_common::constants::FD_TABLE_SIZE;

/// Remembers the canonical path behind each open descriptor.
///
/// Descriptors at or above [`FD_TABLE_SIZE`] are never cached.
#[derive(Debug)]
pub struct FdTable {
    slots: Mutex<Vec<Option<String>>>,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(vec![None; FD_TABLE_SIZE]),
        }
    }

    fn index(fd: i32) -> Option<usize> {
        usize::try_from(fd).ok().filter(|i| *i < FD_TABLE_SIZE)
    }

    /// Returns the cached path of `fd`.
    pub fn get(&self, fd: i32) -> Option<String> {
        let index = Self::index(fd)?;
        self.slots.lock()[index].clone()
    }

    /// Caches the path of `fd`.
    pub fn set(&self, fd: i32, path: &str) {
        if let Some(index) = Self::index(fd) {
            self.slots.lock()[index] = Some(path.to_owned());
        }
    }

    /// Forgets `fd`, e.g. after `close` or when the number was reused.
    pub fn reset(&self, fd: i32) {
        if let Some(index) = Self::index(fd) {
            self.slots.lock()[index] = None;
        }
    }
}
