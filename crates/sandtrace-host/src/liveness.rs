//! Liveness probing and the periodic sweep of the active set.
//!
//! A process killed by a signal never reports its exit, so the host checks
//! the tracked pids itself at a fixed interval.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::active_set::ActiveProcessSet;

/// Tells whether a process still runs.
pub trait ProcessProbe: Send + Sync {
    /// Returns `true` if `pid` is alive.
    fn is_alive(&self, pid: u32) -> bool;
}

/// [`ProcessProbe`] using signal 0 and the `/proc` process state.
///
/// Zombies count as dead: they will never report again.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl SystemProbe {
    fn is_zombie(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                stat.rsplit_once(')')
                    .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            })
            .unwrap_or(false)
    }
}

impl ProcessProbe for SystemProbe {
    #[cfg(target_os = "linux")]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => !Self::is_zombie(pid),
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

/// Background thread sweeping an [`ActiveProcessSet`].
pub struct Sweeper {
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Starts sweeping `set` every `interval`.
    ///
    /// `on_emptied` runs whenever a sweep empties the set.
    #[must_use]
    pub fn spawn(
        interval: Duration,
        set: Arc<ActiveProcessSet>,
        probe: Arc<dyn ProcessProbe>,
        on_emptied: impl Fn() + Send + 'static,
    ) -> Self {
        let (shutdown, signal) = mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            loop {
                match signal.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let (dead, emptied) = set.retain_alive(|pid| probe.is_alive(pid));
                if !dead.is_empty() {
                    tracing::debug!(?dead, "swept processes that exited without a report");
                }
                if emptied {
                    on_emptied();
                }
            }
            tracing::trace!("liveness sweep stopped");
        });
        Self {
            shutdown,
            thread: Some(thread),
        }
    }

    /// Stops the sweep and waits for the thread.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("liveness sweep thread panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
