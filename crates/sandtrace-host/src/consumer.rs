//! Receivers of a session's access reports.

use std::sync::Arc;

use parking_lot::Mutex;
use sandtrace_common::error::SandtraceError;
use sandtrace_common::types::AccessEvent;

/// Receives every report of a session, in channel arrival order, on a
/// single thread.
pub trait AccessReportConsumer: Send {
    /// Handles one report.
    fn on_access(&mut self, event: AccessEvent);

    /// Handles a failure of the session. Called at most once per failed
    /// channel.
    fn on_failure(&mut self, err: &SandtraceError) {
        tracing::error!(error = %err, "observation session failed");
    }
}

impl<F> AccessReportConsumer for F
where
    F: FnMut(AccessEvent) + Send,
{
    fn on_access(&mut self, event: AccessEvent) {
        self(event);
    }
}

/// Consumer that keeps every report for later inspection.
#[derive(Debug, Clone, Default)]
pub struct CollectingConsumer {
    events: Arc<Mutex<Vec<AccessEvent>>>,
    failures: Arc<Mutex<Vec<String>>>,
}

impl CollectingConsumer {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the reports received so far.
    pub fn events(&self) -> Vec<AccessEvent> {
        self.events.lock().clone()
    }

    /// Returns the failure messages received so far.
    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().clone()
    }
}

impl AccessReportConsumer for CollectingConsumer {
    fn on_access(&mut self, event: AccessEvent) {
        self.events.lock().push(event);
    }

    fn on_failure(&mut self, err: &SandtraceError) {
        self.failures.lock().push(err.to_string());
    }
}
