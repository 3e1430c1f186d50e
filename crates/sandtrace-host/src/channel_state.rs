//! Per-channel drain handshake.
//!
//! The host cannot know whether a report is still in flight when the last
//! process exits, so it writes a "no active processes" marker into its own
//! channel and waits to read it back: everything written before the marker
//! has then been consumed. If the set is still empty at that point it
//! writes "end of reports", and reading that back closes the channel.

use std::fmt;

use parking_lot::Mutex;
use sandtrace_common::types::ChannelKind;
use sandtrace_core::codec::Marker;

/// Lifecycle of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Reports are expected.
    Open,
    /// A "no active processes" marker is in flight.
    Draining,
    /// "End of reports" was read back; nothing more will be read.
    Closed,
    /// The channel's resources were released.
    Disposed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
            Self::Disposed => write!(f, "disposed"),
        }
    }
}

/// State machine of one channel.
///
/// Transitions return the marker the caller must write, if any. The
/// machine itself performs no I/O.
#[derive(Debug)]
pub struct ChannelMachine {
    kind: ChannelKind,
    state: Mutex<ChannelState>,
}

impl ChannelMachine {
    /// Creates an open channel.
    #[must_use]
    pub const fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            state: Mutex::new(ChannelState::Open),
        }
    }

    /// Returns which channel this machine drives.
    #[must_use]
    pub const fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Returns the current state.
    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// The active set just became empty.
    ///
    /// Only an open channel starts draining, so concurrent notifications
    /// yield a single marker.
    pub fn on_set_empty(&self) -> Option<Marker> {
        let mut state = self.state.lock();
        if *state != ChannelState::Open {
            return None;
        }
        *state = ChannelState::Draining;
        tracing::debug!(channel = %self.kind, "draining");
        Some(Marker::NoActiveProcesses)
    }

    /// A marker was read back from the channel.
    ///
    /// `set_empty` is the state of the active set at the time of reading.
    pub fn on_marker(&self, marker: Marker, set_empty: bool) -> Option<Marker> {
        let mut state = self.state.lock();
        match (marker, *state) {
            (Marker::NoActiveProcesses, ChannelState::Draining) if set_empty => {
                tracing::debug!(channel = %self.kind, "drained, ending reports");
                Some(Marker::EndOfReports)
            }
            (Marker::NoActiveProcesses, ChannelState::Draining) => {
                tracing::debug!(channel = %self.kind, "process started while draining, reopening");
                *state = ChannelState::Open;
                None
            }
            (Marker::EndOfReports, ChannelState::Draining | ChannelState::Open) => {
                tracing::debug!(channel = %self.kind, "closed");
                *state = ChannelState::Closed;
                None
            }
            (marker, current) => {
                tracing::warn!(channel = %self.kind, ?marker, state = %current, "unexpected marker");
                None
            }
        }
    }

    /// Releases the channel. Terminal.
    pub fn dispose(&self) {
        *self.state.lock() = ChannelState::Disposed;
    }
}
