//! Unified error types for the sandtrace workspace.
//!
//! Every error maps onto one of four handling categories. Transient and
//! degraded errors are recovered where they occur; fatal errors surface to
//! the scheduler with a [`FailureReason`] so a sandbox failure is never
//! mistaken for a failure of the build tool itself.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ChannelKind, FileOperation};

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum SandtraceError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// An encoded report does not fit in one atomic channel write.
    #[error("{operation} report of {size} bytes exceeds the atomic write limit of {max} bytes")]
    FrameTooLarge {
        /// Operation of the rejected report.
        operation: FileOperation,
        /// Encoded frame size.
        size: usize,
        /// Maximum frame size.
        max: usize,
    },

    /// A received frame could not be decoded.
    #[error("malformed report: {message}")]
    Decode {
        /// Description of the malformed content.
        message: String,
    },

    /// A report channel could not be created or opened.
    #[error("cannot open {channel} channel at {path}: {source}")]
    ChannelUnavailable {
        /// Channel that failed.
        channel: ChannelKind,
        /// Filesystem path of the channel.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A channel reached end-of-stream before its end-of-reports marker.
    #[error("{channel} channel closed before its end-of-reports marker")]
    PrematureEndOfStream {
        /// Channel that ended early.
        channel: ChannelKind,
    },

    /// A control marker could not be written because the channel is being
    /// torn down.
    #[error("{channel} channel marker {marker} skipped: {message}")]
    MarkerSkipped {
        /// Channel the marker was meant for.
        channel: ChannelKind,
        /// Length-field value of the marker.
        marker: i32,
        /// Why the write did not happen.
        message: String,
    },

    /// The trace-based interception process or its setup failed.
    #[error("tracer failure: {message}")]
    Tracer {
        /// Description of the tracer failure.
        message: String,
    },

    /// A path reference could not be turned into an absolute path.
    #[error("cannot resolve path: {path}")]
    Unresolvable {
        /// The unresolved reference.
        path: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

/// How an error must be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Logged; the operation continues.
    Transient,
    /// Fidelity is reduced but nothing is lost that matters; never escalated.
    Degraded,
    /// The access record is untrustworthy; the step fails.
    FatalToStep,
    /// Trace-based interception is broken; the step is killed.
    FatalToTracer,
}

/// Stable reason code reported to the scheduler for a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// A non-debug report could not be framed atomically.
    ReportTooLarge,
    /// A channel ended before its end-of-reports marker.
    PrematureEndOfStream,
    /// A channel could not be created or opened.
    ChannelUnavailable,
    /// A report could not be written.
    ReportWriteFailed,
    /// The bootstrap environment or manifest is invalid.
    InvalidConfiguration,
    /// The tracer failed.
    TracerFailure,
}

impl FailureReason {
    /// Returns the numeric code exposed to the scheduler.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::ReportTooLarge => 101,
            Self::PrematureEndOfStream => 102,
            Self::ChannelUnavailable => 103,
            Self::ReportWriteFailed => 104,
            Self::InvalidConfiguration => 105,
            Self::TracerFailure => 201,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReportTooLarge => "report-too-large",
            Self::PrematureEndOfStream => "premature-end-of-stream",
            Self::ChannelUnavailable => "channel-unavailable",
            Self::ReportWriteFailed => "report-write-failed",
            Self::InvalidConfiguration => "invalid-configuration",
            Self::TracerFailure => "tracer-failure",
        };
        write!(f, "{name} ({})", self.code())
    }
}

impl SandtraceError {
    /// Returns the handling category of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Decode { .. } | Self::Unresolvable { .. } => ErrorCategory::Transient,
            Self::MarkerSkipped { .. } => ErrorCategory::Degraded,
            Self::Tracer { .. } => ErrorCategory::FatalToTracer,
            Self::Io { .. }
            | Self::Config { .. }
            | Self::FrameTooLarge { .. }
            | Self::ChannelUnavailable { .. }
            | Self::PrematureEndOfStream { .. }
            | Self::Serialization { .. } => ErrorCategory::FatalToStep,
        }
    }

    /// Returns `true` if this error must fail the step.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::FatalToStep | ErrorCategory::FatalToTracer
        )
    }

    /// Returns the scheduler-facing reason code for fatal errors.
    #[must_use]
    pub const fn reason(&self) -> Option<FailureReason> {
        match self {
            Self::Decode { .. } | Self::Unresolvable { .. } | Self::MarkerSkipped { .. } => None,
            Self::FrameTooLarge { .. } => Some(FailureReason::ReportTooLarge),
            Self::PrematureEndOfStream { .. } => Some(FailureReason::PrematureEndOfStream),
            Self::ChannelUnavailable { .. } => Some(FailureReason::ChannelUnavailable),
            Self::Io { .. } => Some(FailureReason::ReportWriteFailed),
            Self::Config { .. } | Self::Serialization { .. } => {
                Some(FailureReason::InvalidConfiguration)
            }
            Self::Tracer { .. } => Some(FailureReason::TracerFailure),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SandtraceError>;
