//! # sandtrace-observer
//!
//! The per-process side of sandtrace. An [`interceptor::Interceptor`] is
//! created once per monitored process from its bootstrap environment and
//! turns each raw intercepted operation into at most one access report:
//! - **Canonicalization** of every path, reporting traversed symlinks.
//! - **Deduplication** against the process's access closure.
//! - **Policy** evaluation against the manifest's scope rules.
//! - **Trace escalation** for statically linked executables, which call
//!   interposition cannot observe.
//!
//! The interposition layer that calls into this crate is external.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod context;
pub mod environment;
pub mod fd_table;
pub mod interceptor;
pub mod operation;
pub mod policy;
pub mod sink;
pub mod static_link;

use sandtrace_common::constants::FATAL_EXIT_CODE;
use sandtrace_common::error::SandtraceError;

/// Aborts the monitored process after an error that makes its access
/// record untrustworthy.
///
/// A process whose reports cannot be delivered must not be allowed to
/// finish as if it had been observed.
pub fn terminate(err: &SandtraceError) -> ! {
    tracing::error!(error = %err, reason = ?err.reason(), "fatal observation failure, aborting");
    eprintln!("sandtrace: {err}");
    std::process::exit(FATAL_EXIT_CODE)
}

/// Converts fatal interceptor errors into process termination.
pub trait OrTerminate<T> {
    /// Returns the success value, or terminates the process on a fatal
    /// error. Non-fatal errors are logged and yield `fallback`.
    fn or_terminate(self, fallback: T) -> T;
}

impl<T> OrTerminate<T> for sandtrace_common::error::Result<T> {
    fn or_terminate(self, fallback: T) -> T {
        match self {
            Ok(value) => value,
            Err(err) if err.is_fatal() => terminate(&err),
            Err(err) => {
                tracing::debug!(error = %err, "non-fatal observation error");
                fallback
            }
        }
    }
}
