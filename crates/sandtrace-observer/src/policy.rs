//! Manifest-driven access policy.

use sandtrace_common::config::ScopeRule;
use sandtrace_common::types::{FileAccessStatus, RequestedAccess};

/// Verdict returned to the interposition layer for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessCheck {
    /// Policy verdict of the access.
    pub status: FileAccessStatus,
    /// Whether a report was sent for the access.
    pub reported: bool,
    /// Whether the interposition layer must fail the call.
    pub should_block: bool,
}

impl AccessCheck {
    /// An allowed access that produced no report.
    #[must_use]
    pub const fn ignored() -> Self {
        Self {
            status: FileAccessStatus::Allowed,
            reported: false,
            should_block: false,
        }
    }
}

/// Path-prefix rules evaluated by longest match.
///
/// Paths outside every rule are allowed.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    rules: Vec<ScopeRule>,
}

impl AccessPolicy {
    /// Builds a policy from manifest rules.
    #[must_use]
    pub fn new(rules: &[ScopeRule]) -> Self {
        let mut rules = rules.to_vec();
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { rules }
    }

    /// Evaluates `access` on a canonical `path`.
    #[must_use]
    pub fn check(&self, path: &str, access: RequestedAccess) -> FileAccessStatus {
        if access.is_empty() {
            return FileAccessStatus::Allowed;
        }
        let Some(rule) = self.rules.iter().find(|r| covers(&r.prefix, path)) else {
            return FileAccessStatus::Allowed;
        };
        if rule.allow.closure().contains(access) {
            FileAccessStatus::Allowed
        } else {
            FileAccessStatus::Denied
        }
    }
}

/// `prefix` covers `path` when it equals it or is an ancestor directory.
fn covers(prefix: &str, path: &str) -> bool {
    let Some(rest) = path.strip_prefix(prefix) else {
        return false;
    };
    rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/')
}
