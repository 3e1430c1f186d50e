//! Formatted output helpers for CLI commands.
//!
//! One line per report: a fixed-width table row for humans, or one JSON
//! object per line with `--json`.

use sandtrace_common::types::AccessEvent;

/// Column header matching [`format_event`].
pub const EVENT_HEADER: &str = "    PID  OPERATION                  STATUS         ACCESS           PATH";

/// Formats a report as a table row.
#[must_use]
pub fn format_event(event: &AccessEvent) -> String {
    let mut line = format!(
        "{:>7}  {:<26} {:<14} {:<16} {}",
        event.pid,
        event.operation.to_string(),
        event.status.to_string(),
        event.requested_access.to_string(),
        event.path
    );
    if !event.second_path.is_empty() {
        line.push_str(" -> ");
        line.push_str(&event.second_path);
    }
    if event.is_directory {
        line.push_str(" [dir]");
    }
    if event.error != 0 {
        line.push_str(&format!(" (errno {})", event.error));
    }
    line
}

/// Renders a report for printing.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn render_event(event: &AccessEvent, json: bool) -> anyhow::Result<String> {
    if json {
        Ok(serde_json::to_string(event)?)
    } else {
        Ok(format_event(event))
    }
}
