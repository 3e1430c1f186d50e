//! System-wide constants, environment variable names, and wire limits.

/// Largest write the kernel guarantees to be atomic on a pipe (`PIPE_BUF`
/// on Linux). Every frame, prefix included, must fit.
pub const ATOMIC_WRITE_LIMIT: usize = 4096;

/// Width in bytes of the length prefix of every frame.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Largest payload a frame can carry.
pub const MAX_PAYLOAD_LEN: usize = ATOMIC_WRITE_LIMIT - FRAME_PREFIX_LEN;

/// Length-field value of the "no active processes" marker.
pub const NO_ACTIVE_PROCESSES_MARKER: i32 = -21;

/// Length-field value of the "end of reports" marker.
pub const END_OF_REPORTS_MARKER: i32 = -22;

/// Suffix appended to the primary channel path to name the secondary one.
pub const SECONDARY_CHANNEL_SUFFIX: &str = "2";

/// File name of the primary channel inside a session directory.
pub const PRIMARY_CHANNEL_NAME: &str = "reports";

/// File name of the manifest written next to the channels.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Root-pid value meaning "the current process is the root".
pub const ROOT_PID_SELF: u32 = 1;

/// Replacement for `|` inside a path field.
pub const PIPE_SUBSTITUTE: char = '!';

/// Replacement for `\n` and `\r` inside a path field.
pub const NEWLINE_SUBSTITUTE: char = '.';

/// Longest path the canonicalizer will build before giving up.
pub const PATH_MAX: usize = 4096;

/// Number of descriptors tracked by the per-process fd table.
pub const FD_TABLE_SIZE: usize = 1024;

/// Path prefix of anonymous memory-backed files, which are never reported.
pub const ANONYMOUS_FILE_PREFIX: &str = "/memfd:";

/// Bounded wait for the access-closure lock before treating a lookup as a
/// miss.
pub const CLOSURE_LOCK_TIMEOUT_MS: u64 = 1;

/// Default interval of the host's liveness sweep.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;

/// Exit code used when the interceptor must abort the monitored process.
pub const FATAL_EXIT_CODE: i32 = 134;

/// Environment variable holding the manifest path.
pub const ENV_MANIFEST_PATH: &str = "SANDTRACE_MANIFEST_PATH";

/// Environment variable holding the root process id.
pub const ENV_ROOT_PID: &str = "SANDTRACE_ROOT_PID";

/// Environment variable holding the semicolon-separated forced-trace list.
pub const ENV_FORCED_TRACE_PROCESSES: &str = "SANDTRACE_FORCED_TRACE_PROCESSES";

/// Environment variable holding the pid of a traced process.
pub const ENV_TRACED_PID: &str = "SANDTRACE_TRACED_PID";

/// Environment variable holding the binary path of a traced process.
pub const ENV_TRACED_PATH: &str = "SANDTRACE_TRACED_PATH";

/// Environment variable holding the interposition library path.
pub const ENV_INTERPOSER_PATH: &str = "SANDTRACE_INTERPOSER_PATH";

/// Dynamic loader preload variable.
pub const LD_PRELOAD: &str = "LD_PRELOAD";

/// Application name used in CLI output.
pub const APP_NAME: &str = "sandtrace";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "sandtrace";
