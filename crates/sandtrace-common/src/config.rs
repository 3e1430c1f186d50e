//! Configuration models: the bootstrap environment handed to every
//! monitored process, the per-step manifest, and the host session settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_SWEEP_INTERVAL_MS, ENV_FORCED_TRACE_PROCESSES, ENV_INTERPOSER_PATH, ENV_MANIFEST_PATH,
    ENV_ROOT_PID, ENV_TRACED_PATH, ENV_TRACED_PID, PRIMARY_CHANNEL_NAME,
    SECONDARY_CHANNEL_SUFFIX,
};
use crate::error::{Result, SandtraceError};
use crate::types::{RequestedAccess, StepId};

/// Process being driven by the tracer rather than by call interposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracedProcess {
    /// Pid of the traced process.
    pub pid: u32,
    /// Binary the traced process runs.
    pub path: PathBuf,
}

/// Environment consumed once when an interceptor initializes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapEnv {
    /// Path of the serialized manifest.
    pub manifest_path: PathBuf,
    /// Raw root pid; [`crate::constants::ROOT_PID_SELF`] means the current process.
    pub root_pid: Option<u32>,
    /// Program names that are always escalated to tracing.
    pub forced_trace_processes: Vec<String>,
    /// Set when this interceptor instance runs on behalf of the tracer.
    pub traced: Option<TracedProcess>,
    /// Interposition library propagated to descendants.
    pub interposer_path: Option<PathBuf>,
}

impl BootstrapEnv {
    /// Reads the bootstrap variables from the current process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest path is missing or a numeric
    /// variable is malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Reads the bootstrap variables from an explicit variable list.
    ///
    /// Empty values are treated as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest path is missing or a numeric
    /// variable is malformed.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut manifest_path = None;
        let mut root_pid = None;
        let mut forced = Vec::new();
        let mut traced_pid = None;
        let mut traced_path = None;
        let mut interposer_path = None;

        for (key, value) in vars {
            let value: String = value.into();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                ENV_MANIFEST_PATH => manifest_path = Some(PathBuf::from(value)),
                ENV_ROOT_PID => root_pid = Some(parse_pid(ENV_ROOT_PID, &value)?),
                ENV_FORCED_TRACE_PROCESSES => forced = parse_process_list(&value),
                ENV_TRACED_PID => traced_pid = Some(parse_pid(ENV_TRACED_PID, &value)?),
                ENV_TRACED_PATH => traced_path = Some(PathBuf::from(value)),
                ENV_INTERPOSER_PATH => interposer_path = Some(PathBuf::from(value)),
                _ => {}
            }
        }

        let manifest_path = manifest_path.ok_or_else(|| SandtraceError::Config {
            message: format!("{ENV_MANIFEST_PATH} is not set"),
        })?;

        let traced = match (traced_pid, traced_path) {
            (Some(pid), Some(path)) => Some(TracedProcess { pid, path }),
            (None, None) => None,
            _ => {
                return Err(SandtraceError::Config {
                    message: format!("{ENV_TRACED_PID} and {ENV_TRACED_PATH} must be set together"),
                });
            }
        };

        Ok(Self {
            manifest_path,
            root_pid,
            forced_trace_processes: forced,
            traced,
            interposer_path,
        })
    }

    /// Returns `true` when the interceptor runs on behalf of the tracer.
    #[must_use]
    pub const fn is_traced(&self) -> bool {
        self.traced.is_some()
    }

    /// Renders the variables for a child environment.
    #[must_use]
    pub fn to_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![(
            ENV_MANIFEST_PATH.to_string(),
            self.manifest_path.to_string_lossy().into_owned(),
        )];
        if let Some(pid) = self.root_pid {
            vars.push((ENV_ROOT_PID.to_string(), pid.to_string()));
        }
        if !self.forced_trace_processes.is_empty() {
            vars.push((
                ENV_FORCED_TRACE_PROCESSES.to_string(),
                self.forced_trace_processes.join(";"),
            ));
        }
        if let Some(path) = &self.interposer_path {
            vars.push((
                ENV_INTERPOSER_PATH.to_string(),
                path.to_string_lossy().into_owned(),
            ));
        }
        vars
    }
}

fn parse_pid(name: &str, value: &str) -> Result<u32> {
    value.trim().parse().map_err(|_| SandtraceError::Config {
        message: format!("{name} is not a process id: {value}"),
    })
}

fn parse_process_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Behavior switches carried by the manifest.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestFlags {
    /// Statically linked processes are escalated to tracing.
    pub trace_enabled: bool,
    /// Every process is escalated to tracing without inspection.
    pub trace_unconditionally: bool,
    /// In-band debug messages are sent through the channel.
    pub debug_logging: bool,
    /// Command lines of new processes are reported.
    pub report_command_lines: bool,
    /// Descendant processes inherit interception.
    pub monitor_child_processes: bool,
    /// Denied accesses are blocked rather than only reported.
    pub fail_unexpected_accesses: bool,
}

/// Access allowed beneath a path prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRule {
    /// Absolute path prefix the rule applies to.
    pub prefix: String,
    /// Access kinds allowed beneath the prefix.
    pub allow: RequestedAccess,
}

/// Per-step access manifest, read exactly once per process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Step the manifest belongs to.
    pub step_id: StepId,
    /// Path of the primary report channel.
    pub report_path: PathBuf,
    /// Behavior switches.
    #[serde(default)]
    pub flags: ManifestFlags,
    /// Path scopes; paths outside every scope are allowed.
    #[serde(default)]
    pub rules: Vec<ScopeRule>,
}

impl Manifest {
    /// Creates a manifest with default flags and no rules.
    #[must_use]
    pub fn new(step_id: StepId, report_path: impl Into<PathBuf>) -> Self {
        Self {
            step_id,
            report_path: report_path.into(),
            flags: ManifestFlags::default(),
            rules: Vec::new(),
        }
    }

    /// Reads and parses a manifest file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SandtraceError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let manifest: Self = serde_json::from_str(&content)?;
        Ok(manifest)
    }

    /// Writes the manifest as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| SandtraceError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Path of the secondary report channel.
    #[must_use]
    pub fn secondary_report_path(&self) -> PathBuf {
        secondary_path_for(&self.report_path)
    }
}

/// Derives the secondary channel path from the primary one.
#[must_use]
pub fn secondary_path_for(primary: &Path) -> PathBuf {
    let mut raw = primary.as_os_str().to_os_string();
    raw.push(SECONDARY_CHANNEL_SUFFIX);
    PathBuf::from(raw)
}

/// Host-side settings of one observation session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory holding the session's channels and manifest.
    pub channel_dir: PathBuf,
    /// Step being observed.
    pub step_id: StepId,
    /// Whether a secondary channel is created for trace escalation.
    pub trace_enabled: bool,
    /// Interval of the liveness sweep.
    pub sweep_interval: Duration,
}

impl SessionConfig {
    /// Creates a configuration with tracing disabled and the default sweep
    /// interval.
    #[must_use]
    pub fn new(channel_dir: impl Into<PathBuf>, step_id: StepId) -> Self {
        Self {
            channel_dir: channel_dir.into(),
            step_id,
            trace_enabled: false,
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
        }
    }

    /// Enables or disables the secondary channel.
    #[must_use]
    pub const fn with_trace(mut self, enabled: bool) -> Self {
        self.trace_enabled = enabled;
        self
    }

    /// Sets the liveness sweep interval.
    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Path of the primary channel.
    #[must_use]
    pub fn primary_channel_path(&self) -> PathBuf {
        self.channel_dir.join(PRIMARY_CHANNEL_NAME)
    }

    /// Path of the secondary channel.
    #[must_use]
    pub fn secondary_channel_path(&self) -> PathBuf {
        secondary_path_for(&self.primary_channel_path())
    }
}
