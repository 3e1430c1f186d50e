//! Identity and configuration of one monitored process.

use std::path::Path;

use sandtrace_common::config::{BootstrapEnv, Manifest};
use sandtrace_common::error::Result;
use sandtrace_core::fs_view::FileSystemView;

/// Everything an interceptor knows about the process it observes.
///
/// Built once, when interception starts, from the bootstrap environment
/// and the manifest it names.
#[derive(Debug, Clone)]
pub struct ObserverContext {
    /// Bootstrap variables the process was started with.
    pub bootstrap: BootstrapEnv,
    /// The step's manifest.
    pub manifest: Manifest,
    /// Pid reports are attributed to by default.
    pub pid: u32,
    /// Executable of the observed process.
    pub program_path: String,
    /// File name of [`Self::program_path`].
    pub program_name: String,
}

impl ObserverContext {
    /// Loads the manifest named by `bootstrap` and identifies the calling
    /// process.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read or parsed.
    pub fn load(bootstrap: BootstrapEnv, view: &dyn FileSystemView) -> Result<Self> {
        let manifest = Manifest::load(&bootstrap.manifest_path)?;
        let program_path = view.executable().unwrap_or_default();
        Ok(Self::new(bootstrap, manifest, std::process::id(), program_path))
    }

    /// Builds a context from already loaded parts.
    ///
    /// A traced instance is attributed to the traced process and its binary
    /// instead of the caller.
    #[must_use]
    pub fn new(
        bootstrap: BootstrapEnv,
        manifest: Manifest,
        current_pid: u32,
        program_path: impl Into<String>,
    ) -> Self {
        let (pid, program_path) = match &bootstrap.traced {
            Some(traced) => (traced.pid, traced.path.to_string_lossy().into_owned()),
            None => (current_pid, program_path.into()),
        };
        let program_name = Path::new(&program_path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        tracing::debug!(
            step = %manifest.step_id,
            pid,
            program = %program_path,
            traced = bootstrap.is_traced(),
            "observer context initialized"
        );
        Self {
            bootstrap,
            manifest,
            pid,
            program_path,
            program_name,
        }
    }

    /// Returns `true` if `program_name` must always run under the tracer.
    #[must_use]
    pub fn is_forced_trace(&self, program_name: &str) -> bool {
        self.manifest.flags.trace_unconditionally
            || self
                .bootstrap
                .forced_trace_processes
                .iter()
                .any(|name| name == program_name)
    }
}
