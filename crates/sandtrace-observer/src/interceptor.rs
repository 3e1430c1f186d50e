//! The per-process interceptor.
//!
//! Every entry point takes the raw operation as the interposition layer
//! saw it, canonicalizes paths, evaluates policy, deduplicates against the
//! access closure and writes at most one report per path. Entry points
//! accept an optional `pid`: when the interceptor runs inside the tracer
//! it reports on behalf of a traced child, whose working directory and
//! descriptors live in another process.
//!
//! Errors returned from here are fatal to the monitored process (see
//! [`crate::OrTerminate`]); everything recoverable is logged and swallowed.

use std::path::Path;
use std::sync::Arc;

use sandtrace_common::config::BootstrapEnv;
use sandtrace_common::constants::ANONYMOUS_FILE_PREFIX;
use sandtrace_common::error::Result;
use sandtrace_common::types::{AccessEvent, FileAccessStatus, FileOperation, RequestedAccess};
use sandtrace_core::canonicalize::{BaseDir, Canonicalizer};
use sandtrace_core::closure::AccessClosure;
use sandtrace_core::codec;
use sandtrace_core::fs_view::{FileSystemView, ProcFs, is_directory, is_non_file};

use crate::context::ObserverContext;
use crate::environment;
use crate::fd_table::FdTable;
use crate::operation::{Classification, ObservedOperation};
use crate::policy::{AccessCheck, AccessPolicy};
use crate::sink::{FifoSink, ReportSink};
use crate::static_link::{
    BinaryInspector, ObjdumpInspector, StaticLinkDetector, grant_trace_permission,
};

/// Observes one process and reports its accesses.
pub struct Interceptor {
    context: ObserverContext,
    view: Arc<dyn FileSystemView>,
    sink: Box<dyn ReportSink>,
    closure: AccessClosure,
    fds: FdTable,
    policy: AccessPolicy,
    static_links: StaticLinkDetector,
}

impl Interceptor {
    /// Assembles an interceptor from its collaborators.
    #[must_use]
    pub fn new(
        context: ObserverContext,
        view: Arc<dyn FileSystemView>,
        sink: Box<dyn ReportSink>,
        inspector: Box<dyn BinaryInspector>,
    ) -> Self {
        let policy = AccessPolicy::new(&context.manifest.rules);
        Self {
            context,
            view,
            sink,
            closure: AccessClosure::new(),
            fds: FdTable::new(),
            policy,
            static_links: StaticLinkDetector::new(inspector),
        }
    }

    /// Initializes interception for the calling process from its
    /// environment, reporting to the step's FIFO channels.
    ///
    /// # Errors
    ///
    /// Returns an error if the bootstrap environment is incomplete or the
    /// manifest cannot be loaded.
    pub fn from_env() -> Result<Self> {
        let bootstrap = BootstrapEnv::from_env()?;
        let view: Arc<dyn FileSystemView> = Arc::new(ProcFs);
        let context = ObserverContext::load(bootstrap, view.as_ref())?;
        let sink = FifoSink::for_manifest(&context.manifest);
        Ok(Self::new(
            context,
            view,
            Box::new(sink),
            Box::new(ObjdumpInspector::locate()),
        ))
    }

    /// Returns the observed process's context.
    #[must_use]
    pub const fn context(&self) -> &ObserverContext {
        &self.context
    }

    /// Returns the access closure of this process.
    #[must_use]
    pub const fn closure(&self) -> &AccessClosure {
        &self.closure
    }

    // ---- process lifecycle -------------------------------------------------

    /// Reports that the observed process created `child_pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the report cannot be written.
    pub fn report_fork(&self, child_pid: u32) -> Result<()> {
        let event = self
            .event(FileOperation::ProcessStart, Some(child_pid))
            .with_path(&self.context.program_path);
        self.deliver(event, false).map(drop)
    }

    /// Reports that a process is exiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the report cannot be written.
    pub fn report_exit(&self, pid: Option<u32>) -> Result<()> {
        let event = self
            .event(FileOperation::ProcessExit, pid)
            .with_path(&self.context.program_path);
        self.deliver(event, false).map(drop)
    }

    /// Reports an exec of `file`, invoked as `program_name`.
    ///
    /// The name is reported as given, then the canonical executable. Returns
    /// `true` if the new image must run under the tracer.
    ///
    /// # Errors
    ///
    /// Returns an error if a report cannot be written or trace escalation
    /// fails.
    pub fn report_exec(&self, program_name: &str, file: &str, pid: Option<u32>) -> Result<bool> {
        let as_invoked = self
            .event(FileOperation::ProcessExec, pid)
            .with_path(program_name)
            .with_access(RequestedAccess::READ);
        let _ = self.deliver(as_invoked, false)?;

        let base = self.cwd_base(pid);
        let Some(executable) = self.canonicalize(file, &base, true, pid)? else {
            return Ok(false);
        };
        let resolved = self
            .event(FileOperation::ProcessExec, pid)
            .with_path(&executable)
            .with_access(RequestedAccess::READ)
            .with_status(self.policy.check(&executable, RequestedAccess::READ));
        let _ = self.deliver(resolved, false)?;

        let name = Path::new(&executable)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.check_static_link(&name, &executable, pid)
    }

    /// Reports the command line of a process, truncated to fit one frame.
    /// Nothing is sent unless the manifest asks for command lines.
    ///
    /// # Errors
    ///
    /// Returns an error if the report cannot be written.
    pub fn report_exec_args(&self, pid: Option<u32>) -> Result<()> {
        if !self.context.manifest.flags.report_command_lines {
            return Ok(());
        }
        let target = self.proc_pid(pid).unwrap_or(self.context.pid);
        let Some(args) = self.view.command_line(target) else {
            tracing::debug!(pid = target, "command line unavailable");
            return Ok(());
        };
        let event = codec::truncate_path_to_fit(
            self.event(FileOperation::ProcessCommandLine, pid)
                .with_path(args.join(" ")),
        );
        self.deliver(event, false).map(drop)
    }

    /// Escalates `path` to trace-based interception if it cannot be
    /// observed by interposition.
    ///
    /// Forced program names and the unconditional flag skip inspection;
    /// otherwise the binary's linkage decides. On escalation the caller
    /// becomes attachable and a statically-linked report is sent on the
    /// secondary channel. Returns `true` on escalation.
    ///
    /// # Errors
    ///
    /// Returns an error if trace permission cannot be granted or the report
    /// cannot be written.
    pub fn check_static_link(&self, program_name: &str, path: &str, pid: Option<u32>) -> Result<bool> {
        if !self.context.manifest.flags.trace_enabled || self.context.bootstrap.is_traced() {
            return Ok(false);
        }
        let escalate = if self.context.is_forced_trace(program_name) {
            true
        } else {
            let Some(mtime) = self.view.modified_secs(path) else {
                tracing::debug!(path, "executable not found, skipping linkage check");
                return Ok(false);
            };
            self.static_links.is_statically_linked(path, mtime)
        };
        if !escalate {
            return Ok(false);
        }

        grant_trace_permission()?;
        let event = self
            .event(FileOperation::StaticallyLinkedProcess, pid)
            .with_path(path);
        tracing::info!(pid = event.pid, path, "process requires tracing");
        let _ = self.deliver(event, false)?;
        Ok(true)
    }

    // ---- file accesses -----------------------------------------------------

    /// Reports an operation on a path relative to the working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a report cannot be written.
    pub fn report_access(
        &self,
        op: ObservedOperation,
        path: &str,
        error: i32,
        pid: Option<u32>,
    ) -> Result<AccessCheck> {
        let base = self.cwd_base(pid);
        self.report_path_access(op, path, &base, error, pid)
    }

    /// Reports an operation on a path relative to a directory descriptor,
    /// as the `*at` family does. `AT_FDCWD` means the working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a report cannot be written.
    pub fn report_access_at(
        &self,
        op: ObservedOperation,
        dirfd: i32,
        path: &str,
        error: i32,
        pid: Option<u32>,
    ) -> Result<AccessCheck> {
        let base = if path.starts_with('/') || dirfd == libc::AT_FDCWD {
            self.cwd_base(pid)
        } else if let Some(dir) = self.fd_path(dirfd, pid) {
            BaseDir::Directory(dir)
        } else {
            tracing::debug!(dirfd, path, "unknown directory descriptor, access not reported");
            return Ok(AccessCheck::ignored());
        };
        self.report_path_access(op, path, &base, error, pid)
    }

    /// Reports an operation on an open descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if a report cannot be written.
    pub fn report_access_fd(
        &self,
        op: ObservedOperation,
        fd: i32,
        error: i32,
        pid: Option<u32>,
    ) -> Result<AccessCheck> {
        if op == ObservedOperation::Close {
            self.on_fd_closed(fd);
        }
        let Some(class) = op.classify(true) else {
            return Ok(AccessCheck::ignored());
        };
        let Some(path) = self.fd_path(fd, pid) else {
            tracing::debug!(fd, "descriptor has no path, access not reported");
            return Ok(AccessCheck::ignored());
        };
        if !path.starts_with('/') {
            return Ok(AccessCheck::ignored());
        }
        let mode = self.view.fd_mode(fd, self.proc_pid(pid));
        self.report_classified(class, path, mode, error, pid)
    }

    /// Reports a two-path operation such as rename or link.
    ///
    /// The source and destination are delivered as two records and are
    /// never deduplicated.
    ///
    /// # Errors
    ///
    /// Returns an error if a report cannot be written.
    pub fn report_dual_access(
        &self,
        op: ObservedOperation,
        source: &str,
        destination: &str,
        error: i32,
        pid: Option<u32>,
    ) -> Result<AccessCheck> {
        let Some(class) = op.classify(true) else {
            return Ok(AccessCheck::ignored());
        };
        let base = self.cwd_base(pid);
        let Some(source) = self.canonicalize(source, &base, false, pid)? else {
            return Ok(AccessCheck::ignored());
        };
        let Some(destination) = self.canonicalize(destination, &base, false, pid)? else {
            return Ok(AccessCheck::ignored());
        };

        let denied = [&source, &destination]
            .iter()
            .any(|p| self.policy.check(p, class.access) == FileAccessStatus::Denied);
        let status = if denied {
            FileAccessStatus::Denied
        } else {
            FileAccessStatus::Allowed
        };
        let event = self
            .event(class.operation, pid)
            .with_path(source)
            .with_second_path(destination)
            .with_access(class.access)
            .with_status(status)
            .with_error(error);
        for record in event.into_records() {
            self.send(&record)?;
        }
        Ok(AccessCheck {
            status,
            reported: true,
            should_block: self.blocks(status),
        })
    }

    /// Reports every symlink along `path` without reporting the path.
    ///
    /// # Errors
    ///
    /// Returns an error if a report cannot be written.
    pub fn report_intermediate_symlinks(&self, path: &str, pid: Option<u32>) -> Result<()> {
        let base = self.cwd_base(pid);
        self.canonicalize(path, &base, false, pid).map(drop)
    }

    /// Reports the first write-permission check of `path`.
    ///
    /// The check is denied when a non-directory already exists at `path`:
    /// a step may only create outputs, not overwrite what it did not
    /// produce. Existing directories are allowed.
    ///
    /// # Errors
    ///
    /// Returns an error if a report cannot be written.
    pub fn report_first_allow_write_check(&self, path: &str, pid: Option<u32>) -> Result<AccessCheck> {
        let base = self.cwd_base(pid);
        let Some(path) = self.canonicalize(path, &base, true, pid)? else {
            return Ok(AccessCheck::ignored());
        };
        let mode = self.view.file_mode(&path);
        let directory = mode.is_some_and(is_directory);
        let status = if mode.is_some() && !directory {
            FileAccessStatus::Denied
        } else {
            FileAccessStatus::Allowed
        };
        let event = self
            .event(FileOperation::FirstAllowWriteCheck, pid)
            .with_path(path)
            .with_access(RequestedAccess::WRITE)
            .with_status(status)
            .with_directory(directory)
            .explicit();
        let _ = self.deliver(event, false)?;
        Ok(AccessCheck {
            status,
            reported: true,
            should_block: false,
        })
    }

    /// Sends an in-band debug message when the manifest enables them.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be written.
    pub fn log_debug(&self, message: &str) -> Result<()> {
        tracing::debug!(message, "sandbox debug message");
        if !self.context.manifest.flags.debug_logging {
            return Ok(());
        }
        let event = self.event(FileOperation::DebugMessage, None).with_path(message);
        self.send(&event)
    }

    /// Forgets a closed descriptor.
    pub fn on_fd_closed(&self, fd: i32) {
        self.fds.reset(fd);
    }

    /// Returns the environment a child of the observed process must get.
    #[must_use]
    pub fn child_environment<I>(&self, parent: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        environment::child_environment(
            &self.context.bootstrap,
            self.context.manifest.flags.monitor_child_processes,
            parent,
        )
    }

    // ---- internals -----------------------------------------------------------

    fn event(&self, operation: FileOperation, pid: Option<u32>) -> AccessEvent {
        AccessEvent::new(operation, pid.unwrap_or(self.context.pid))
            .with_process_name(&self.context.program_name)
    }

    /// Pid whose `/proc` entries apply; `None` for the calling process.
    fn proc_pid(&self, pid: Option<u32>) -> Option<u32> {
        pid.or_else(|| self.context.bootstrap.traced.as_ref().map(|t| t.pid))
    }

    fn cwd_base(&self, pid: Option<u32>) -> BaseDir {
        BaseDir::CurrentDir {
            pid: self.proc_pid(pid),
        }
    }

    fn blocks(&self, status: FileAccessStatus) -> bool {
        status == FileAccessStatus::Denied && self.context.manifest.flags.fail_unexpected_accesses
    }

    fn fd_path(&self, fd: i32, pid: Option<u32>) -> Option<String> {
        let proc_pid = self.proc_pid(pid);
        if proc_pid.is_none() {
            if let Some(path) = self.fds.get(fd) {
                return Some(path);
            }
        }
        let path = self.view.fd_path(fd, proc_pid)?;
        if proc_pid.is_none() {
            self.fds.set(fd, &path);
        }
        Some(path)
    }

    /// Canonicalizes `path`, reporting every symlink traversed on the way.
    ///
    /// `Ok(None)` means the path cannot be resolved and nothing should be
    /// reported.
    fn canonicalize(
        &self,
        path: &str,
        base: &BaseDir,
        follow_final: bool,
        pid: Option<u32>,
    ) -> Result<Option<String>> {
        let resolved = match Canonicalizer::new(self.view.as_ref()).canonicalize(path, base, follow_final) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::debug!(path, error = %e, "access not reported");
                return Ok(None);
            }
        };
        for link in resolved.traversed_links {
            let status = self.policy.check(&link, RequestedAccess::READ);
            let event = self
                .event(FileOperation::ReadLink, pid)
                .with_path(link)
                .with_access(RequestedAccess::READ)
                .with_status(status)
                .explicit();
            let _ = self.deliver(event, false)?;
        }
        Ok(Some(resolved.path))
    }

    fn report_path_access(
        &self,
        op: ObservedOperation,
        path: &str,
        base: &BaseDir,
        error: i32,
        pid: Option<u32>,
    ) -> Result<AccessCheck> {
        let Some(shape) = op.classify(true) else {
            return Ok(AccessCheck::ignored());
        };
        let Some(path) = self.canonicalize(path, base, shape.follow_final, pid)? else {
            return Ok(AccessCheck::ignored());
        };
        let mode = self.view.file_mode(&path);
        let Some(class) = op.classify(mode.is_some()) else {
            return Ok(AccessCheck::ignored());
        };
        self.report_classified(class, path, mode, error, pid)
    }

    fn report_classified(
        &self,
        class: Classification,
        path: String,
        mode: Option<u32>,
        error: i32,
        pid: Option<u32>,
    ) -> Result<AccessCheck> {
        if path.starts_with(ANONYMOUS_FILE_PREFIX) || mode.is_some_and(is_non_file) {
            return Ok(AccessCheck::ignored());
        }
        let status = self.policy.check(&path, class.access);
        let should_block = self.blocks(status);
        let event = self
            .event(class.operation, pid)
            .with_path(path)
            .with_access(class.access)
            .with_status(status)
            .with_error(error)
            .with_directory(mode.is_some_and(is_directory));
        let reported = self.deliver(event, !should_block)?;
        Ok(AccessCheck {
            status,
            reported,
            should_block,
        })
    }

    /// Sends `event` unless the closure shows it is redundant, then records
    /// it. Returns whether the event was sent.
    fn deliver(&self, event: AccessEvent, cacheable: bool) -> Result<bool> {
        let op = event.operation;
        let single_path_access = !op.is_lifecycle()
            && !event.is_dual_path()
            && op != FileOperation::DebugMessage
            && op != FileOperation::FirstAllowWriteCheck;
        let deduplicable = single_path_access
            && !event.explicit_report
            && matches!(
                op,
                FileOperation::Read
                    | FileOperation::Write
                    | FileOperation::Probe
                    | FileOperation::Enumerate
                    | FileOperation::ReadLink
            );

        if deduplicable && self.closure.covers(&event.path, event.requested_access) {
            tracing::trace!(path = %event.path, access = %event.requested_access, "redundant access suppressed");
            return Ok(false);
        }
        self.send(&event)?;
        if single_path_access && (cacheable || event.explicit_report) {
            let _ = self.closure.record(&event.path, event.requested_access);
        }
        Ok(true)
    }

    fn send(&self, event: &AccessEvent) -> Result<()> {
        let frame = codec::encode(event).inspect_err(|e| {
            tracing::error!(error = %e, operation = %event.operation, "report cannot be framed");
        })?;
        if let Some(fd) = self.sink.send(event.operation.channel(), &frame)? {
            self.fds.reset(fd);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sandtrace_common::config::{Manifest, ScopeRule};
    use sandtrace_common::error::SandtraceError;
    use sandtrace_common::types::{ChannelKind, StepId};

    use super::*;
    use crate::sink::testing::MemorySink;

    const REG: u32 = libc::S_IFREG | 0o644;
    const DIR: u32 = libc::S_IFDIR | 0o755;

    #[derive(Default)]
    struct FakeFs {
        links: HashMap<String, String>,
        modes: HashMap<String, u32>,
        fds: HashMap<i32, (String, u32)>,
        mtimes: HashMap<String, i64>,
        cwd: Option<String>,
        cmdline: Vec<String>,
    }

    impl FakeFs {
        fn new() -> Self {
            Self {
                cwd: Some("/work".into()),
                ..Self::default()
            }
        }
        fn link(mut self, from: &str, to: &str) -> Self {
            let _ = self.links.insert(from.into(), to.into());
            self
        }
        fn file(mut self, path: &str, mode: u32) -> Self {
            let _ = self.modes.insert(path.into(), mode);
            let _ = self.mtimes.insert(path.into(), 1000);
            self
        }
        fn fd(mut self, fd: i32, path: &str, mode: u32) -> Self {
            let _ = self.fds.insert(fd, (path.into(), mode));
            self
        }
    }

    impl FileSystemView for FakeFs {
        fn read_link(&self, path: &str) -> Option<String> {
            self.links.get(path).cloned()
        }
        fn current_dir(&self, _pid: Option<u32>) -> Option<String> {
            self.cwd.clone()
        }
        fn fd_path(&self, fd: i32, _pid: Option<u32>) -> Option<String> {
            self.fds.get(&fd).map(|(p, _)| p.clone())
        }
        fn file_mode(&self, path: &str) -> Option<u32> {
            self.modes.get(path).copied()
        }
        fn fd_mode(&self, fd: i32, _pid: Option<u32>) -> Option<u32> {
            self.fds.get(&fd).map(|(_, m)| *m)
        }
        fn modified_secs(&self, path: &str) -> Option<i64> {
            self.mtimes.get(path).copied()
        }
        fn command_line(&self, _pid: u32) -> Option<Vec<String>> {
            Some(self.cmdline.clone())
        }
        fn executable(&self) -> Option<String> {
            Some("/usr/bin/make".into())
        }
    }

    struct FixedInspector {
        is_static: bool,
        calls: Arc<AtomicUsize>,
    }

    impl BinaryInspector for FixedInspector {
        fn is_statically_linked(&self, _path: &Path) -> Result<bool> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.is_static)
        }
    }

    struct Harness {
        interceptor: Interceptor,
        sink: Arc<MemorySink>,
        inspections: Arc<AtomicUsize>,
    }

    struct SharedSink(Arc<MemorySink>);

    impl ReportSink for SharedSink {
        fn send(&self, channel: ChannelKind, frame: &[u8]) -> Result<Option<i32>> {
            self.0.send(channel, frame)
        }
    }

    fn harness_with(fs: FakeFs, manifest: Manifest, is_static: bool) -> Harness {
        let bootstrap = BootstrapEnv {
            manifest_path: PathBuf::from("/run/st/manifest.json"),
            root_pid: Some(1),
            forced_trace_processes: vec!["go".into()],
            traced: None,
            interposer_path: None,
        };
        let context = ObserverContext::new(bootstrap, manifest, 100, "/usr/bin/make");
        let sink = Arc::new(MemorySink::default());
        let inspections = Arc::new(AtomicUsize::new(0));
        let interceptor = Interceptor::new(
            context,
            Arc::new(fs),
            Box::new(SharedSink(Arc::clone(&sink))),
            Box::new(FixedInspector {
                is_static,
                calls: Arc::clone(&inspections),
            }),
        );
        Harness {
            interceptor,
            sink,
            inspections,
        }
    }

    fn manifest() -> Manifest {
        Manifest::new(StepId::new(9), "/run/st/reports")
    }

    fn harness(fs: FakeFs) -> Harness {
        harness_with(fs, manifest(), false)
    }

    fn ops(sink: &MemorySink) -> Vec<(FileOperation, String)> {
        sink.events()
            .into_iter()
            .map(|e| (e.operation, e.path))
            .collect()
    }

    #[test]
    fn probe_read_probe_delivers_first_probe_and_read() {
        let h = harness(FakeFs::new().file("/src/a.c", REG));
        let i = &h.interceptor;
        let _ = i.report_access(ObservedOperation::Stat, "/src/a.c", 0, None).unwrap();
        let _ = i
            .report_access(ObservedOperation::Open { flags: libc::O_RDONLY }, "/src/a.c", 0, None)
            .unwrap();
        let third = i.report_access(ObservedOperation::Access, "/src/a.c", 0, None).unwrap();

        assert!(!third.reported);
        assert_eq!(
            ops(&h.sink),
            vec![
                (FileOperation::Probe, "/src/a.c".to_owned()),
                (FileOperation::Read, "/src/a.c".to_owned()),
            ]
        );
    }

    #[test]
    fn write_makes_later_reads_and_probes_redundant() {
        let h = harness(FakeFs::new().file("/out/a.o", REG));
        let i = &h.interceptor;
        let _ = i.report_access(ObservedOperation::Truncate, "/out/a.o", 0, None).unwrap();
        let read = i
            .report_access(ObservedOperation::Open { flags: libc::O_RDONLY }, "/out/a.o", 0, None)
            .unwrap();
        let probe = i.report_access(ObservedOperation::Stat, "/out/a.o", 0, None).unwrap();

        assert!(!read.reported);
        assert!(!probe.reported);
        let recorded = i.closure().recorded("/out/a.o").unwrap();
        assert!(recorded.contains(RequestedAccess::READ | RequestedAccess::PROBE));
    }

    #[test]
    fn lifecycle_events_are_never_deduplicated() {
        let h = harness(FakeFs::new());
        let i = &h.interceptor;
        i.report_fork(200).unwrap();
        i.report_fork(200).unwrap();
        i.report_exit(Some(200)).unwrap();
        i.report_exit(Some(200)).unwrap();

        let events = h.sink.events();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].operation, FileOperation::ProcessStart);
        assert_eq!(events[0].pid, 200);
        assert_eq!(events[0].process_name, "make");
        assert_eq!(events[3].operation, FileOperation::ProcessExit);
    }

    #[test]
    fn deletes_are_reported_even_after_writes() {
        let h = harness(FakeFs::new().file("/out/tmp", REG));
        let i = &h.interceptor;
        let _ = i.report_access(ObservedOperation::Write, "/out/tmp", 0, None).unwrap();
        let delete = i.report_access(ObservedOperation::Unlink, "/out/tmp", 0, None).unwrap();
        assert!(delete.reported);
    }

    #[test]
    fn rename_is_split_and_never_deduplicated() {
        let h = harness(FakeFs::new());
        let i = &h.interceptor;
        for _ in 0..2 {
            let check = i
                .report_dual_access(ObservedOperation::Rename, "a.tmp", "/out/a", 0, None)
                .unwrap();
            assert!(check.reported);
        }
        assert_eq!(
            ops(&h.sink),
            vec![
                (FileOperation::Rename, "/work/a.tmp".to_owned()),
                (FileOperation::Rename, "/out/a".to_owned()),
                (FileOperation::Rename, "/work/a.tmp".to_owned()),
                (FileOperation::Rename, "/out/a".to_owned()),
            ]
        );
    }

    #[test]
    fn each_traversed_symlink_is_reported_before_the_access() {
        let fs = FakeFs::new()
            .link("/lib", "/usr/lib")
            .link("/usr/lib/libz.so", "libz.so.1")
            .file("/usr/lib/libz.so.1", REG);
        let h = harness(fs);
        let _ = h
            .interceptor
            .report_access(ObservedOperation::Open { flags: libc::O_RDONLY }, "/lib/libz.so", 0, None)
            .unwrap();
        assert_eq!(
            ops(&h.sink),
            vec![
                (FileOperation::ReadLink, "/lib".to_owned()),
                (FileOperation::ReadLink, "/usr/lib/libz.so".to_owned()),
                (FileOperation::Read, "/usr/lib/libz.so.1".to_owned()),
            ]
        );
    }

    #[test]
    fn traversed_symlinks_are_reported_every_time() {
        let fs = FakeFs::new().link("/lib", "/usr/lib").file("/usr/lib/a", REG);
        let h = harness(fs);
        for _ in 0..2 {
            let _ = h
                .interceptor
                .report_access(ObservedOperation::Stat, "/lib/a", 0, None)
                .unwrap();
        }
        let links = h
            .sink
            .events()
            .into_iter()
            .filter(|e| e.operation == FileOperation::ReadLink)
            .count();
        assert_eq!(links, 2);
    }

    #[test]
    fn unresolvable_path_produces_no_event() {
        let fs = FakeFs {
            cwd: None,
            ..FakeFs::default()
        };
        let h = harness(fs);
        let check = h
            .interceptor
            .report_access(ObservedOperation::Stat, "relative", 0, None)
            .unwrap();
        assert!(!check.reported);
        assert!(h.sink.events().is_empty());
    }

    #[test]
    fn pipes_and_anonymous_files_are_not_reported() {
        let fs = FakeFs::new()
            .fd(3, "pipe:[1234]", libc::S_IFIFO | 0o600)
            .fd(4, "/memfd:jit", REG)
            .fd(5, "/run/sock", libc::S_IFSOCK | 0o600);
        let h = harness(fs);
        for fd in [3, 4, 5] {
            let _ = h
                .interceptor
                .report_access_fd(ObservedOperation::Write, fd, 0, None)
                .unwrap();
        }
        assert!(h.sink.events().is_empty());
    }

    #[test]
    fn descriptor_path_is_cached_until_close() {
        let fs = FakeFs::new().fd(7, "/src/b.c", REG);
        let h = harness(fs);
        let i = &h.interceptor;
        let _ = i.report_access_fd(ObservedOperation::Stat, 7, 0, None).unwrap();
        assert_eq!(i.fds.get(7).as_deref(), Some("/src/b.c"));
        let _ = i.report_access_fd(ObservedOperation::Close, 7, 0, None).unwrap();
        assert_eq!(i.fds.get(7), None);
        assert_eq!(ops(&h.sink), vec![(FileOperation::Probe, "/src/b.c".to_owned())]);
    }

    #[test]
    fn directory_descriptor_anchors_relative_paths() {
        let fs = FakeFs::new().fd(9, "/src", DIR).file("/src/inc", DIR);
        let h = harness(fs);
        let check = h
            .interceptor
            .report_access_at(ObservedOperation::ReadDirectory, 9, "inc", 0, None)
            .unwrap();
        assert!(check.reported);
        let event = &h.sink.events()[0];
        assert_eq!(event.path, "/src/inc");
        assert!(event.is_directory);
        assert_eq!(event.operation, FileOperation::Enumerate);
    }

    #[test]
    fn at_fdcwd_uses_working_directory() {
        let h = harness(FakeFs::new());
        let _ = h
            .interceptor
            .report_access_at(ObservedOperation::Stat, libc::AT_FDCWD, "x", 0, None)
            .unwrap();
        assert_eq!(h.sink.events()[0].path, "/work/x");
    }

    #[test]
    fn denied_access_is_blocked_and_not_cached() {
        let mut manifest = manifest();
        manifest.flags.fail_unexpected_accesses = true;
        manifest.rules.push(ScopeRule {
            prefix: "/src".into(),
            allow: RequestedAccess::READ,
        });
        let h = harness_with(FakeFs::new().file("/src/a.c", REG), manifest, false);
        for _ in 0..2 {
            let check = h
                .interceptor
                .report_access(ObservedOperation::Write, "/src/a.c", 0, None)
                .unwrap();
            assert_eq!(check.status, FileAccessStatus::Denied);
            assert!(check.should_block);
            assert!(check.reported);
        }
        assert_eq!(h.interceptor.closure().recorded("/src/a.c"), None);
    }

    #[test]
    fn oversize_access_report_is_fatal() {
        let long = format!("/{}", "d".repeat(5000));
        let h = harness(FakeFs::new());
        let err = h
            .interceptor
            .report_access(ObservedOperation::Stat, &long, 0, None)
            .unwrap_err();
        assert!(matches!(err, SandtraceError::FrameTooLarge { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn exec_reports_invoked_name_then_executable() {
        let fs = FakeFs::new().link("/bin/cc", "gcc").file("/bin/gcc", REG);
        let h = harness(fs);
        let escalate = h.interceptor.report_exec("cc", "/bin/cc", None).unwrap();
        assert!(!escalate);
        assert_eq!(
            ops(&h.sink),
            vec![
                (FileOperation::ProcessExec, "cc".to_owned()),
                (FileOperation::ReadLink, "/bin/cc".to_owned()),
                (FileOperation::ProcessExec, "/bin/gcc".to_owned()),
            ]
        );
        assert_eq!(h.inspections.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn static_executable_escalates_on_secondary_channel() {
        let mut manifest = manifest();
        manifest.flags.trace_enabled = true;
        let h = harness_with(FakeFs::new().file("/opt/tool", REG), manifest, true);

        assert!(h.interceptor.report_exec("tool", "/opt/tool", None).unwrap());
        let secondary = h.sink.on(ChannelKind::Secondary);
        assert_eq!(secondary.len(), 1);
        assert_eq!(secondary[0].operation, FileOperation::StaticallyLinkedProcess);
        assert_eq!(secondary[0].path, "/opt/tool");

        assert!(h.interceptor.check_static_link("tool", "/opt/tool", None).unwrap());
        assert_eq!(h.inspections.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn escalation_precedes_accesses_of_the_new_image() {
        let mut manifest = manifest();
        manifest.flags.trace_enabled = true;
        let fs = FakeFs::new().file("/opt/tool", REG).file("/src/a.c", REG);
        let h = harness_with(fs, manifest, true);

        assert!(h.interceptor.report_exec("tool", "/opt/tool", None).unwrap());
        let _ = h
            .interceptor
            .report_access(ObservedOperation::Open { flags: libc::O_RDONLY }, "/src/a.c", 0, None)
            .unwrap();

        let frames = h.sink.frames.lock();
        let escalated_at = frames
            .iter()
            .position(|(channel, e)| {
                *channel == ChannelKind::Secondary
                    && e.operation == FileOperation::StaticallyLinkedProcess
            })
            .unwrap();
        let read_at = frames
            .iter()
            .position(|(_, e)| e.operation == FileOperation::Read)
            .unwrap();
        assert!(escalated_at < read_at);
    }

    #[test]
    fn dynamic_executable_is_not_escalated() {
        let mut manifest = manifest();
        manifest.flags.trace_enabled = true;
        let h = harness_with(FakeFs::new().file("/bin/sh", REG), manifest, false);
        assert!(!h.interceptor.report_exec("sh", "/bin/sh", None).unwrap());
        assert!(h.sink.on(ChannelKind::Secondary).is_empty());
    }

    #[test]
    fn forced_program_skips_inspection() {
        let mut manifest = manifest();
        manifest.flags.trace_enabled = true;
        let h = harness_with(FakeFs::new().file("/usr/bin/go", REG), manifest, false);
        assert!(h.interceptor.check_static_link("go", "/usr/bin/go", None).unwrap());
        assert_eq!(h.inspections.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn command_line_is_truncated_to_one_frame() {
        let fs = FakeFs {
            cmdline: vec!["cc".into(), "-c".into(), "x".repeat(8000)],
            ..FakeFs::new()
        };
        let mut manifest = manifest();
        manifest.flags.report_command_lines = true;
        let h = harness_with(fs, manifest, false);
        h.interceptor.report_exec_args(None).unwrap();
        let events = h.sink.events();
        assert_eq!(events[0].operation, FileOperation::ProcessCommandLine);
        assert!(events[0].path.starts_with("cc -c xxx"));
        assert!(events[0].path.len() < 4096);
    }

    #[test]
    fn command_line_is_not_reported_unless_requested() {
        let fs = FakeFs {
            cmdline: vec!["cc".into(), "-c".into(), "a.c".into()],
            ..FakeFs::new()
        };
        let h = harness(fs);
        h.interceptor.report_exec_args(None).unwrap();
        h.interceptor.report_exec_args(Some(4321)).unwrap();
        assert!(h.sink.events().is_empty());
    }

    #[test]
    fn first_write_check_allows_existing_directories() {
        let h = harness(FakeFs::new().file("/out/dir", DIR));
        let check = h
            .interceptor
            .report_first_allow_write_check("/out/dir", None)
            .unwrap();
        assert_eq!(check.status, FileAccessStatus::Allowed);
        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, FileOperation::FirstAllowWriteCheck);
        assert_eq!(events[0].status, FileAccessStatus::Allowed);
        assert!(events[0].is_directory);
    }

    #[test]
    fn first_write_check_is_denied_for_existing_files() {
        let h = harness(FakeFs::new().file("/out/existing", REG));
        let existing = h
            .interceptor
            .report_first_allow_write_check("/out/existing", None)
            .unwrap();
        let fresh = h
            .interceptor
            .report_first_allow_write_check("/out/new", None)
            .unwrap();
        assert_eq!(existing.status, FileAccessStatus::Denied);
        assert_eq!(fresh.status, FileAccessStatus::Allowed);
        let events = h.sink.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| !e.is_directory));
    }

    #[test]
    fn intermediate_symlinks_reported_without_target() {
        let fs = FakeFs::new().link("/a", "/b").link("/b/c", "/d");
        let h = harness(fs);
        h.interceptor.report_intermediate_symlinks("/a/c", None).unwrap();
        assert_eq!(
            ops(&h.sink),
            vec![(FileOperation::ReadLink, "/a".to_owned())]
        );
    }

    #[test]
    fn debug_messages_require_flag() {
        let h = harness(FakeFs::new());
        h.interceptor.log_debug("hello").unwrap();
        assert!(h.sink.events().is_empty());

        let mut manifest = manifest();
        manifest.flags.debug_logging = true;
        let h = harness_with(FakeFs::new(), manifest, false);
        h.interceptor.log_debug("a|b\nc").unwrap();
        assert_eq!(h.sink.events()[0].path, "a!b.c");
    }

    #[test]
    fn traced_child_accesses_carry_its_pid() {
        let h = harness(FakeFs::new().file("/x", REG));
        let _ = h
            .interceptor
            .report_access(ObservedOperation::Stat, "/x", 0, Some(4321))
            .unwrap();
        assert_eq!(h.sink.events()[0].pid, 4321);
    }

    #[test]
    fn child_environment_follows_monitor_flag() {
        let mut manifest = manifest();
        manifest.flags.monitor_child_processes = true;
        let h = harness_with(FakeFs::new(), manifest, false);
        let env = h.interceptor.child_environment(vec![]);
        assert!(env.iter().any(|(k, _)| k == sandtrace_common::constants::ENV_MANIFEST_PATH));
    }
}
