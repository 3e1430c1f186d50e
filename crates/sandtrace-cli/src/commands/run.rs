//! `sandtrace run` — Run a command under an observation session.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Args;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use sandtrace_common::config::SessionConfig;
use sandtrace_common::constants::{ENV_ROOT_PID, ROOT_PID_SELF};
use sandtrace_common::types::{AccessEvent, StepId};
use sandtrace_host::session::Session;
use sandtrace_observer::environment::child_environment;

use crate::output::{EVENT_HEADER, render_event};

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Command to run, with its arguments.
    #[arg(required = true, trailing_var_arg = true)]
    pub command: Vec<String>,

    /// Create the secondary channel for statically linked processes.
    #[arg(long)]
    pub trace: bool,

    /// Kill the process tree after this many seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Interposition library injected into every process of the tree.
    #[arg(long, env = "SANDTRACE_INTERPOSER_PATH")]
    pub interposer: Option<PathBuf>,

    /// Directory for the session's channels and manifest.
    #[arg(long)]
    pub channel_dir: Option<PathBuf>,

    /// Step identifier stamped on every report.
    #[arg(long, default_value_t = 1)]
    pub step: u64,
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Executes the `run` command.
///
/// Prints every delivered report until the process tree completes, then
/// exits with the command's exit code.
///
/// # Errors
///
/// Returns an error if the session cannot be set up, the command cannot be
/// started, or the session fails.
pub fn execute(args: RunArgs, json: bool) -> anyhow::Result<()> {
    let channel_dir = args.channel_dir.clone().unwrap_or_else(|| {
        std::env::temp_dir().join(format!("sandtrace-{}", std::process::id()))
    });
    let config = SessionConfig::new(&channel_dir, StepId::new(args.step)).with_trace(args.trace);

    if !json {
        println!("{EVENT_HEADER}");
    }
    let session = Session::start(config, move |event: AccessEvent| {
        match render_event(&event, json) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to render report"),
        }
    })
    .map_err(|e| anyhow::anyhow!("{e}"))?;
    let handle = session.handle();

    let manifest = handle.manifest();
    let manifest_path = handle.manifest_path();
    manifest
        .save(&manifest_path)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut bootstrap = handle.bootstrap_env(&manifest_path);
    bootstrap.interposer_path.clone_from(&args.interposer);
    let mut env = child_environment(&bootstrap, true, std::env::vars());
    env.push((ENV_ROOT_PID.to_string(), ROOT_PID_SELF.to_string()));

    let (program, program_args) = args
        .command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("no command given"))?;
    let mut child = tree_command(program, program_args)
        .env_clear()
        .envs(env)
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to start {program}: {e}"))?;
    handle.track_root(child.id());
    tracing::info!(pid = child.id(), command = %program, "command started");

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    let status = supervise(&mut child, args.timeout.map(Duration::from_secs), &interrupted)?;
    let summary = session.wait().map_err(|e| match e.reason() {
        Some(reason) => anyhow::anyhow!("observation failed ({reason}): {e}"),
        None => anyhow::anyhow!("{e}"),
    })?;
    tracing::info!(
        delivered = summary.delivered,
        status = %status,
        "process tree completed"
    );

    if args.channel_dir.is_none() {
        let _ = std::fs::remove_file(&manifest_path);
        let _ = std::fs::remove_dir(&channel_dir);
    }

    match status.code() {
        Some(0) => Ok(()),
        Some(code) => std::process::exit(code),
        None => Err(anyhow::anyhow!("command terminated by signal: {status}")),
    }
}

/// Builds the command for the root process, leading a new process group so
/// the whole tree can be signalled at once.
fn tree_command(program: &str, args: &[String]) -> Command {
    let mut command = Command::new(program);
    let _ = command.args(args).process_group(0);
    command
}

/// Waits for the root process, killing its process group on Ctrl+C or
/// timeout.
///
/// Killing the tree drives the session's normal exit and sweep path.
fn supervise(
    child: &mut Child,
    timeout: Option<Duration>,
    interrupted: &AtomicBool,
) -> anyhow::Result<ExitStatus> {
    let group = Pid::from_raw(i32::try_from(child.id())?);
    let started = Instant::now();
    let mut killed = false;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        let expired = timeout.is_some_and(|limit| started.elapsed() >= limit);
        if !killed && (expired || interrupted.load(Ordering::SeqCst)) {
            tracing::warn!(pgid = %group, expired, "stopping process tree");
            match killpg(group, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => anyhow::bail!("failed to kill process group {group}: {errno}"),
            }
            killed = true;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
