//! One build step's observation session.
//!
//! A session owns the step's report channels. Each channel gets a reading
//! thread that decodes frames, keeps the active process set current and
//! answers its own control markers; decoded reports flow through a single
//! queue to one consumer thread, so reports of a channel are delivered in
//! arrival order. When every channel has closed, the consumer receives one
//! synthetic "process tree completed" report and the session ends.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

use sandtrace_common::config::{BootstrapEnv, Manifest, SessionConfig};
use sandtrace_common::constants::{MANIFEST_FILE_NAME, ROOT_PID_SELF};
use sandtrace_common::error::{Result, SandtraceError};
use sandtrace_common::types::{AccessEvent, ChannelKind, FileOperation, StepId};
use sandtrace_core::codec::{self, Frame, Marker};
use sandtrace_core::transport::{ChannelReader, HeldWriter, create_channel, remove_channel};

use crate::active_set::ActiveProcessSet;
use crate::channel_state::{ChannelMachine, ChannelState};
use crate::consumer::AccessReportConsumer;
use crate::liveness::{ProcessProbe, Sweeper, SystemProbe};

/// What the reading threads hand to the consumer thread.
enum Delivery {
    Report(AccessEvent),
    Ended(ChannelKind),
    Failed(ChannelKind, SandtraceError),
}

struct ChannelSlot {
    machine: ChannelMachine,
    writer: HeldWriter,
    path: PathBuf,
}

impl ChannelSlot {
    fn new(kind: ChannelKind, writer: HeldWriter, path: PathBuf) -> Self {
        Self {
            machine: ChannelMachine::new(kind),
            writer,
            path,
        }
    }
}

/// State shared by the reading threads, the sweep and the handles.
struct Shared {
    config: SessionConfig,
    active: Arc<ActiveProcessSet>,
    root_pid: AtomicU32,
    primary: ChannelSlot,
    secondary: Option<ChannelSlot>,
    aborted: AtomicBool,
}

impl Shared {
    fn slot(&self, kind: ChannelKind) -> Option<&ChannelSlot> {
        match kind {
            ChannelKind::Primary => Some(&self.primary),
            ChannelKind::Secondary => self.secondary.as_ref(),
        }
    }

    fn slots(&self) -> impl Iterator<Item = &ChannelSlot> {
        std::iter::once(&self.primary).chain(self.secondary.as_ref())
    }

    fn stamp(&self, event: AccessEvent) -> AccessEvent {
        event.with_step(self.config.step_id, self.root_pid.load(Ordering::Acquire))
    }

    /// Updates the active set from a lifecycle report.
    fn observe(&self, event: &AccessEvent) {
        match event.operation {
            FileOperation::ProcessStart | FileOperation::ProcessExec => {
                if self.active.add(event.pid) {
                    tracing::trace!(pid = event.pid, "process tracked");
                }
            }
            FileOperation::ProcessExit => {
                if self.active.remove(event.pid) {
                    self.on_set_empty();
                }
            }
            _ => {}
        }
    }

    /// The active set just became empty: start draining the primary
    /// channel.
    fn on_set_empty(&self) {
        if let Some(marker) = self.primary.machine.on_set_empty() {
            send_marker(&self.primary.writer, marker);
        }
    }

    /// Feeds a marker read from `kind` to its machine and returns the
    /// resulting state.
    fn on_marker(&self, kind: ChannelKind, marker: Marker) -> ChannelState {
        let Some(slot) = self.slot(kind) else {
            return ChannelState::Closed;
        };
        if let Some(reply) = slot.machine.on_marker(marker, self.active.is_empty()) {
            send_marker(&slot.writer, reply);
        }
        let state = slot.machine.state();
        if state == ChannelState::Closed && kind == ChannelKind::Primary {
            if let Some(secondary) = &self.secondary {
                if let Some(marker) = secondary.machine.on_set_empty() {
                    send_marker(&secondary.writer, marker);
                }
            }
        }
        state
    }

    /// Ends every channel after a fatal failure so the other reading
    /// threads see end-of-stream.
    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        for slot in self.slots() {
            slot.writer.close();
        }
    }

    fn dispose(&self) {
        for slot in self.slots() {
            slot.writer.close();
            slot.machine.dispose();
            if let Err(e) = remove_channel(&slot.path) {
                tracing::warn!(error = %e, "failed to remove channel");
            }
        }
    }
}

/// Writes a marker; a channel being torn down only degrades the session.
fn send_marker(writer: &HeldWriter, marker: Marker) {
    if let Err(e) = writer.send_marker(marker) {
        tracing::debug!(error = %e, category = ?e.category(), "marker skipped");
    }
}

/// Reads frames of one channel until it closes.
///
/// End-of-stream before the channel closed is fatal unless the session was
/// aborted by another channel's failure.
fn pump(
    kind: ChannelKind,
    shared: &Shared,
    tx: &Sender<Delivery>,
    mut next: impl FnMut() -> Result<Option<Frame>>,
) -> Result<()> {
    loop {
        match next()? {
            Some(Frame::Report(payload)) => match codec::decode(&payload) {
                Ok(event) => {
                    let event = shared.stamp(event);
                    tracing::trace!(channel = %kind, op = ?event.operation, pid = event.pid, path = %event.path, "report");
                    let lifecycle = event.operation.is_lifecycle();
                    if lifecycle {
                        let _ = tx.send(Delivery::Report(event.clone()));
                        shared.observe(&event);
                    } else {
                        let _ = tx.send(Delivery::Report(event));
                    }
                }
                Err(e) => tracing::warn!(channel = %kind, error = %e, "undecodable report skipped"),
            },
            Some(Frame::Marker(marker)) => {
                if shared.on_marker(kind, marker) == ChannelState::Closed {
                    return Ok(());
                }
            }
            None if shared.aborted.load(Ordering::SeqCst) => return Ok(()),
            None => return Err(SandtraceError::PrematureEndOfStream { channel: kind }),
        }
    }
}

fn spawn_reader(
    mut reader: ChannelReader,
    shared: Arc<Shared>,
    tx: Sender<Delivery>,
) -> Result<JoinHandle<ChannelReader>> {
    let kind = reader.kind();
    let path = reader.path().to_path_buf();
    std::thread::Builder::new()
        .name(format!("sandtrace-{kind}"))
        .spawn(move || {
            match pump(kind, &shared, &tx, || reader.recv()) {
                Ok(()) => {
                    tracing::debug!(channel = %kind, "channel finished");
                    let _ = tx.send(Delivery::Ended(kind));
                }
                Err(e) => {
                    tracing::error!(channel = %kind, error = %e, "channel failed");
                    shared.abort();
                    let _ = tx.send(Delivery::Failed(kind, e));
                }
            }
            reader
        })
        .map_err(|source| SandtraceError::Io { path, source })
}

/// Outcome of the consumer thread.
struct ConsumerOutcome {
    delivered: usize,
    failure: Option<SandtraceError>,
}

fn consume(
    mut consumer: impl AccessReportConsumer,
    rx: &Receiver<Delivery>,
    channels: usize,
    shared: &Shared,
) -> ConsumerOutcome {
    let mut outcome = ConsumerOutcome {
        delivered: 0,
        failure: None,
    };
    let mut ended = 0;
    while ended < channels {
        let Ok(delivery) = rx.recv() else {
            break;
        };
        match delivery {
            Delivery::Report(event) => {
                consumer.on_access(event);
                outcome.delivered += 1;
            }
            Delivery::Ended(_) => ended += 1,
            Delivery::Failed(kind, err) => {
                ended += 1;
                consumer.on_failure(&err);
                tracing::debug!(channel = %kind, "failure delivered");
                if outcome.failure.is_none() {
                    outcome.failure = Some(err);
                }
            }
        }
    }

    if ended == channels && outcome.failure.is_none() {
        let root = shared.root_pid.load(Ordering::Acquire);
        let completed = shared.stamp(AccessEvent::new(FileOperation::ProcessTreeCompleted, root));
        consumer.on_access(completed);
        outcome.delivered += 1;
        tracing::info!(step = %shared.config.step_id, root_pid = root, "process tree completed");
    }
    outcome
}

/// Result of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Reports handed to the consumer, the completion report included.
    pub delivered: usize,
    /// Pids still tracked at teardown.
    pub remaining_processes: Vec<u32>,
}

/// Cloneable view of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Starts tracking the root process of the step's tree.
    ///
    /// Reports are attributed to this root from now on.
    pub fn track_root(&self, pid: u32) {
        self.shared.root_pid.store(pid, Ordering::Release);
        let _ = self.shared.active.add(pid);
        tracing::debug!(pid, "root process tracked");
    }

    /// Returns the observed step.
    #[must_use]
    pub fn step_id(&self) -> StepId {
        self.shared.config.step_id
    }

    /// Returns a manifest pointing interceptors at this session's channels.
    #[must_use]
    pub fn manifest(&self) -> Manifest {
        let mut manifest = Manifest::new(self.shared.config.step_id, &self.shared.primary.path);
        manifest.flags.trace_enabled = self.shared.config.trace_enabled;
        manifest.flags.monitor_child_processes = true;
        manifest
    }

    /// Returns the conventional manifest location inside the channel
    /// directory.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.shared.config.channel_dir.join(MANIFEST_FILE_NAME)
    }

    /// Returns the bootstrap environment for the step's root process.
    #[must_use]
    pub fn bootstrap_env(&self, manifest_path: impl Into<PathBuf>) -> BootstrapEnv {
        BootstrapEnv {
            manifest_path: manifest_path.into(),
            root_pid: Some(ROOT_PID_SELF),
            forced_trace_processes: Vec::new(),
            traced: None,
            interposer_path: None,
        }
    }

    /// Returns the tracked pids in ascending order.
    #[must_use]
    pub fn active_processes(&self) -> Vec<u32> {
        self.shared.active.snapshot()
    }

    /// Returns the state of a channel, `None` if the session has no such
    /// channel.
    #[must_use]
    pub fn state(&self, kind: ChannelKind) -> Option<ChannelState> {
        self.shared.slot(kind).map(|slot| slot.machine.state())
    }

    /// Returns the path of a channel.
    #[must_use]
    pub fn channel_path(&self, kind: ChannelKind) -> Option<&Path> {
        self.shared.slot(kind).map(|slot| slot.path.as_path())
    }
}

/// A running session. [`Session::wait`] is the teardown rendezvous.
pub struct Session {
    handle: SessionHandle,
    readers: Vec<(ChannelKind, JoinHandle<ChannelReader>)>,
    consumer: JoinHandle<ConsumerOutcome>,
    sweeper: Sweeper,
}

impl Session {
    /// Creates the channels and starts the session's threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel directory or a channel cannot be
    /// created, or a thread cannot be spawned.
    pub fn start(config: SessionConfig, consumer: impl AccessReportConsumer + 'static) -> Result<Self> {
        Self::start_with_probe(config, consumer, Arc::new(SystemProbe))
    }

    /// Like [`Session::start`], with a custom liveness probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel directory or a channel cannot be
    /// created, or a thread cannot be spawned.
    pub fn start_with_probe(
        config: SessionConfig,
        consumer: impl AccessReportConsumer + 'static,
        probe: Arc<dyn ProcessProbe>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.channel_dir).map_err(|source| SandtraceError::Io {
            path: config.channel_dir.clone(),
            source,
        })?;

        let primary_path = config.primary_channel_path();
        let (primary_reader, primary_writer) =
            create_channel(ChannelKind::Primary, &primary_path)?;
        let mut channel_readers = vec![primary_reader];
        let secondary = if config.trace_enabled {
            let secondary_path = config.secondary_channel_path();
            match create_channel(ChannelKind::Secondary, &secondary_path) {
                Ok((reader, writer)) => {
                    channel_readers.push(reader);
                    Some(ChannelSlot::new(ChannelKind::Secondary, writer, secondary_path))
                }
                Err(e) => {
                    primary_writer.close();
                    let _ = remove_channel(&primary_path);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let shared = Arc::new(Shared {
            active: Arc::new(ActiveProcessSet::new()),
            root_pid: AtomicU32::new(0),
            primary: ChannelSlot::new(ChannelKind::Primary, primary_writer, primary_path),
            secondary,
            aborted: AtomicBool::new(false),
            config,
        });

        let (tx, rx) = mpsc::channel();
        let channels = channel_readers.len();
        let mut readers = Vec::with_capacity(channels);
        for reader in channel_readers {
            let kind = reader.kind();
            let thread = match spawn_reader(reader, Arc::clone(&shared), tx.clone()) {
                Ok(thread) => thread,
                Err(e) => {
                    shared.abort();
                    shared.dispose();
                    return Err(e);
                }
            };
            readers.push((kind, thread));
        }
        drop(tx);

        let consumer_shared = Arc::clone(&shared);
        let consumer = std::thread::Builder::new()
            .name("sandtrace-consumer".to_string())
            .spawn(move || consume(consumer, &rx, channels, &consumer_shared))
            .map_err(|source| {
                shared.abort();
                shared.dispose();
                SandtraceError::Io {
                    path: shared.config.channel_dir.clone(),
                    source,
                }
            })?;

        let sweep_shared = Arc::clone(&shared);
        let sweeper = Sweeper::spawn(
            shared.config.sweep_interval,
            Arc::clone(&shared.active),
            probe,
            move || sweep_shared.on_set_empty(),
        );

        tracing::info!(
            step = %shared.config.step_id,
            dir = %shared.config.channel_dir.display(),
            trace = shared.config.trace_enabled,
            "observation session started"
        );
        Ok(Self {
            handle: SessionHandle { shared },
            readers,
            consumer,
            sweeper,
        })
    }

    /// Returns a handle to the running session.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Blocks until every channel closed, then releases the session.
    ///
    /// # Errors
    ///
    /// Returns the first channel failure, such as
    /// [`SandtraceError::PrematureEndOfStream`]. The session is released
    /// either way.
    pub fn wait(self) -> Result<SessionSummary> {
        let shared = Arc::clone(&self.handle.shared);
        let outcome = self.consumer.join();

        let mut finished = Vec::with_capacity(self.readers.len());
        for (kind, thread) in self.readers {
            match thread.join() {
                Ok(reader) => finished.push(reader),
                Err(_) => tracing::error!(channel = %kind, "reader thread panicked"),
            }
        }
        self.sweeper.stop();
        shared.dispose();
        drop(finished);

        let outcome = outcome.map_err(|_| SandtraceError::Io {
            path: shared.config.channel_dir.clone(),
            source: io::Error::other("consumer thread panicked"),
        })?;
        let summary = SessionSummary {
            delivered: outcome.delivered,
            remaining_processes: shared.active.snapshot(),
        };
        tracing::info!(
            delivered = summary.delivered,
            remaining = summary.remaining_processes.len(),
            "observation session released"
        );
        match outcome.failure {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}
