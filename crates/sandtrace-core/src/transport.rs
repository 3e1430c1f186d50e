//! Named-pipe report channels.
//!
//! The host creates each channel as a FIFO, keeps its read end, and also
//! keeps one write end of its own. The held write end stops the channel
//! from reaching end-of-stream between short-lived writers and carries
//! the host's control markers. Interceptors open the FIFO per report and
//! issue a single write no larger than the atomic write limit.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::stat::Mode;
use parking_lot::Mutex;
use sandtrace_common::constants::ATOMIC_WRITE_LIMIT;
use sandtrace_common::error::{Result, SandtraceError};
use sandtrace_common::types::ChannelKind;

use crate::codec::{Frame, FrameReader, Marker};

/// Read end of a channel, owned by the host.
pub struct ChannelReader {
    kind: ChannelKind,
    path: PathBuf,
    frames: FrameReader<File>,
}

impl ChannelReader {
    /// Blocks for the next frame; `None` means every writer is gone.
    ///
    /// # Errors
    ///
    /// Propagates framing and I/O errors from [`FrameReader::next_frame`].
    pub fn recv(&mut self) -> Result<Option<Frame>> {
        self.frames.next_frame()
    }

    /// Returns which channel this is.
    #[must_use]
    pub const fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Returns the FIFO path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write end held open by the host for the lifetime of the session.
#[derive(Debug)]
pub struct HeldWriter {
    kind: ChannelKind,
    file: Mutex<Option<File>>,
}

impl HeldWriter {
    /// Writes a control marker.
    ///
    /// # Errors
    ///
    /// Returns [`SandtraceError::MarkerSkipped`] if the writer is closed or
    /// the write fails. The marker is not retried.
    pub fn send_marker(&self, marker: Marker) -> Result<()> {
        let skipped = |message: String| SandtraceError::MarkerSkipped {
            channel: self.kind,
            marker: marker.value(),
            message,
        };
        let mut guard = self.file.lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| skipped("writer closed".to_owned()))?;
        file.write_all(&marker.to_frame())
            .map_err(|e| skipped(e.to_string()))?;
        tracing::trace!(channel = %self.kind, ?marker, "marker sent");
        Ok(())
    }

    /// Closes the write end. Later markers are skipped.
    pub fn close(&self) {
        drop(self.file.lock().take());
    }

    /// Returns `true` while the write end is open.
    pub fn is_open(&self) -> bool {
        self.file.lock().is_some()
    }
}

/// Creates a FIFO at `path` and opens the host's read and write ends.
///
/// The read end is opened non-blocking first so the call does not wait
/// for a writer, then switched back to blocking once the held writer
/// exists.
///
/// # Errors
///
/// Returns [`SandtraceError::ChannelUnavailable`] if the FIFO cannot be
/// created or opened.
pub fn create_channel(kind: ChannelKind, path: &Path) -> Result<(ChannelReader, HeldWriter)> {
    let unavailable = |source: io::Error| SandtraceError::ChannelUnavailable {
        channel: kind,
        path: path.to_path_buf(),
        source,
    };

    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .map_err(|errno| unavailable(io::Error::from(errno)))?;

    let reader = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(unavailable)?;
    let writer = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(unavailable)?;

    let flags = fcntl(&reader, FcntlArg::F_GETFL)
        .map_err(|errno| unavailable(io::Error::from(errno)))?;
    let blocking = OFlag::from_bits_truncate(flags) & !OFlag::O_NONBLOCK;
    let _ = fcntl(&reader, FcntlArg::F_SETFL(blocking))
        .map_err(|errno| unavailable(io::Error::from(errno)))?;

    tracing::debug!(channel = %kind, path = %path.display(), "channel created");
    Ok((
        ChannelReader {
            kind,
            path: path.to_path_buf(),
            frames: FrameReader::new(reader),
        },
        HeldWriter {
            kind,
            file: Mutex::new(Some(writer)),
        },
    ))
}

/// Removes a channel's FIFO. A missing FIFO is not an error.
///
/// # Errors
///
/// Returns [`SandtraceError::Io`] if the FIFO exists but cannot be removed.
pub fn remove_channel(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SandtraceError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Client side of a channel, used by interceptors.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    kind: ChannelKind,
    path: PathBuf,
}

impl ChannelSender {
    /// Creates a sender for the FIFO at `path`.
    #[must_use]
    pub fn new(kind: ChannelKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    /// Returns the FIFO path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one complete frame in a single write.
    ///
    /// The FIFO is opened for appending on every call and closed again, so
    /// a forked child never shares a half-used descriptor with its parent.
    /// Returns the descriptor number that was used, which the caller must
    /// forget about in its own descriptor bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`SandtraceError::Io`] if the frame exceeds the atomic write
    /// limit or the write is short, and
    /// [`SandtraceError::ChannelUnavailable`] if the FIFO cannot be opened.
    pub fn send(&self, frame: &[u8]) -> Result<i32> {
        if frame.len() > ATOMIC_WRITE_LIMIT {
            return Err(SandtraceError::Io {
                path: self.path.clone(),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "{} byte frame exceeds atomic write limit of {ATOMIC_WRITE_LIMIT}",
                        frame.len()
                    ),
                ),
            });
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|source| SandtraceError::ChannelUnavailable {
                channel: self.kind,
                path: self.path.clone(),
                source,
            })?;
        let fd = file.as_raw_fd();

        let written = file.write(frame).map_err(|source| SandtraceError::Io {
            path: self.path.clone(),
            source,
        })?;
        if written != frame.len() {
            return Err(SandtraceError::Io {
                path: self.path.clone(),
                source: io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write: {written} of {} bytes", frame.len()),
                ),
            });
        }
        Ok(fd)
    }
}
