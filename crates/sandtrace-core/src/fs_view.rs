//! Read-only view of the filesystem and process table.
//!
//! The live implementation reads `/proc`; tests substitute their own.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Filesystem and process queries needed to canonicalize and classify
/// accesses.
///
/// `pid` arguments of `None` refer to the calling process; `Some(pid)`
/// refers to a traced child.
pub trait FileSystemView: Send + Sync {
    /// Returns the target of `path` if it is a symlink.
    fn read_link(&self, path: &str) -> Option<String>;

    /// Returns the working directory of a process.
    fn current_dir(&self, pid: Option<u32>) -> Option<String>;

    /// Returns the path an open descriptor refers to.
    fn fd_path(&self, fd: i32, pid: Option<u32>) -> Option<String>;

    /// Returns the `st_mode` of `path` without following a final symlink.
    fn file_mode(&self, path: &str) -> Option<u32>;

    /// Returns the `st_mode` of the object behind an open descriptor.
    fn fd_mode(&self, fd: i32, pid: Option<u32>) -> Option<u32>;

    /// Returns the modification time of `path` in seconds.
    fn modified_secs(&self, path: &str) -> Option<i64>;

    /// Returns the argument vector of a process.
    fn command_line(&self, pid: u32) -> Option<Vec<String>>;

    /// Returns the executable of the calling process.
    fn executable(&self) -> Option<String>;
}

/// [`FileSystemView`] backed by the live system and `/proc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcFs;

impl ProcFs {
    fn proc_entry(pid: Option<u32>, entry: &str) -> String {
        pid.map_or_else(
            || format!("/proc/self/{entry}"),
            |pid| format!("/proc/{pid}/{entry}"),
        )
    }
}

impl FileSystemView for ProcFs {
    fn read_link(&self, path: &str) -> Option<String> {
        std::fs::read_link(path)
            .ok()
            .map(|target| target.to_string_lossy().into_owned())
    }

    fn current_dir(&self, pid: Option<u32>) -> Option<String> {
        self.read_link(&Self::proc_entry(pid, "cwd"))
    }

    fn fd_path(&self, fd: i32, pid: Option<u32>) -> Option<String> {
        self.read_link(&Self::proc_entry(pid, &format!("fd/{fd}")))
    }

    fn file_mode(&self, path: &str) -> Option<u32> {
        std::fs::symlink_metadata(path).ok().map(|m| m.mode())
    }

    fn fd_mode(&self, fd: i32, pid: Option<u32>) -> Option<u32> {
        std::fs::metadata(Self::proc_entry(pid, &format!("fd/{fd}")))
            .ok()
            .map(|m| m.mode())
    }

    fn modified_secs(&self, path: &str) -> Option<i64> {
        std::fs::symlink_metadata(path).ok().map(|m| m.mtime())
    }

    fn command_line(&self, pid: u32) -> Option<Vec<String>> {
        let raw = std::fs::read(Path::new(&format!("/proc/{pid}/cmdline"))).ok()?;
        Some(
            raw.split(|b| *b == 0)
                .filter(|arg| !arg.is_empty())
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
                .collect(),
        )
    }

    fn executable(&self) -> Option<String> {
        self.read_link("/proc/self/exe")
    }
}

/// Returns `true` for directories.
#[must_use]
pub const fn is_directory(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFDIR
}

/// Returns `true` for objects that are not worth reporting: pipes, sockets,
/// and devices. A mode of `0` (unknown or missing file) is reportable.
#[must_use]
pub const fn is_non_file(mode: u32) -> bool {
    let kind = mode & libc::S_IFMT;
    mode != 0 && kind != libc::S_IFDIR && kind != libc::S_IFREG && kind != libc::S_IFLNK
}
