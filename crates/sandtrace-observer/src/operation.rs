//! Raw intercepted operations and how each one is reported.

use sandtrace_common::types::{FileOperation, RequestedAccess};

/// Class of a raw operation seen by the interposition layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservedOperation {
    /// `execve` and friends.
    Exec,
    /// `fork`, `vfork`, `clone` creating a process.
    Fork,
    /// `exit`, `_exit`.
    Exit,
    /// `open`/`openat`/`fopen` with the given `O_*` flags.
    Open {
        /// Raw open flags.
        flags: i32,
    },
    /// `mkdir`, `mknod`, `creat`, `symlink` (at the new path).
    Create,
    /// Content writes addressed by path or descriptor (`write`, `pwrite`).
    Write,
    /// `truncate`, `ftruncate`.
    Truncate,
    /// `chmod`, `chown`, `utimes`, `setxattr`, `removexattr`.
    SetAttributes,
    /// `stat`, `fstatat` following symlinks.
    Stat,
    /// `lstat`, `fstatat` with `AT_SYMLINK_NOFOLLOW`.
    SymlinkStat,
    /// `access`, `faccessat`.
    Access,
    /// `getattrlist`-like metadata queries.
    GetAttributes,
    /// `getxattr`, `lgetxattr`.
    GetExtendedAttributes,
    /// `listxattr`, `llistxattr`.
    ListExtendedAttributes,
    /// `readlink`, `readlinkat`.
    ReadLink,
    /// `unlink`, `unlinkat`.
    Unlink,
    /// `rmdir`.
    RemoveDirectory,
    /// `rename`, `renameat`.
    Rename,
    /// `link`, `linkat`.
    Link,
    /// `opendir`, `readdir`, `getdents`.
    ReadDirectory,
    /// `close`; never reported, only invalidates descriptor bookkeeping.
    Close,
}

/// How a raw operation is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Wire operation.
    pub operation: FileOperation,
    /// Access requested on the path.
    pub access: RequestedAccess,
    /// Whether a symlink in the final path segment is followed.
    pub follow_final: bool,
}

impl Classification {
    const fn new(operation: FileOperation, access: RequestedAccess, follow_final: bool) -> Self {
        Self {
            operation,
            access,
            follow_final,
        }
    }
}

impl ObservedOperation {
    /// Maps the raw operation onto its report shape.
    ///
    /// `exists` tells whether the target existed before the call, which
    /// distinguishes a creating open from a writing one. Returns `None`
    /// for operations that never produce a report.
    #[must_use]
    pub const fn classify(self, exists: bool) -> Option<Classification> {
        use FileOperation as Op;
        use RequestedAccess as A;

        let class = match self {
            Self::Exec => Classification::new(Op::ProcessExec, A::READ, true),
            Self::Fork => Classification::new(Op::ProcessStart, A::NONE, true),
            Self::Exit => Classification::new(Op::ProcessExit, A::NONE, true),
            Self::Open { flags } => {
                let follow = flags & libc::O_NOFOLLOW == 0;
                let writes = flags & (libc::O_WRONLY | libc::O_RDWR | libc::O_TRUNC) != 0;
                if flags & libc::O_CREAT != 0 && !exists {
                    Classification::new(Op::Create, A::WRITE, follow)
                } else if writes {
                    Classification::new(Op::Write, A::WRITE, follow)
                } else {
                    Classification::new(Op::Read, A::READ, follow)
                }
            }
            Self::Create => Classification::new(Op::Create, A::WRITE, false),
            Self::Write | Self::Truncate | Self::SetAttributes => {
                Classification::new(Op::Write, A::WRITE, true)
            }
            // Every metadata query collapses onto one probe: a stat after an
            // access() on the same path is redundant.
            Self::Stat
            | Self::Access
            | Self::GetAttributes
            | Self::GetExtendedAttributes
            | Self::ListExtendedAttributes => Classification::new(Op::Probe, A::PROBE, true),
            Self::SymlinkStat => Classification::new(Op::Probe, A::PROBE, false),
            Self::ReadLink => Classification::new(Op::ReadLink, A::READ, false),
            Self::Unlink | Self::RemoveDirectory => Classification::new(Op::Delete, A::WRITE, false),
            Self::Rename => Classification::new(Op::Rename, A::WRITE, false),
            Self::Link => Classification::new(Op::Link, A::WRITE, false),
            Self::ReadDirectory => Classification::new(Op::Enumerate, A::READ, true),
            Self::Close => return None,
        };
        Some(class)
    }
}
