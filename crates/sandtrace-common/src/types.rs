//! Domain primitive types used across the sandtrace workspace.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Identifier of the build step (pip) whose process tree is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StepId(u64);

impl StepId {
    /// Creates a step ID from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Step{:016X}", self.0)
    }
}

/// Bitset of access kinds requested by an observed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestedAccess(u8);

impl RequestedAccess {
    /// No access.
    pub const NONE: Self = Self(0);
    /// Content read.
    pub const READ: Self = Self(1);
    /// Content or metadata write.
    pub const WRITE: Self = Self(2);
    /// Existence or metadata probe.
    pub const PROBE: Self = Self(4);

    const ALL_BITS: u8 = 0b111;

    /// Builds an access set from raw bits, discarding unknown bits.
    #[must_use]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL_BITS)
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if every bit of `other` is present in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no access bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Expands the set with every weaker access it implies.
    ///
    /// Write implies Read and Probe; Read implies Probe.
    #[must_use]
    pub const fn closure(self) -> Self {
        let mut bits = self.0;
        if bits & Self::WRITE.0 != 0 {
            bits |= Self::READ.0 | Self::PROBE.0;
        }
        if bits & Self::READ.0 != 0 {
            bits |= Self::PROBE.0;
        }
        Self(bits)
    }
}

impl BitOr for RequestedAccess {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for RequestedAccess {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for RequestedAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names = [(Self::READ, "read"), (Self::WRITE, "write"), (Self::PROBE, "probe")];
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    write!(f, "+")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Policy verdict attached to an access event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FileAccessStatus {
    /// The access is permitted by the step's policy.
    #[default]
    Allowed,
    /// The access violates the step's policy.
    Denied,
    /// The policy could not be evaluated for this access.
    PolicyIndeterminate,
}

impl FileAccessStatus {
    /// Returns the numeric wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Allowed => 0,
            Self::Denied => 1,
            Self::PolicyIndeterminate => 2,
        }
    }

    /// Parses a numeric wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Allowed),
            1 => Some(Self::Denied),
            2 => Some(Self::PolicyIndeterminate),
            _ => None,
        }
    }
}

impl fmt::Display for FileAccessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allowed => write!(f, "allowed"),
            Self::Denied => write!(f, "denied"),
            Self::PolicyIndeterminate => write!(f, "indeterminate"),
        }
    }
}

/// Operation carried by an [`AccessEvent`].
///
/// The discriminant is the opcode written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileOperation {
    /// A new process joined the tree (fork/clone).
    ProcessStart = 1,
    /// A process replaced its image (exec).
    ProcessExec = 2,
    /// A process left the tree.
    ProcessExit = 3,
    /// The command line of a process.
    ProcessCommandLine = 4,
    /// Synthetic marker: every channel of the step has drained.
    ProcessTreeCompleted = 5,
    /// A process has no interposable loader and must be traced instead.
    StaticallyLinkedProcess = 6,
    /// In-band diagnostic message; the text travels in the path field.
    DebugMessage = 7,
    /// First write-permission check of a process against a path.
    FirstAllowWriteCheck = 8,
    /// Content read (open for read, mmap, exec of a script interpreter).
    Read = 10,
    /// Content or metadata write.
    Write = 11,
    /// Existence or metadata probe (stat, access, getxattr).
    Probe = 12,
    /// File or directory creation.
    Create = 13,
    /// File or directory removal.
    Delete = 14,
    /// Symlink read, including links traversed during canonicalization.
    ReadLink = 15,
    /// Directory enumeration.
    Enumerate = 16,
    /// Rename: reported once for the source and once for the destination.
    Rename = 17,
    /// Hard link creation: reported once per path.
    Link = 18,
}

impl FileOperation {
    /// Returns the numeric wire opcode.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Parses a numeric wire opcode.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        let op = match code {
            1 => Self::ProcessStart,
            2 => Self::ProcessExec,
            3 => Self::ProcessExit,
            4 => Self::ProcessCommandLine,
            5 => Self::ProcessTreeCompleted,
            6 => Self::StaticallyLinkedProcess,
            7 => Self::DebugMessage,
            8 => Self::FirstAllowWriteCheck,
            10 => Self::Read,
            11 => Self::Write,
            12 => Self::Probe,
            13 => Self::Create,
            14 => Self::Delete,
            15 => Self::ReadLink,
            16 => Self::Enumerate,
            17 => Self::Rename,
            18 => Self::Link,
            _ => return None,
        };
        Some(op)
    }

    /// Returns `true` for process lifecycle reports, which are never
    /// deduplicated.
    #[must_use]
    pub const fn is_lifecycle(self) -> bool {
        matches!(
            self,
            Self::ProcessStart
                | Self::ProcessExec
                | Self::ProcessExit
                | Self::ProcessCommandLine
                | Self::StaticallyLinkedProcess
                | Self::ProcessTreeCompleted
        )
    }

    /// Returns `true` for operations that involve a source and a destination.
    #[must_use]
    pub const fn is_dual_path(self) -> bool {
        matches!(self, Self::Rename | Self::Link)
    }

    /// Returns the channel this operation travels on.
    #[must_use]
    pub const fn channel(self) -> ChannelKind {
        match self {
            Self::StaticallyLinkedProcess => ChannelKind::Secondary,
            _ => ChannelKind::Primary,
        }
    }
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProcessStart => "process-start",
            Self::ProcessExec => "process-exec",
            Self::ProcessExit => "process-exit",
            Self::ProcessCommandLine => "process-command-line",
            Self::ProcessTreeCompleted => "process-tree-completed",
            Self::StaticallyLinkedProcess => "statically-linked-process",
            Self::DebugMessage => "debug-message",
            Self::FirstAllowWriteCheck => "first-allow-write-check",
            Self::Read => "read",
            Self::Write => "write",
            Self::Probe => "probe",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::ReadLink => "readlink",
            Self::Enumerate => "enumerate",
            Self::Rename => "rename",
            Self::Link => "link",
        };
        write!(f, "{name}")
    }
}

/// Which of the two report channels of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Ordinary access reports.
    Primary,
    /// High-priority control reports (trace escalation).
    Secondary,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// One observed file-system access or process lifecycle report.
///
/// Values are never mutated once built; the `with_*` methods return a new
/// event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEvent {
    /// What happened.
    pub operation: FileOperation,
    /// Short name of the reporting program.
    pub process_name: String,
    /// Process the access is attributed to.
    pub pid: u32,
    /// Root process of the step's tree.
    pub root_pid: u32,
    /// Step the process tree belongs to.
    pub step_id: StepId,
    /// Access kinds requested by the operation.
    pub requested_access: RequestedAccess,
    /// Policy verdict.
    pub status: FileAccessStatus,
    /// Platform error code of the operation, `0` on success.
    pub error: i32,
    /// Canonical path, or message text for debug reports.
    pub path: String,
    /// Destination path of a dual-path operation, empty otherwise.
    pub second_path: String,
    /// Whether the path names a directory.
    pub is_directory: bool,
    /// Deliver even if the access would normally be deduplicated.
    pub explicit_report: bool,
}

impl AccessEvent {
    /// Creates an allowed event with no path.
    #[must_use]
    pub fn new(operation: FileOperation, pid: u32) -> Self {
        Self {
            operation,
            process_name: String::new(),
            pid,
            root_pid: 0,
            step_id: StepId::default(),
            requested_access: RequestedAccess::NONE,
            status: FileAccessStatus::Allowed,
            error: 0,
            path: String::new(),
            second_path: String::new(),
            is_directory: false,
            explicit_report: false,
        }
    }

    /// Returns a copy with the given path.
    #[must_use]
    pub fn with_path(self, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..self
        }
    }

    /// Returns a copy with the given destination path.
    #[must_use]
    pub fn with_second_path(self, second_path: impl Into<String>) -> Self {
        Self {
            second_path: second_path.into(),
            ..self
        }
    }

    /// Returns a copy with the given requested access.
    #[must_use]
    pub fn with_access(self, requested_access: RequestedAccess) -> Self {
        Self {
            requested_access,
            ..self
        }
    }

    /// Returns a copy with the given policy verdict.
    #[must_use]
    pub fn with_status(self, status: FileAccessStatus) -> Self {
        Self { status, ..self }
    }

    /// Returns a copy with the given error code.
    #[must_use]
    pub fn with_error(self, error: i32) -> Self {
        Self { error, ..self }
    }

    /// Returns a copy attributed to the given step and root process.
    #[must_use]
    pub fn with_step(self, step_id: StepId, root_pid: u32) -> Self {
        Self {
            step_id,
            root_pid,
            ..self
        }
    }

    /// Returns a copy with the given program name.
    #[must_use]
    pub fn with_process_name(self, process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            ..self
        }
    }

    /// Returns a copy with the directory flag set as given.
    #[must_use]
    pub fn with_directory(self, is_directory: bool) -> Self {
        Self {
            is_directory,
            ..self
        }
    }

    /// Returns a copy that is delivered even when redundant.
    #[must_use]
    pub fn explicit(self) -> Self {
        Self {
            explicit_report: true,
            ..self
        }
    }

    /// Returns `true` if this event carries a destination path.
    #[must_use]
    pub fn is_dual_path(&self) -> bool {
        self.operation.is_dual_path() || !self.second_path.is_empty()
    }

    /// Splits a dual-path event into one single-path record per path.
    ///
    /// The wire format carries one path per frame, so a rename is delivered
    /// as a source record followed by a destination record.
    #[must_use]
    pub fn into_records(self) -> Vec<Self> {
        if self.second_path.is_empty() {
            return vec![self];
        }
        let destination = Self {
            path: self.second_path.clone(),
            second_path: String::new(),
            ..self.clone()
        };
        let source = Self {
            second_path: String::new(),
            ..self
        };
        vec![source, destination]
    }
}

impl fmt::Display for AccessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] pid={} {} {} ({}, {})",
            self.step_id, self.pid, self.operation, self.path, self.requested_access, self.status
        )?;
        if !self.second_path.is_empty() {
            write!(f, " -> {}", self.second_path)?;
        }
        Ok(())
    }
}
