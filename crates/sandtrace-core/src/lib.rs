//! # sandtrace-core
//!
//! Building blocks shared by the in-process observer and the host
//! collector:
//! - **Codec**: the length-prefixed, pipe-delimited report frame.
//! - **Canonicalizer**: absolute, symlink-resolved paths with link
//!   traversal reporting.
//! - **Closure**: per-session access deduplication.
//! - **Transport**: named FIFO channels with atomic single-write sends.
//!
//! Every interaction with the live system goes through
//! [`fs_view::FileSystemView`] so the algorithms can be exercised against
//! an in-memory filesystem.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod canonicalize;
pub mod closure;
pub mod codec;
pub mod fs_view;
pub mod transport;
