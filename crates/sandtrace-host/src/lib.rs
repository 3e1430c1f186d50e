//! # sandtrace-host
//!
//! The collector side of one build step's observation session:
//! - **Active set**: which processes of the step's tree are still alive.
//! - **Liveness sweep**: removes processes that died without an exit report.
//! - **Channel state machines**: the marker handshake that decides when a
//!   channel has been drained.
//! - **Session**: owns the channels, the reader threads and the ordered
//!   delivery of reports to an [`consumer::AccessReportConsumer`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod active_set;
pub mod channel_state;
pub mod consumer;
pub mod liveness;
pub mod session;
