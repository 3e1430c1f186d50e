//! # sandtrace-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire sandtrace workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate and defines the access event model that the observer
//! produces and the host consumes.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
