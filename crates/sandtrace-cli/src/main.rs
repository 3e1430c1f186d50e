//! # sandtrace
//!
//! Observes the file accesses of a process tree: runs a command under an
//! observation session, and offers the session's building blocks
//! (canonicalization, linkage inspection, channel decoding) as tools.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod commands;
mod output;

use clap::Parser;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env();
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    commands::execute(cli)
}
