//! CLI command definitions and dispatch.

pub mod canonicalize;
pub mod decode;
pub mod inspect;
pub mod run;

use clap::{Parser, Subcommand};

/// sandtrace — observe the file accesses of a process tree.
#[derive(Parser, Debug)]
#[command(name = "sandtrace", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Emit logs and reports as JSON lines.
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command and report every file it and its descendants access.
    Run(run::RunArgs),
    /// Resolve a path the way reported paths are resolved.
    Canonicalize(canonicalize::CanonicalizeArgs),
    /// Tell whether a binary must be traced instead of interposed.
    Inspect(inspect::InspectArgs),
    /// Decode a captured report channel stream.
    Decode(decode::DecodeArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run(args) => run::execute(args, cli.json),
        Command::Canonicalize(args) => canonicalize::execute(&args),
        Command::Inspect(args) => inspect::execute(&args),
        Command::Decode(args) => decode::execute(&args, cli.json),
    }
}
