//! `sandtrace inspect` — Report the linkage of an executable.

use std::path::PathBuf;

use clap::Args;
use sandtrace_observer::static_link::{BinaryInspector, ObjdumpInspector};

/// Arguments for the `inspect` command.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Executable to inspect.
    pub binary: PathBuf,
}

/// Executes the `inspect` command.
///
/// # Errors
///
/// Returns an error if the binary does not exist or cannot be inspected.
pub fn execute(args: &InspectArgs) -> anyhow::Result<()> {
    if !args.binary.exists() {
        return Err(anyhow::anyhow!("binary not found: {}", args.binary.display()));
    }
    let inspector = ObjdumpInspector::locate();
    let is_static = inspector
        .is_statically_linked(&args.binary)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    if is_static {
        println!("{}: statically linked, requires tracing", args.binary.display());
    } else {
        println!("{}: dynamically linked, interposable", args.binary.display());
    }
    Ok(())
}
