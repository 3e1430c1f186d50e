//! `sandtrace canonicalize` — Resolve a path on the live filesystem.

use clap::Args;
use sandtrace_core::canonicalize::{BaseDir, Canonicalizer};
use sandtrace_core::fs_view::ProcFs;

/// Arguments for the `canonicalize` command.
#[derive(Args, Debug)]
pub struct CanonicalizeArgs {
    /// Path to resolve; relative paths are taken from the working directory.
    pub path: String,

    /// Keep a symlink in the final segment instead of following it.
    #[arg(long)]
    pub no_follow: bool,
}

/// Executes the `canonicalize` command.
///
/// Prints every symlink traversed on the way, as the read-link reports an
/// interceptor would send, then the resolved path.
///
/// # Errors
///
/// Returns an error if the working directory cannot be determined.
pub fn execute(args: &CanonicalizeArgs) -> anyhow::Result<()> {
    let view = ProcFs;
    let canonicalizer = Canonicalizer::new(&view);
    let resolved = canonicalizer
        .canonicalize(&args.path, &BaseDir::CurrentDir { pid: None }, !args.no_follow)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    for link in &resolved.traversed_links {
        println!("readlink {link}");
    }
    println!("{}", resolved.path);
    Ok(())
}
