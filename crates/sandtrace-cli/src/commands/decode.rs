//! `sandtrace decode` — Decode a captured report channel stream.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use clap::Args;
use sandtrace_core::codec::{self, Frame, FrameReader};

use crate::output::{EVENT_HEADER, render_event};

/// Arguments for the `decode` command.
#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// File holding the raw bytes read from a channel.
    pub file: PathBuf,

    /// Also print control markers.
    #[arg(long)]
    pub markers: bool,
}

/// Executes the `decode` command.
///
/// Undecodable reports are logged and skipped; a broken frame ends the
/// stream with an error.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or its framing is broken.
pub fn execute(args: &DecodeArgs, json: bool) -> anyhow::Result<()> {
    let file = File::open(&args.file)
        .map_err(|e| anyhow::anyhow!("cannot open {}: {e}", args.file.display()))?;
    let mut frames = FrameReader::new(BufReader::new(file));

    if !json {
        println!("{EVENT_HEADER}");
    }
    let mut count = 0usize;
    while let Some(frame) = frames.next_frame().map_err(|e| anyhow::anyhow!("{e}"))? {
        match frame {
            Frame::Report(payload) => match codec::decode(&payload) {
                Ok(event) => {
                    println!("{}", render_event(&event, json)?);
                    count += 1;
                }
                Err(e) => tracing::warn!(error = %e, "skipping undecodable report"),
            },
            Frame::Marker(marker) if args.markers => println!("-- {marker:?}"),
            Frame::Marker(_) => {}
        }
    }
    tracing::info!(reports = count, "stream decoded");
    Ok(())
}
