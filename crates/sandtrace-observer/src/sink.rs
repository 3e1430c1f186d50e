//! Destinations for encoded report frames.

use sandtrace_common::config::Manifest;
use sandtrace_common::error::Result;
use sandtrace_common::types::ChannelKind;
use sandtrace_core::transport::ChannelSender;

/// Where the interceptor writes encoded frames.
pub trait ReportSink: Send + Sync {
    /// Writes one complete frame to the given channel.
    ///
    /// Returns the descriptor number used for the write, if any, so the
    /// caller can drop it from its own bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame could not be written in full.
    fn send(&self, channel: ChannelKind, frame: &[u8]) -> Result<Option<i32>>;
}

/// Sink writing to the step's FIFO channels.
#[derive(Debug, Clone)]
pub struct FifoSink {
    primary: ChannelSender,
    secondary: ChannelSender,
}

impl FifoSink {
    /// Creates a sink for the channels named by the manifest.
    #[must_use]
    pub fn for_manifest(manifest: &Manifest) -> Self {
        Self {
            primary: ChannelSender::new(ChannelKind::Primary, &manifest.report_path),
            secondary: ChannelSender::new(
                ChannelKind::Secondary,
                manifest.secondary_report_path(),
            ),
        }
    }
}

impl ReportSink for FifoSink {
    fn send(&self, channel: ChannelKind, frame: &[u8]) -> Result<Option<i32>> {
        let sender = match channel {
            ChannelKind::Primary => &self.primary,
            ChannelKind::Secondary => &self.secondary,
        };
        sender.send(frame).map(Some)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;
    use sandtrace_common::types::AccessEvent;
    use sandtrace_core::codec::decode;

    use super::*;

    /// Sink that decodes and keeps every frame.
    #[derive(Default)]
    pub struct MemorySink {
        pub frames: Mutex<Vec<(ChannelKind, AccessEvent)>>,
    }

    impl MemorySink {
        pub fn events(&self) -> Vec<AccessEvent> {
            self.frames.lock().iter().map(|(_, e)| e.clone()).collect()
        }

        pub fn on(&self, channel: ChannelKind) -> Vec<AccessEvent> {
            self.frames
                .lock()
                .iter()
                .filter(|(c, _)| *c == channel)
                .map(|(_, e)| e.clone())
                .collect()
        }
    }

    impl ReportSink for MemorySink {
        fn send(&self, channel: ChannelKind, frame: &[u8]) -> Result<Option<i32>> {
            let event = decode(&frame[4..])?;
            self.frames.lock().push((channel, event));
            Ok(None)
        }
    }
}
