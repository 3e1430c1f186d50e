//! Wire codec for access reports.
//!
//! A frame is a 4-byte little-endian signed length followed by that many
//! payload bytes. The payload is nine `|`-separated UTF-8 fields
//! terminated by `\n`:
//!
//! ```text
//! progname|pid|access|status|explicit|error|opcode|isDirectory|path\n
//! ```
//!
//! Negative lengths carry no payload and mark channel state transitions
//! (see [`Marker`]). A whole frame never exceeds
//! [`ATOMIC_WRITE_LIMIT`] so that concurrent writers cannot interleave.

use std::io::{ErrorKind, Read};
use std::str::FromStr;

use sandtrace_common::constants::{
    ATOMIC_WRITE_LIMIT, END_OF_REPORTS_MARKER, FRAME_PREFIX_LEN, MAX_PAYLOAD_LEN,
    NEWLINE_SUBSTITUTE, NO_ACTIVE_PROCESSES_MARKER, PIPE_SUBSTITUTE,
};
use sandtrace_common::error::{Result, SandtraceError};
use sandtrace_common::types::{AccessEvent, FileAccessStatus, FileOperation, RequestedAccess};

const FIELD_SEPARATOR: char = '|';
const FIELD_COUNT: usize = 9;

/// Control marker carried in the length field of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    /// The host believes no process of the step is alive.
    NoActiveProcesses,
    /// Nothing more will arrive on this channel.
    EndOfReports,
}

impl Marker {
    /// Returns the length-field value of this marker.
    #[must_use]
    pub const fn value(self) -> i32 {
        match self {
            Self::NoActiveProcesses => NO_ACTIVE_PROCESSES_MARKER,
            Self::EndOfReports => END_OF_REPORTS_MARKER,
        }
    }

    /// Parses a negative length-field value.
    #[must_use]
    pub const fn from_value(value: i32) -> Option<Self> {
        match value {
            NO_ACTIVE_PROCESSES_MARKER => Some(Self::NoActiveProcesses),
            END_OF_REPORTS_MARKER => Some(Self::EndOfReports),
            _ => None,
        }
    }

    /// Returns the complete encoded frame of this marker.
    #[must_use]
    pub const fn to_frame(self) -> [u8; FRAME_PREFIX_LEN] {
        self.value().to_le_bytes()
    }
}

/// One frame read from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A report payload, not yet decoded.
    Report(Vec<u8>),
    /// A control marker.
    Marker(Marker),
}

/// Replaces characters that would break field or record boundaries.
fn sanitize(field: &str) -> String {
    field
        .chars()
        .map(|c| match c {
            '|' => PIPE_SUBSTITUTE,
            '\n' | '\r' => NEWLINE_SUBSTITUTE,
            other => other,
        })
        .collect()
}

fn render_payload(event: &AccessEvent, path: &str) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}\n",
        sanitize(&event.process_name),
        event.pid,
        event.requested_access.bits(),
        event.status.code(),
        u8::from(event.explicit_report),
        event.error,
        event.operation.code(),
        u8::from(event.is_directory),
        sanitize(path),
    )
}

/// Largest prefix of `s` that is at most `max` bytes and ends on a
/// character boundary.
fn truncate_to_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Returns `event` with its path shortened, on a character boundary, so
/// that the encoded frame fits in one atomic write.
///
/// Events that already fit are returned unchanged. If the other fields
/// alone exceed the budget the path is emptied.
#[must_use]
pub fn truncate_path_to_fit(event: AccessEvent) -> AccessEvent {
    let payload_len = render_payload(&event, &event.path).len();
    if payload_len <= MAX_PAYLOAD_LEN {
        return event;
    }
    // Sanitizing is length-preserving, so cutting the raw text by the
    // excess brings the payload within bounds.
    let excess = payload_len - MAX_PAYLOAD_LEN;
    let keep = event.path.len().saturating_sub(excess);
    let path = truncate_to_boundary(&event.path, keep).to_owned();
    event.with_path(path)
}

/// Encodes one single-path event into a complete frame.
///
/// Dual-path events must be split with [`AccessEvent::into_records`]
/// first; only `path` is encoded.
///
/// # Errors
///
/// Returns [`SandtraceError::FrameTooLarge`] if the frame would exceed
/// [`ATOMIC_WRITE_LIMIT`]. Debug messages are truncated to fit instead.
pub fn encode(event: &AccessEvent) -> Result<Vec<u8>> {
    let mut payload = render_payload(event, &event.path);

    if payload.len() > MAX_PAYLOAD_LEN && event.operation == FileOperation::DebugMessage {
        let fitted = truncate_path_to_fit(event.clone());
        payload = render_payload(&fitted, &fitted.path);
    }
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(SandtraceError::FrameTooLarge {
            operation: event.operation,
            size: payload.len() + FRAME_PREFIX_LEN,
            max: ATOMIC_WRITE_LIMIT,
        });
    }

    let len = i32::try_from(payload.len()).map_err(|_| SandtraceError::FrameTooLarge {
        operation: event.operation,
        size: payload.len() + FRAME_PREFIX_LEN,
        max: ATOMIC_WRITE_LIMIT,
    })?;
    let mut frame = Vec::with_capacity(FRAME_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload.as_bytes());
    Ok(frame)
}

/// Parses a numeric field, logging and substituting zero on failure.
fn parse_field<T: FromStr + Default>(name: &str, raw: &str) -> T {
    raw.parse().unwrap_or_else(|_| {
        tracing::warn!(field = name, value = raw, "unparsable numeric field, using 0");
        T::default()
    })
}

/// Decodes a report payload (without its length prefix).
///
/// The returned event has no step or root pid; the receiver stamps those.
///
/// # Errors
///
/// Returns [`SandtraceError::Decode`] if the payload does not have nine
/// fields or carries an unknown opcode.
pub fn decode(payload: &[u8]) -> Result<AccessEvent> {
    let text = String::from_utf8_lossy(payload);
    let text = text.strip_suffix('\n').unwrap_or(&text);

    let fields: Vec<&str> = text.splitn(FIELD_COUNT, FIELD_SEPARATOR).collect();
    let [
        process_name,
        pid,
        access,
        status,
        explicit,
        error,
        opcode,
        is_directory,
        path,
    ] = fields.as_slice()
    else {
        return Err(SandtraceError::Decode {
            message: format!("expected {FIELD_COUNT} fields, found {}", fields.len()),
        });
    };

    let code: u8 = parse_field("opcode", opcode);
    let operation = FileOperation::from_code(code).ok_or_else(|| SandtraceError::Decode {
        message: format!("unknown opcode {opcode}"),
    })?;

    let status_code: u8 = parse_field("status", status);
    let status = FileAccessStatus::from_code(status_code).unwrap_or_else(|| {
        tracing::warn!(status = status_code, "unknown status code");
        FileAccessStatus::PolicyIndeterminate
    });

    let mut event = AccessEvent::new(operation, parse_field("pid", pid))
        .with_process_name(*process_name)
        .with_access(RequestedAccess::from_bits_truncate(parse_field(
            "access", access,
        )))
        .with_status(status)
        .with_error(parse_field("error", error))
        .with_directory(parse_field::<u8>("isDirectory", is_directory) != 0)
        .with_path(*path);
    if parse_field::<u8>("explicitReport", explicit) != 0 {
        event = event.explicit();
    }
    Ok(event)
}

/// Reads frames from a byte stream.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    /// Wraps a byte stream.
    pub const fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Returns the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads the next frame, or `None` on a clean end-of-stream.
    ///
    /// # Errors
    ///
    /// Returns [`SandtraceError::Decode`] for a truncated frame, an unknown
    /// marker, or a length beyond the atomic write limit, and
    /// [`SandtraceError::Io`] if the stream fails.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        let filled = self.fill(&mut prefix)?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < FRAME_PREFIX_LEN {
            return Err(SandtraceError::Decode {
                message: format!("stream ended inside a length prefix ({filled} bytes)"),
            });
        }

        let len = i32::from_le_bytes(prefix);
        if len < 0 {
            return Marker::from_value(len)
                .map(|m| Some(Frame::Marker(m)))
                .ok_or_else(|| SandtraceError::Decode {
                    message: format!("unknown marker {len}"),
                });
        }

        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > MAX_PAYLOAD_LEN {
            return Err(SandtraceError::Decode {
                message: format!("frame length {len} exceeds {MAX_PAYLOAD_LEN}"),
            });
        }

        let mut payload = vec![0u8; len];
        let filled = self.fill(&mut payload)?;
        if filled < len {
            return Err(SandtraceError::Decode {
                message: format!("stream ended after {filled} of {len} payload bytes"),
            });
        }
        Ok(Some(Frame::Report(payload)))
    }

    /// Reads until `buf` is full or the stream ends, returning the count.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(SandtraceError::Io {
                        path: "<channel>".into(),
                        source: e,
                    });
                }
            }
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_event() -> AccessEvent {
        AccessEvent::new(FileOperation::Read, 4242)
            .with_process_name("cc1")
            .with_access(RequestedAccess::READ)
            .with_path("/src/main.c")
    }

    #[test]
    fn encodes_length_prefix_little_endian() {
        let frame = encode(&read_event()).unwrap();
        let len = i32::from_le_bytes(frame[..4].try_into().unwrap());
        assert_eq!(usize::try_from(len).unwrap(), frame.len() - 4);
        assert_eq!(&frame[4..], b"cc1|4242|1|0|0|0|10|0|/src/main.c\n");
    }

    #[test]
    fn decode_recovers_fields() {
        let event = read_event()
            .with_status(FileAccessStatus::Denied)
            .with_error(13)
            .with_directory(true)
            .explicit();
        let frame = encode(&event).unwrap();
        let decoded = decode(&frame[4..]).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn pipes_and_newlines_in_paths_are_substituted() {
        let event = read_event().with_path("/tmp/a|b\nc\rd");
        let frame = encode(&event).unwrap();
        let decoded = decode(&frame[4..]).unwrap();
        assert_eq!(decoded.path, "/tmp/a!b.c.d");
    }

    #[test]
    fn oversize_access_report_is_rejected() {
        let event = read_event().with_path(format!("/{}", "x".repeat(ATOMIC_WRITE_LIMIT)));
        let err = encode(&event).unwrap_err();
        assert!(matches!(
            err,
            SandtraceError::FrameTooLarge {
                operation: FileOperation::Read,
                ..
            }
        ));
    }

    #[test]
    fn oversize_debug_message_is_truncated_to_fit() {
        let event = AccessEvent::new(FileOperation::DebugMessage, 1)
            .with_process_name("make")
            .with_path("y".repeat(ATOMIC_WRITE_LIMIT * 2));
        let frame = encode(&event).unwrap();
        assert_eq!(frame.len(), ATOMIC_WRITE_LIMIT);
        let decoded = decode(&frame[4..]).unwrap();
        assert!(decoded.path.chars().all(|c| c == 'y'));
    }

    #[test]
    fn truncation_respects_multibyte_characters() {
        let event = AccessEvent::new(FileOperation::DebugMessage, 1)
            .with_path("é".repeat(ATOMIC_WRITE_LIMIT));
        let frame = encode(&event).unwrap();
        assert!(frame.len() <= ATOMIC_WRITE_LIMIT);
        assert!(std::str::from_utf8(&frame[4..]).is_ok());
    }

    #[test]
    fn truncate_path_to_fit_leaves_small_events_alone() {
        let event = read_event();
        assert_eq!(truncate_path_to_fit(event.clone()), event);
    }

    #[test]
    fn truncated_command_line_encodes() {
        let event = AccessEvent::new(FileOperation::ProcessCommandLine, 9)
            .with_path("arg ".repeat(ATOMIC_WRITE_LIMIT));
        let fitted = truncate_path_to_fit(event);
        assert_eq!(encode(&fitted).unwrap().len(), ATOMIC_WRITE_LIMIT);
    }

    #[test]
    fn path_may_contain_separator_after_substitution_only() {
        let payload = b"sh|1|1|0|0|0|10|0|/odd|name\n";
        let decoded = decode(payload).unwrap();
        assert_eq!(decoded.path, "/odd|name");
    }

    #[test]
    fn unknown_opcode_is_a_decode_error() {
        let err = decode(b"sh|1|1|0|0|0|99|0|/x\n").unwrap_err();
        assert!(matches!(err, SandtraceError::Decode { .. }));
    }

    #[test]
    fn too_few_fields_is_a_decode_error() {
        let err = decode(b"sh|1|1|0\n").unwrap_err();
        assert!(err.to_string().contains("expected 9 fields"));
    }

    #[test]
    fn unparsable_number_becomes_zero() {
        let decoded = decode(b"sh|abc|1|0|0|0|10|0|/x\n").unwrap();
        assert_eq!(decoded.pid, 0);
        assert_eq!(decoded.path, "/x");
    }

    #[test]
    fn frame_reader_yields_reports_and_markers_in_order() {
        let mut stream = encode(&read_event()).unwrap();
        stream.extend_from_slice(&Marker::NoActiveProcesses.to_frame());
        stream.extend_from_slice(&Marker::EndOfReports.to_frame());

        let mut reader = FrameReader::new(stream.as_slice());
        assert!(matches!(reader.next_frame().unwrap(), Some(Frame::Report(_))));
        assert_eq!(
            reader.next_frame().unwrap(),
            Some(Frame::Marker(Marker::NoActiveProcesses))
        );
        assert_eq!(
            reader.next_frame().unwrap(),
            Some(Frame::Marker(Marker::EndOfReports))
        );
        assert_eq!(reader.next_frame().unwrap(), None);
    }

    #[test]
    fn frame_reader_rejects_truncated_payload() {
        let frame = encode(&read_event()).unwrap();
        let mut reader = FrameReader::new(&frame[..frame.len() - 3]);
        assert!(matches!(
            reader.next_frame(),
            Err(SandtraceError::Decode { .. })
        ));
    }

    #[test]
    fn frame_reader_rejects_unknown_marker() {
        let stream = (-7i32).to_le_bytes();
        let mut reader = FrameReader::new(stream.as_slice());
        assert!(reader.next_frame().is_err());
    }
}
