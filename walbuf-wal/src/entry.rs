//! Log entry types.
//!
//! Each record is a single JSON object terminated by `\n`:
//!
//! ```text
//! {"offset":1,"topic":"orders","payload":{"id":1}}\n
//! ```
//!
//! There is no length prefix or checksum; a line is valid when it parses.

use crate::error::WalError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic used when a caller does not name one.
pub const DEFAULT_TOPIC: &str = "default";

/// A record as stored in a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<P = Value> {
    pub offset: u64,
    pub topic: String,
    pub payload: P,
}

/// Borrowed view used on the write path so payloads are never cloned.
#[derive(Serialize)]
struct LogEntryRef<'a, P: ?Sized> {
    offset: u64,
    topic: &'a str,
    payload: &'a P,
}

/// Offset-only view used when scanning existing segments.
#[derive(Deserialize)]
struct OffsetProbe {
    offset: u64,
}

impl<P> LogEntry<P> {
    pub fn new(offset: u64, topic: impl Into<String>, payload: P) -> Self {
        Self {
            offset,
            topic: topic.into(),
            payload,
        }
    }
}

impl LogEntry<Value> {
    /// Parses one line (with or without the trailing newline).
    pub fn parse_line(line: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(trim_newline(line))
    }
}

/// Normalizes an optional topic: missing or empty falls back to
/// [`DEFAULT_TOPIC`].
pub fn topic_or_default(topic: Option<&str>) -> &str {
    match topic {
        Some(t) if !t.is_empty() => t,
        _ => DEFAULT_TOPIC,
    }
}

/// Serializes a record into a single newline-terminated line.
pub fn encode_line<P>(offset: u64, topic: &str, payload: &P) -> Result<Vec<u8>, WalError>
where
    P: Serialize + ?Sized,
{
    let entry = LogEntryRef {
        offset,
        topic,
        payload,
    };
    let mut line = serde_json::to_vec(&entry).map_err(WalError::Encode)?;
    line.push(b'\n');
    Ok(line)
}

/// Extracts just the offset of a stored line, ignoring the payload shape.
pub fn probe_offset(line: &[u8]) -> Option<u64> {
    serde_json::from_slice::<OffsetProbe>(trim_newline(line))
        .ok()
        .map(|p| p.offset)
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
