//! Log message and log record types.
//!
//! A [`LogMessage`] is what one receive operation produced; a [`LogRecord`] is
//! how it is rendered to the log file and to standard output.

use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Size of the receive buffer, in bytes.
///
/// One byte is reserved for a terminator, so a message carries at most
/// [`MAX_PAYLOAD_LEN`] bytes.
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Largest message payload that is kept unmodified.
pub const MAX_PAYLOAD_LEN: usize = MAX_MESSAGE_SIZE - 1;

/// Fixed prefix of every log record.
pub const RECORD_PREFIX: &str = "Received log: ";

/// A payload exceeded [`MAX_PAYLOAD_LEN`] and was cut down.
///
/// This is not a failure: the kept prefix is still delivered.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("message of {received} bytes truncated to {kept} bytes")]
pub struct TruncationWarning {
    /// Number of bytes the peer sent, as far as the transport could tell.
    pub received: usize,
    /// Number of bytes kept.
    pub kept: usize,
}

/// One received log message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    bytes: Vec<u8>,
    received_len: usize,
}

impl LogMessage {
    /// Build a message from the bytes read by one receive call.
    ///
    /// `payload` holds the bytes that landed in the receive buffer and
    /// `received_len` the length the peer actually sent (it may be larger
    /// when the transport reports the untruncated size). The payload is cut
    /// to [`MAX_PAYLOAD_LEN`] bytes and treated as a C string: anything from
    /// the first NUL byte on is dropped.
    ///
    /// Returns `None` when nothing is left to log.
    #[must_use]
    pub fn from_received(payload: &[u8], received_len: usize) -> Option<Self> {
        let kept = &payload[..payload.len().min(MAX_PAYLOAD_LEN)];
        let kept = match kept.iter().position(|&b| b == 0) {
            Some(nul) => &kept[..nul],
            None => kept,
        };
        if kept.is_empty() {
            return None;
        }

        Some(Self {
            bytes: kept.to_vec(),
            received_len: received_len.max(payload.len()),
        })
    }

    /// Build a message from a complete payload.
    #[must_use]
    pub fn new(payload: impl AsRef<[u8]>) -> Option<Self> {
        let payload = payload.as_ref();
        Self::from_received(payload, payload.len())
    }

    /// Message bytes as kept.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Payload length; never zero, empty payloads are not messages
    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Message as text, with invalid UTF-8 replaced.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// The truncation that happened on receipt, if any.
    #[must_use]
    pub fn truncation(&self) -> Option<TruncationWarning> {
        (self.received_len > MAX_PAYLOAD_LEN).then_some(TruncationWarning {
            received: self.received_len,
            kept: self.bytes.len(),
        })
    }

    /// Render this message as a log record.
    #[must_use]
    pub fn record(&self) -> LogRecord<'_> {
        LogRecord { message: self }
    }
}

/// The persisted form of a [`LogMessage`]: `Received log: <message>`.
#[derive(Debug, Clone, Copy)]
pub struct LogRecord<'a> {
    message: &'a LogMessage,
}

impl LogRecord<'_> {
    /// The record followed by a newline, ready to append.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for LogRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{RECORD_PREFIX}{}", self.message.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_format() {
        let msg = LogMessage::new("hello world").unwrap();
        assert_eq!(msg.record().to_string(), "Received log: hello world");
        assert_eq!(msg.record().to_line(), "Received log: hello world\n");
    }

    #[test]
    fn test_empty_payload_is_not_a_message() {
        assert!(LogMessage::new("").is_none());
        assert!(LogMessage::new([0u8, b'a']).is_none());
    }

    #[test]
    fn test_max_payload_kept_unmodified() {
        let payload = vec![b'a'; MAX_PAYLOAD_LEN];
        let msg = LogMessage::new(&payload).unwrap();
        assert_eq!(msg.as_bytes(), payload.as_slice());
        assert!(msg.truncation().is_none());
    }

    #[test]
    fn test_full_buffer_is_truncated() {
        let payload = vec![b'b'; MAX_MESSAGE_SIZE];
        let msg = LogMessage::new(&payload).unwrap();
        assert_eq!(msg.len(), MAX_PAYLOAD_LEN);
        assert_eq!(
            msg.truncation(),
            Some(TruncationWarning {
                received: MAX_MESSAGE_SIZE,
                kept: MAX_PAYLOAD_LEN,
            })
        );
    }

    #[test]
    fn test_reported_length_larger_than_buffer() {
        // Kernel reported a 4000 byte datagram, only the buffer's worth arrived
        let payload = vec![b'c'; MAX_MESSAGE_SIZE];
        let msg = LogMessage::from_received(&payload, 4000).unwrap();
        let warning = msg.truncation().unwrap();
        assert_eq!(warning.received, 4000);
        assert_eq!(warning.kept, MAX_PAYLOAD_LEN);
        assert_eq!(
            warning.to_string(),
            "message of 4000 bytes truncated to 1023 bytes"
        );
    }

    #[test]
    fn test_stops_at_nul() {
        let msg = LogMessage::new(b"abc\0def").unwrap();
        assert_eq!(msg.as_bytes(), b"abc");
        assert!(msg.truncation().is_none());
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let msg = LogMessage::new([b'o', b'k', 0xff]).unwrap();
        assert_eq!(msg.text(), "ok\u{fffd}");
    }
}
