//! mylog protocol - shared types for the local log collector and its clients.
//!
//! This crate provides:
//! - [`LogMessage`] with the fixed-size receive semantics ([`MAX_MESSAGE_SIZE`])
//! - [`LogRecord`], the `Received log: <message>` line format
//! - [`TruncationWarning`] for payloads that did not fit
//! - [`Transport`] and socket path helpers via [`get_socket_path`]
//!
//! # Wire Format
//!
//! There is no framing. Each receive call on the socket yields exactly one
//! message, so producers should send one log line per `send`.
//!
//! # Example
//!
//! ```rust
//! use mylog_protocol::{LogMessage, MAX_PAYLOAD_LEN};
//!
//! let msg = LogMessage::new("disk almost full").unwrap();
//! assert_eq!(msg.record().to_line(), "Received log: disk almost full\n");
//!
//! let long = LogMessage::new(vec![b'x'; 2048]).unwrap();
//! assert_eq!(long.len(), MAX_PAYLOAD_LEN);
//! assert!(long.truncation().is_some());
//! ```

mod message;
mod socket;

// Re-export main types at crate root
pub use message::{
    LogMessage, LogRecord, MAX_MESSAGE_SIZE, MAX_PAYLOAD_LEN, RECORD_PREFIX, TruncationWarning,
};
pub use socket::{
    DEFAULT_LOG_FILE, DEFAULT_SOCKET_PATH, ParseTransportError, SOCKET_ENV_VAR, Transport,
    get_socket_path,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_constants() {
        const {
            assert!(MAX_PAYLOAD_LEN + 1 == MAX_MESSAGE_SIZE);
        }
    }

    #[test]
    fn test_reexports_accessible() {
        let _ = Transport::Datagram;
        let _ = RECORD_PREFIX;
        let _ = DEFAULT_SOCKET_PATH;
        let _ = DEFAULT_LOG_FILE;
    }
}
