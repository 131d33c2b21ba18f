//! Socket and log-file path helpers, plus the transport selector.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Default socket path for the mylog collector.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/mylog.sock";

/// Default target log file.
pub const DEFAULT_LOG_FILE: &str = "/var/log/my_simple_imuxsock.log";

/// Environment variable to override the socket path.
pub const SOCKET_ENV_VAR: &str = "MYLOG_SOCKET";

/// Get the socket path to use.
///
/// Checks the `MYLOG_SOCKET` environment variable first,
/// falling back to the default path `/tmp/mylog.sock`.
#[must_use]
pub fn get_socket_path() -> PathBuf {
    std::env::var(SOCKET_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET_PATH))
}

/// Socket type used for the listening endpoint.
///
/// Datagram sockets preserve message boundaries: one `send` is one message.
/// Stream sockets treat every successful read as one message, so a peer that
/// writes quickly may see several lines coalesced into a single record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Datagram,
    Stream,
}

/// Error returned when parsing an unknown transport name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown transport `{0}` (expected `datagram` or `stream`)")]
pub struct ParseTransportError(String);

impl FromStr for Transport {
    type Err = ParseTransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "datagram" | "dgram" => Ok(Self::Datagram),
            "stream" => Ok(Self::Stream),
            _ => Err(ParseTransportError(s.to_string())),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datagram => f.write_str("datagram"),
            Self::Stream => f.write_str("stream"),
        }
    }
}
