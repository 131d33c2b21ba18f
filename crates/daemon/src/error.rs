//! Error types for the collector.
//!
//! Only [`BindError`] is fatal. The others are caught at the receive loop,
//! logged, and the loop keeps going. Truncation is reported through
//! `mylog_protocol::TruncationWarning`.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The socket endpoint could not be created or bound.
#[derive(Debug, Error)]
#[error("failed to bind {}: {source}", path.display())]
pub struct BindError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl BindError {
    pub fn new(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }

    /// Underlying OS error code, when there is one.
    #[must_use]
    pub fn os_code(&self) -> Option<i32> {
        self.source.raw_os_error()
    }
}

/// Waiting for a message failed.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// I/O failure on the socket.
    #[error("receive failed: {0}")]
    Io(#[from] io::Error),

    /// No message arrived within the configured receive timeout.
    #[error("no message received within {0:?}")]
    TimedOut(Duration),
}

/// A record could not be persisted to the target log file.
#[derive(Debug, Error)]
#[error("failed to write {}: {source}", path.display())]
pub struct WriteError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// The socket's filesystem entry could not be removed on close.
#[derive(Debug, Error)]
#[error("failed to remove socket {}: {source}", path.display())]
pub struct ShutdownError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}
