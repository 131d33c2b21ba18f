//! Log sink: appends records to the target file and mirrors them to stdout.
//!
//! Every append is its own open/write/close cycle. Appends are serialised so
//! concurrent workers never interleave partial lines, and [`CommitOrder`]
//! keeps them in the order the messages were received.

use crate::config::SinkConfig;
use crate::error::WriteError;
use mylog_protocol::LogMessage;
use parking_lot::{Condvar, Mutex};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Destination for echoed records
pub type EchoWriter = Box<dyn Write + Send>;

pub struct LogSink {
    /// Target log file
    path: PathBuf,
    /// Held across open-append-close
    file_lock: Mutex<()>,
    /// Mirror destination, `None` when echo is disabled
    echo: Option<Mutex<EchoWriter>>,
    /// Flush each record to storage before returning
    sync: bool,
}

impl LogSink {
    /// Create a sink that echoes to standard output
    pub fn new(config: &SinkConfig) -> Self {
        let echo: Option<EchoWriter> = config.echo.then(|| Box::new(io::stdout()) as EchoWriter);
        Self::with_echo(config, echo)
    }

    /// Create a sink with an explicit echo destination
    pub fn with_echo(config: &SinkConfig, echo: Option<EchoWriter>) -> Self {
        Self {
            path: config.log_file.clone(),
            file_lock: Mutex::new(()),
            echo: echo.map(Mutex::new),
            sync: config.sync,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record to the target log file.
    ///
    /// The record is on storage when this returns `Ok` (unless `sync` is off).
    pub fn append(&self, message: &LogMessage) -> Result<(), WriteError> {
        let line = message.record().to_line();

        let _guard = self.file_lock.lock();
        self.write_line(line.as_bytes()).map_err(|source| WriteError {
            path: self.path.clone(),
            source,
        })
    }

    fn write_line(&self, line: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line)?;
        if self.sync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Mirror one record to the echo destination.
    pub fn echo(&self, message: &LogMessage) {
        let Some(echo) = &self.echo else {
            return;
        };

        let line = message.record().to_line();
        let mut writer = echo.lock();
        let result = writer.write_all(line.as_bytes());
        if let Err(e) = result.and_then(|()| writer.flush()) {
            tracing::error!(error = %e, "Failed to echo record");
        }
    }

    /// Echo, then append.
    ///
    /// The echo happens first so the message is visible even when the
    /// append fails.
    pub fn deliver(&self, message: &LogMessage) -> Result<(), WriteError> {
        self.echo(message);
        self.append(message)
    }
}

/// Admits concurrent deliveries one at a time, in ticket order.
///
/// Tickets are taken on the receive path; a worker holding ticket `n` waits
/// until every lower ticket has finished.
pub struct CommitOrder {
    issued: AtomicU64,
    next: Mutex<u64>,
    turn: Condvar,
}

/// The right to commit; the next ticket is admitted when this drops
pub struct Turn<'a> {
    order: &'a CommitOrder,
}

impl CommitOrder {
    pub fn new() -> Self {
        Self {
            issued: AtomicU64::new(0),
            next: Mutex::new(0),
            turn: Condvar::new(),
        }
    }

    /// Take the next ticket. Every ticket taken must be waited on, or later
    /// tickets never get their turn.
    pub fn ticket(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::Relaxed)
    }

    /// Block until `ticket` is next in line
    pub fn wait_turn(&self, ticket: u64) -> Turn<'_> {
        let mut next = self.next.lock();
        while *next != ticket {
            self.turn.wait(&mut next);
        }
        Turn { order: self }
    }
}

impl Default for CommitOrder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        *self.order.next.lock() += 1;
        self.order.turn.notify_all();
    }
}
