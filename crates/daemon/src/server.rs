//! Receive loop and client helpers.
//!
//! The server owns the bound endpoint, hands every message to the log sink,
//! and drives the lifecycle from Running to Stopped when the shutdown signal
//! fires.

use crate::config::DispatchMode;
use crate::error::ReceiveError;
use crate::listener::Endpoint;
use crate::sink::{CommitOrder, LogSink};
use crate::state::{Lifecycle, ServiceState};
use mylog_protocol::{LogMessage, Transport};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixDatagram, UnixStream};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;

/// Pause after a receive error so a persistent fault does not spin
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Receive loop for one endpoint
pub struct Server {
    /// Bound endpoint
    endpoint: Endpoint,
    /// Where messages are delivered
    sink: Arc<LogSink>,
    /// Lifecycle and counters
    state: Arc<ServiceState>,
    /// Shutdown signal receiver
    shutdown_rx: broadcast::Receiver<()>,
    /// How messages reach the sink
    dispatch: DispatchMode,
    /// Bounds deliveries in flight
    permits: Arc<Semaphore>,
    /// Keeps worker commits in receive order
    order: Arc<CommitOrder>,
}

impl Server {
    /// Create a new server
    pub fn new(
        endpoint: Endpoint,
        sink: Arc<LogSink>,
        state: Arc<ServiceState>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            endpoint,
            sink,
            state,
            shutdown_rx,
            dispatch: DispatchMode::default(),
            permits: Arc::new(Semaphore::new(1)),
            order: Arc::new(CommitOrder::new()),
        }
    }

    /// Choose the dispatch model and the in-flight bound for worker dispatch
    pub fn with_dispatch(mut self, dispatch: DispatchMode, max_in_flight: usize) -> Self {
        self.dispatch = dispatch;
        self.permits = Arc::new(Semaphore::new(max_in_flight.max(1)));
        self
    }

    /// Run until the shutdown signal fires or the endpoint closes
    pub async fn run(mut self) {
        self.state.transition(Lifecycle::Running);
        tracing::info!(
            socket = %self.endpoint.path().display(),
            transport = %self.endpoint.transport(),
            log_file = %self.sink.path().display(),
            dispatch = ?self.dispatch,
            "Server receiving"
        );

        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                received = self.endpoint.receive() => {
                    match received {
                        Ok(Some(message)) => {
                            self.dispatch_message(message, &mut in_flight).await;
                        }
                        Ok(None) => {
                            tracing::info!(state = ?self.endpoint.state(), "Endpoint closed");
                            break;
                        }
                        Err(ReceiveError::TimedOut(limit)) => {
                            tracing::debug!(timeout = ?limit, "Receive timed out");
                        }
                        Err(e) => {
                            self.state.record_receive_error();
                            tracing::warn!(error = %e, "Receive error");
                            tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }

            // Reap finished workers
            while in_flight.try_join_next().is_some() {}
        }

        self.state.transition(Lifecycle::ShuttingDown);
        self.endpoint.shutdown();

        // Let in-flight deliveries finish
        let pending = in_flight.len();
        if pending > 0 {
            tracing::debug!(pending, "Waiting for in-flight deliveries");
        }
        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Delivery task failed");
            }
        }

        if let Err(e) = self.endpoint.close() {
            tracing::warn!(error = %e, "Shutdown error");
        }

        self.state.transition(Lifecycle::Stopped);
        let stats = self.state.stats();
        tracing::info!(
            received = stats.received,
            persisted = stats.persisted,
            truncated = stats.truncated,
            write_failures = stats.write_failures,
            receive_errors = stats.receive_errors,
            uptime = ?self.state.uptime(),
            "Server stopped"
        );
    }

    async fn dispatch_message(&self, message: LogMessage, in_flight: &mut JoinSet<()>) {
        let truncated = message.truncation();
        if let Some(warning) = truncated {
            tracing::warn!(
                received = warning.received,
                kept = warning.kept,
                "Message truncated"
            );
        }
        self.state.record_received(truncated.is_some());

        let sink = Arc::clone(&self.sink);
        let state = Arc::clone(&self.state);

        match self.dispatch {
            DispatchMode::Sequential => {
                let result =
                    tokio::task::spawn_blocking(move || deliver(&sink, &state, &message)).await;
                if let Err(e) = result {
                    tracing::error!(error = %e, "Delivery task failed");
                }
            }
            DispatchMode::Worker => {
                // The semaphore is never closed, so acquiring only waits
                let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                    return;
                };
                // Ticket only once the task is certain to be spawned
                let order = Arc::clone(&self.order);
                let ticket = order.ticket();
                in_flight.spawn_blocking(move || {
                    let _turn = order.wait_turn(ticket);
                    deliver(&sink, &state, &message);
                    drop(permit);
                });
            }
        }
    }
}

/// Echo and persist one message, recording the outcome
fn deliver(sink: &LogSink, state: &ServiceState, message: &LogMessage) {
    match sink.deliver(message) {
        Ok(()) => state.record_persisted(),
        Err(e) => {
            state.record_write_failure();
            tracing::warn!(error = %e, "Write error");
        }
    }
}

/// Check if something is listening by attempting to connect to the socket.
///
/// Only a refused connection or a missing path counts as free. Any other
/// failure (a socket of the other type, no permission) means the path is
/// occupied by something we must not unlink.
pub async fn is_daemon_running(socket_path: &Path, transport: Transport) -> bool {
    let result = match transport {
        Transport::Datagram => match UnixDatagram::unbound() {
            Ok(sock) => sock.connect(socket_path),
            Err(e) => {
                tracing::debug!(error = %e, "Could not create client socket");
                return false;
            }
        },
        Transport::Stream => UnixStream::connect(socket_path).await.map(drop),
    };

    match result {
        Ok(()) => true,
        Err(e) => !matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
        ),
    }
}

/// Send one log message to the collector
pub async fn send_log_message(
    socket_path: &Path,
    transport: Transport,
    message: &[u8],
) -> std::io::Result<()> {
    match transport {
        Transport::Datagram => {
            let sock = UnixDatagram::unbound()?;
            sock.send_to(message, socket_path).await?;
        }
        Transport::Stream => {
            let mut stream = UnixStream::connect(socket_path).await?;
            stream.write_all(message).await?;
            stream.shutdown().await?;
        }
    }
    Ok(())
}
