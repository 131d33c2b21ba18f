//! Socket endpoint: bind, receive, close.
//!
//! The socket file is a scoped resource. Any stale entry is removed before
//! binding, and the entry is removed again on [`Endpoint::close`] or when the
//! endpoint is dropped.

use crate::config::DaemonConfig;
use crate::error::{BindError, ReceiveError, ShutdownError};
use mylog_protocol::{LogMessage, MAX_MESSAGE_SIZE, MAX_PAYLOAD_LEN, Transport};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncReadExt, Interest};
use tokio::net::{UnixDatagram, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

/// Paths currently bound by an endpoint in this process
static BOUND_PATHS: LazyLock<Mutex<HashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Capacity of the queue between stream connections and `receive`
const STREAM_QUEUE_CAPACITY: usize = 256;

/// Ask the kernel for the real datagram length so truncation can be reported
#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_TRUNC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

/// Endpoint state as seen by `receive`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Bound,
    Closed,
}

/// Registry slot for a bound path, released on drop
struct PathClaim(PathBuf);

impl PathClaim {
    fn acquire(path: &Path) -> Result<Self, BindError> {
        if !BOUND_PATHS.lock().insert(path.to_path_buf()) {
            return Err(BindError::new(
                path,
                io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "path is already bound by this process",
                ),
            ));
        }
        Ok(Self(path.to_path_buf()))
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        BOUND_PATHS.lock().remove(&self.0);
    }
}

enum Socket {
    Datagram(UnixDatagram),
    Stream {
        incoming: mpsc::Receiver<io::Result<LogMessage>>,
        acceptor: JoinHandle<()>,
    },
}

/// A bound, listening socket endpoint
pub struct Endpoint {
    path: PathBuf,
    transport: Transport,
    state: EndpointState,
    socket: Option<Socket>,
    receive_timeout: Option<Duration>,
    _claim: PathClaim,
}

impl Endpoint {
    /// Bind using the listener settings from the configuration.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_config(config: &DaemonConfig) -> Result<Self, BindError> {
        Ok(Self::bind(&config.socket, config.transport, config.socket_mode)?
            .with_receive_timeout(config.receive_timeout()))
    }

    /// Remove any stale entry at `path`, then bind a socket there.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(path: &Path, transport: Transport, mode: u32) -> Result<Self, BindError> {
        let claim = PathClaim::acquire(path)?;
        let bind_err = |source: io::Error| BindError::new(path, source);

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(bind_err)?;
            }
        }

        remove_stale_entry(path).map_err(bind_err)?;

        let socket = match transport {
            Transport::Datagram => Socket::Datagram(UnixDatagram::bind(path).map_err(bind_err)?),
            Transport::Stream => {
                let listener = UnixListener::bind(path).map_err(bind_err)?;
                let (tx, incoming) = mpsc::channel(STREAM_QUEUE_CAPACITY);
                let acceptor = tokio::spawn(accept_loop(listener, tx));
                Socket::Stream { incoming, acceptor }
            }
        };

        // Construct before setting permissions so a failure below still
        // removes the socket file on drop
        let endpoint = Self {
            path: path.to_path_buf(),
            transport,
            state: EndpointState::Bound,
            socket: Some(socket),
            receive_timeout: None,
            _claim: claim,
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(mode);
            std::fs::set_permissions(path, permissions).map_err(bind_err)?;
        }

        tracing::info!(
            socket = %path.display(),
            transport = %transport,
            "Endpoint bound"
        );
        Ok(endpoint)
    }

    /// Fail `receive` with [`ReceiveError::TimedOut`] after waiting this long
    pub fn with_receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    /// Wait for the next non-empty message.
    ///
    /// Returns `Ok(None)` once the endpoint is closed. Cancel safe.
    pub async fn receive(&mut self) -> Result<Option<LogMessage>, ReceiveError> {
        match self.receive_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.next_message()).await {
                Ok(result) => result,
                Err(_) => Err(ReceiveError::TimedOut(limit)),
            },
            None => self.next_message().await,
        }
    }

    async fn next_message(&mut self) -> Result<Option<LogMessage>, ReceiveError> {
        if self.state == EndpointState::Closed {
            return Ok(None);
        }
        let Some(socket) = self.socket.as_mut() else {
            return Ok(None);
        };

        match socket {
            Socket::Datagram(sock) => loop {
                let (payload, total) = recv_datagram(sock).await?;
                match LogMessage::from_received(&payload, total) {
                    Some(message) => return Ok(Some(message)),
                    None => tracing::trace!("Ignoring empty datagram"),
                }
            },
            Socket::Stream { incoming, .. } => match incoming.recv().await {
                Some(result) => Ok(Some(result?)),
                None => Ok(None),
            },
        }
    }

    /// Stop accepting input; later calls to `receive` return `Ok(None)`.
    ///
    /// The socket file stays in place until [`Endpoint::close`].
    pub fn shutdown(&mut self) {
        if self.state == EndpointState::Closed {
            return;
        }
        self.state = EndpointState::Closed;
        if let Some(Socket::Stream { incoming, acceptor }) = self.socket.as_mut() {
            acceptor.abort();
            incoming.close();
        }
        tracing::debug!(socket = %self.path.display(), "Endpoint stopped accepting");
    }

    /// Close the socket and remove its filesystem entry
    pub fn close(mut self) -> Result<(), ShutdownError> {
        self.shutdown();
        self.release()
    }

    fn release(&mut self) -> Result<(), ShutdownError> {
        // Dropping the socket closes the descriptor
        if self.socket.take().is_none() {
            return Ok(());
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(socket = %self.path.display(), "Endpoint closed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ShutdownError {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "Failed to clean up socket");
        }
    }
}

/// Remove whatever occupies `path`; a missing entry is fine
fn remove_stale_entry(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::warn!(socket = %path.display(), "Removed stale socket file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Receive one datagram, returning the bytes kept and the length sent
async fn recv_datagram(socket: &UnixDatagram) -> io::Result<(Vec<u8>, usize)> {
    let fd = socket.as_raw_fd();
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

    let total = socket
        .async_io(Interest::READABLE, || {
            // SAFETY: `buf` is valid for writes of `buf.len()` bytes and `fd`
            // stays open for as long as `socket` is borrowed.
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), RECV_FLAGS) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        })
        .await?;

    buf.truncate(total.min(MAX_MESSAGE_SIZE));
    Ok((buf, total))
}

/// Accept stream connections and forward what they send
async fn accept_loop(listener: UnixListener, tx: mpsc::Sender<io::Result<LogMessage>>) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _addr)) => {
                        connections.spawn(read_connection(stream, tx.clone()));
                    }
                    Err(e) => {
                        if tx.send(Err(e)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = tx.closed() => break,
        }
    }
}

/// Every read on a connection is one message.
///
/// Reads stop one byte short of the buffer size, so a long write is split
/// across records instead of losing bytes.
async fn read_connection(mut stream: UnixStream, tx: mpsc::Sender<io::Result<LogMessage>>) {
    let mut buf = vec![0u8; MAX_PAYLOAD_LEN];

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        };

        if let Some(message) = LogMessage::from_received(&buf[..n], n) {
            if tx.send(Ok(message)).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn sock_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    async fn send_datagram(path: &Path, payload: &[u8]) {
        let client = UnixDatagram::unbound().unwrap();
        client.send_to(payload, path).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_close_rebind() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = sock_path(&dir, "cycle.sock");

        for _ in 0..3 {
            let endpoint = Endpoint::bind(&path, Transport::Datagram, 0o600).unwrap();
            assert!(path.exists());
            assert_eq!(endpoint.state(), EndpointState::Bound);
            endpoint.close().unwrap();
            assert!(!path.exists());
        }
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = sock_path(&dir, "stale.sock");

        // Leave a socket file behind with no listener
        drop(std::os::unix::net::UnixDatagram::bind(&path).unwrap());
        assert!(path.exists());

        let mut endpoint = Endpoint::bind(&path, Transport::Datagram, 0o600).unwrap();
        send_datagram(&path, b"after stale").await;
        let msg = endpoint.receive().await.unwrap().unwrap();
        assert_eq!(msg.as_bytes(), b"after stale");
    }

    #[tokio::test]
    async fn test_double_bind_in_process_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = sock_path(&dir, "once.sock");

        let first = Endpoint::bind(&path, Transport::Datagram, 0o600).unwrap();
        let err = Endpoint::bind(&path, Transport::Datagram, 0o600)
            .err()
            .unwrap();
        assert_eq!(err.source.kind(), io::ErrorKind::AddrInUse);
        // The first endpoint's socket file is untouched
        assert!(path.exists());

        drop(first);
        assert!(!path.exists());
        Endpoint::bind(&path, Transport::Datagram, 0o600).unwrap();
    }

    #[tokio::test]
    async fn test_bind_error_when_path_is_a_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = sock_path(&dir, "occupied");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"").unwrap();

        let err = Endpoint::bind(&path, Transport::Datagram, 0o600)
            .err()
            .unwrap();
        assert_eq!(err.path, path);
        assert!(err.os_code().is_some());
        // Registry slot was released
        std::fs::remove_dir_all(&path).unwrap();
        Endpoint::bind(&path, Transport::Datagram, 0o600).unwrap();
    }

    #[tokio::test]
    async fn test_bind_creates_parent_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/run/log.sock");
        let endpoint = Endpoint::bind(&path, Transport::Datagram, 0o600).unwrap();
        assert!(path.exists());
        endpoint.close().unwrap();
    }

    #[tokio::test]
    async fn test_socket_permissions_applied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let path = sock_path(&dir, "perm.sock");
        let _endpoint = Endpoint::bind(&path, Transport::Datagram, 0o640).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[tokio::test]
    async fn test_datagram_truncation_boundary() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = sock_path(&dir, "trunc.sock");
        let mut endpoint = Endpoint::bind(&path, Transport::Datagram, 0o600).unwrap();

        send_datagram(&path, &vec![b'a'; MAX_PAYLOAD_LEN]).await;
        let msg = endpoint.receive().await.unwrap().unwrap();
        assert_eq!(msg.len(), MAX_PAYLOAD_LEN);
        assert!(msg.truncation().is_none());

        send_datagram(&path, &vec![b'b'; MAX_MESSAGE_SIZE]).await;
        let msg = endpoint.receive().await.unwrap().unwrap();
        assert_eq!(msg.len(), MAX_PAYLOAD_LEN);
        let warning = msg.truncation().unwrap();
        assert_eq!(warning.received, MAX_MESSAGE_SIZE);
        assert_eq!(warning.kept, MAX_PAYLOAD_LEN);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_oversized_datagram_reports_real_length() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = sock_path(&dir, "big.sock");
        let mut endpoint = Endpoint::bind(&path, Transport::Datagram, 0o600).unwrap();

        send_datagram(&path, &vec![b'c'; 3000]).await;
        let msg = endpoint.receive().await.unwrap().unwrap();
        assert_eq!(msg.len(), MAX_PAYLOAD_LEN);
        assert_eq!(msg.truncation().unwrap().received, 3000);
    }

    #[tokio::test]
    async fn test_empty_datagram_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = sock_path(&dir, "empty.sock");
        let mut endpoint = Endpoint::bind(&path, Transport::Datagram, 0o600).unwrap();

        send_datagram(&path, b"").await;
        send_datagram(&path, b"real").await;
        let msg = endpoint.receive().await.unwrap().unwrap();
        assert_eq!(msg.as_bytes(), b"real");
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = sock_path(&dir, "quiet.sock");
        let mut endpoint = Endpoint::bind(&path, Transport::Datagram, 0o600)
            .unwrap()
            .with_receive_timeout(Some(Duration::from_millis(50)));

        let err = endpoint.receive().await.unwrap_err();
        assert!(matches!(err, ReceiveError::TimedOut(d) if d == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_receive_after_shutdown_is_closed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = sock_path(&dir, "closed.sock");
        let mut endpoint = Endpoint::bind(&path, Transport::Datagram, 0o600).unwrap();

        endpoint.shutdown();
        assert_eq!(endpoint.state(), EndpointState::Closed);
        assert!(endpoint.receive().await.unwrap().is_none());
        // File is released by close, not by shutdown
        assert!(path.exists());
        endpoint.close().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_close_tolerates_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = sock_path(&dir, "gone.sock");
        let endpoint = Endpoint::bind(&path, Transport::Datagram, 0o600).unwrap();
        std::fs::remove_file(&path).unwrap();
        endpoint.close().unwrap();
    }

    #[tokio::test]
    async fn test_stream_messages_per_connection() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = sock_path(&dir, "stream.sock");
        let mut endpoint = Endpoint::bind(&path, Transport::Stream, 0o600).unwrap();

        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_all(b"over a stream").await.unwrap();
        client.shutdown().await.unwrap();

        let msg = endpoint.receive().await.unwrap().unwrap();
        assert_eq!(msg.as_bytes(), b"over a stream");

        endpoint.shutdown();
        assert!(endpoint.receive().await.unwrap().is_none());
        endpoint.close().unwrap();
        assert!(!path.exists());
    }

    /// Read records until their concatenated bytes reach `expected_len`
    async fn collect_stream(endpoint: &mut Endpoint, expected_len: usize) -> (Vec<u8>, usize) {
        let mut received = Vec::new();
        let mut records = 0;
        while received.len() < expected_len {
            let msg = endpoint.receive().await.unwrap().unwrap();
            assert!(msg.truncation().is_none());
            assert!(msg.len() <= MAX_PAYLOAD_LEN);
            received.extend_from_slice(msg.as_bytes());
            records += 1;
        }
        (received, records)
    }

    #[tokio::test]
    async fn test_stream_long_write_loses_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = sock_path(&dir, "stream-long.sock");
        let mut endpoint = Endpoint::bind(&path, Transport::Stream, 0o600).unwrap();

        let payload: Vec<u8> = (0..2000).map(|i| b'a' + (i % 26) as u8).collect();
        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();

        let (received, records) = collect_stream(&mut endpoint, payload.len()).await;
        assert_eq!(received, payload);
        assert!(records >= 2);
    }

    #[tokio::test]
    async fn test_stream_back_to_back_lines_coalesce_without_loss() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = sock_path(&dir, "stream-coalesce.sock");
        let mut endpoint = Endpoint::bind(&path, Transport::Stream, 0o600).unwrap();

        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_all(b"first line\n").await.unwrap();
        client.write_all(b"second line\n").await.unwrap();
        client.shutdown().await.unwrap();

        // Boundaries are up to the kernel: one record holding both lines, or
        // several records that concatenate back to the input
        let input = b"first line\nsecond line\n";
        let (received, records) = collect_stream(&mut endpoint, input.len()).await;
        assert_eq!(received, input);
        assert!((1..=input.len()).contains(&records));
    }
}
