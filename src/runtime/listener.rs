//! Unix domain socket listener.
//!
//! The socket is created with socket2 so that binding and listening are
//! separate steps: the socket file is restricted to its owner (0600) after
//! `bind` and before `listen`, and connection attempts are refused until
//! `listen` runs. No other user can reach the socket at any point.
//!
//! The listener owns its socket file and unlinks it when dropped.

use crate::runtime::buffer::{LineBuffer, DEFAULT_MAX_LINE_LENGTH};
use crate::runtime::connection::{Connection, DEFAULT_WRITE_TIMEOUT};
use socket2::{Domain, SockAddr, Socket, Type};
use std::fmt;
use std::fs;
use std::future::Future;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Longest socket path accepted, terminator excluded.
///
/// `sun_path` is 104 bytes on macOS and 108 on Linux; use the smaller.
pub const MAX_SOCKET_PATH: usize = 103;

/// Permissions of the socket file.
const SOCKET_MODE: u32 = 0o600;

/// Pending connection backlog.
const BACKLOG: i32 = 16;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors binding the listening socket.
#[derive(Debug)]
pub enum BindError {
    /// Another live server owns the path, or a non-socket file sits there.
    InUse(PathBuf),
    /// Insufficient permissions on the path or its directory.
    PermissionDenied(PathBuf, io::Error),
    /// The path does not fit in `sockaddr_un`.
    PathTooLong { path: PathBuf, limit: usize },
    /// Any other socket or filesystem failure.
    Io(PathBuf, io::Error),
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindError::InUse(path) => {
                write!(f, "socket '{}' is already in use", path.display())
            }
            BindError::PermissionDenied(path, e) => {
                write!(f, "permission denied binding '{}': {}", path.display(), e)
            }
            BindError::PathTooLong { path, limit } => write!(
                f,
                "socket path too long ({} bytes, max {}): {}",
                path.as_os_str().len(),
                limit,
                path.display()
            ),
            BindError::Io(path, e) => {
                write!(f, "failed to bind '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BindError::PermissionDenied(_, e) | BindError::Io(_, e) => Some(e),
            _ => None,
        }
    }
}

fn classify(path: &Path, e: io::Error) -> BindError {
    match e.kind() {
        io::ErrorKind::AddrInUse => BindError::InUse(path.to_path_buf()),
        io::ErrorKind::PermissionDenied => BindError::PermissionDenied(path.to_path_buf(), e),
        _ => BindError::Io(path.to_path_buf(), e),
    }
}

/// Listening Unix socket that produces framed connections.
#[derive(Debug)]
pub struct Listener {
    inner: UnixListener,
    path: PathBuf,
    /// (device, inode) of the socket file we created.
    file_id: Option<(u64, u64)>,
    max_line_length: usize,
    write_timeout: Duration,
}

impl Listener {
    /// Bind and listen on `path`.
    ///
    /// A socket file left behind by a server that is no longer running is
    /// replaced. Must be called from within a tokio runtime.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self, BindError> {
        let path = path.into();

        if path.as_os_str().len() > MAX_SOCKET_PATH {
            return Err(BindError::PathTooLong {
                path,
                limit: MAX_SOCKET_PATH,
            });
        }

        remove_stale_socket(&path)?;

        let socket =
            Socket::new(Domain::UNIX, Type::STREAM, None).map_err(|e| classify(&path, e))?;
        let addr = SockAddr::unix(&path).map_err(|e| classify(&path, e))?;
        socket.bind(&addr).map_err(|e| classify(&path, e))?;

        // From here on the file exists and is ours; undo it on failure.
        let finish = || -> io::Result<UnixListener> {
            fs::set_permissions(&path, fs::Permissions::from_mode(SOCKET_MODE))?;
            socket.listen(BACKLOG)?;
            socket.set_nonblocking(true)?;
            let listener = std::os::unix::net::UnixListener::from(OwnedFd::from(socket));
            UnixListener::from_std(listener)
        };

        let inner = match finish() {
            Ok(inner) => inner,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(classify(&path, e));
            }
        };

        let file_id = fs::symlink_metadata(&path)
            .ok()
            .map(|meta| (meta.dev(), meta.ino()));

        info!(path = %path.display(), "Socket listening");

        Ok(Self {
            inner,
            path,
            file_id,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    /// Cap the line length of accepted connections.
    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    /// Bound the per-line write time of accepted connections.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Path of the socket file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one connection.
    pub async fn accept(&self) -> io::Result<Connection> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(Connection::from_unix_with_buffer(
            stream,
            LineBuffer::with_max_line_length(self.max_line_length),
        )
        .with_write_timeout(self.write_timeout))
    }

    /// Accept connections until `shutdown` turns true.
    ///
    /// Each connection is handed to `on_accept` on its own task; the loop
    /// never waits for the callback. A failed accept is logged and retried.
    pub async fn accept_loop<F, Fut>(&self, on_accept: F, mut shutdown: watch::Receiver<bool>)
    where
        F: Fn(Connection) -> Fut + Send + Sync,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.accept() => match accepted {
                    Ok(conn) => {
                        debug!(conn = %conn.id(), "New connection");
                        tokio::spawn(on_accept(conn));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }

        debug!(path = %self.path.display(), "Accept loop stopped");
    }

    /// Stop listening and remove the socket file.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // Only unlink the file we created; a newer server may own the path.
        let current = fs::symlink_metadata(&self.path)
            .ok()
            .map(|meta| (meta.dev(), meta.ino()));
        if current.is_none() || current != self.file_id {
            return;
        }

        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove socket file"),
        }
    }
}

/// Remove a socket file nobody is listening on.
///
/// The test connect is nonblocking: a live server with a full backlog
/// answers `EAGAIN` and still counts as in use.
fn remove_stale_socket(path: &Path) -> Result<(), BindError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(classify(path, e)),
    };

    if !meta.file_type().is_socket() {
        return Err(BindError::InUse(path.to_path_buf()));
    }

    let tester = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(|e| classify(path, e))?;
    tester.set_nonblocking(true).map_err(|e| classify(path, e))?;
    let addr = SockAddr::unix(path).map_err(|e| classify(path, e))?;

    match tester.connect(&addr) {
        Ok(()) => Err(BindError::InUse(path.to_path_buf())),
        Err(e)
            if e.kind() == io::ErrorKind::WouldBlock
                || e.raw_os_error() == Some(libc::EINPROGRESS) =>
        {
            Err(BindError::InUse(path.to_path_buf()))
        }
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            warn!(path = %path.display(), "Removing stale socket file");
            match fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(classify(path, e)),
                _ => Ok(()),
            }
        }
        // Vanished since the stat; nothing to remove
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(classify(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_bind_restricts_permissions() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("srv");

        let _listener = Listener::bind(&path).unwrap();

        let meta = fs::metadata(&path).unwrap();
        assert!(meta.file_type().is_socket());
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_bind_twice_is_in_use() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("srv");

        let _first = Listener::bind(&path).unwrap();
        match Listener::bind(&path) {
            Err(BindError::InUse(p)) => assert_eq!(p, path),
            other => panic!("unexpected: {:?}", other),
        }
        // The live server's socket survives the failed attempt
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("srv");

        // std listeners do not unlink on drop, leaving a dead socket file
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let listener = Listener::bind(&path).unwrap();
        let _client = tokio::net::UnixStream::connect(&path).await.unwrap();
        let _conn = listener.accept().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_live_server_with_full_backlog_is_in_use() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("srv");

        let server = Socket::new(Domain::UNIX, Type::STREAM, None).unwrap();
        let addr = SockAddr::unix(&path).unwrap();
        server.bind(&addr).unwrap();
        server.listen(0).unwrap();

        // Queue connections nobody accepts until the kernel pushes back
        let mut queued = Vec::new();
        loop {
            let client = Socket::new(Domain::UNIX, Type::STREAM, None).unwrap();
            client.set_nonblocking(true).unwrap();
            match client.connect(&addr) {
                Ok(()) => queued.push(client),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("unexpected: {:?}", e),
            }
            assert!(queued.len() < 1024, "backlog never filled");
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let check_path = path.clone();
        std::thread::spawn(move || {
            let _ = tx.send(remove_stale_socket(&check_path));
        });
        match rx
            .recv_timeout(Duration::from_secs(2))
            .expect("stale socket check blocked on a full backlog")
        {
            Err(BindError::InUse(p)) => assert_eq!(p, path),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_regular_file_is_not_replaced() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("srv");
        fs::write(&path, b"not a socket").unwrap();

        assert!(matches!(Listener::bind(&path), Err(BindError::InUse(_))));
        assert_eq!(fs::read(&path).unwrap(), b"not a socket");
    }

    #[tokio::test]
    async fn test_socket_path_length_validation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a".repeat(200));

        let err = Listener::bind(&path).unwrap_err();
        assert!(
            err.to_string().contains("too long"),
            "Error should mention path too long: {err}"
        );
    }

    #[tokio::test]
    async fn test_drop_unlinks_socket_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("srv");

        let listener = Listener::bind(&path).unwrap();
        assert!(path.exists());
        listener.close();
        assert!(!path.exists());

        // A client now fails fast instead of hanging
        assert!(tokio::net::UnixStream::connect(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_accept_loop_hands_off_connections() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("srv");
        let listener = Listener::bind(&path).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            listener
                .accept_loop(
                    move |conn| {
                        let conn_tx = conn_tx.clone();
                        async move {
                            let _ = conn_tx.send(conn);
                        }
                    },
                    shutdown_rx,
                )
                .await;
        });

        let client = Connection::connect(&path).await.unwrap();
        client.write_line("hello").await.unwrap();

        let conn = tokio::time::timeout(Duration::from_secs(2), conn_rx.recv())
            .await
            .expect("Timed out waiting for accepted connection")
            .unwrap();
        assert_eq!(conn.read_line().await.unwrap().as_deref(), Some("hello"));

        shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), accept_task)
            .await
            .expect("accept loop should stop on shutdown")
            .unwrap();

        // Listener dropped with the task
        assert!(!path.exists());
    }
}
