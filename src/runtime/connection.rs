//! Framed connections and the registry of live peers.
//!
//! A `Connection` wraps one stream socket and speaks newline-terminated
//! text lines. Reads and writes are independent: the read half sits behind
//! one async mutex and the write half behind another, so a reader task can
//! block on `read_line` while the broker writes to the same peer.
//!
//! `ConnectionRegistry` is the broker's set of connected peers. Every
//! operation takes the registry lock only for the list manipulation itself;
//! nothing blocks on I/O while holding it.

use crate::runtime::buffer::{LineBuffer, LineReader, LINE_TERMINATOR};
use slab::Slab;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{watch, Mutex as AsyncMutex};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long one line may take to leave before the peer is given up on.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-unique identifier of a connection.
///
/// Allocated from a monotonic counter, so ordering by id is accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Failure on a single connection.
#[derive(Debug)]
pub enum TransportError {
    /// The connection was closed locally.
    Closed,
    /// The line to send contains a line terminator.
    InvalidLine,
    /// The peer sent more than `limit` bytes without a terminator.
    LineTooLong { limit: usize },
    /// The peer did not take a line within `timeout`; the connection is
    /// closed since the frame may be partially written.
    WriteTimeout { timeout: Duration },
    /// The socket failed (peer reset, broken pipe, ...).
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "connection is closed"),
            TransportError::InvalidLine => {
                write!(f, "line must not contain a line terminator")
            }
            TransportError::LineTooLong { limit } => {
                write!(f, "line exceeds {} bytes", limit)
            }
            TransportError::WriteTimeout { timeout } => {
                write!(f, "write timed out after {:?}", timeout)
            }
            TransportError::Io(e) => write!(f, "transport I/O error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// A newline-framed, bidirectional text connection.
pub struct Connection {
    id: ConnectionId,
    reader: AsyncMutex<LineReader<BoxedReader>>,
    /// `None` once closed.
    writer: AsyncMutex<Option<BoxedWriter>>,
    write_timeout: Duration,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect to a listening socket (client side).
    pub async fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_unix(stream))
    }

    /// Wrap an accepted or connected Unix stream.
    pub fn from_unix(stream: UnixStream) -> Self {
        Self::from_unix_with_buffer(stream, LineBuffer::new())
    }

    /// Wrap a Unix stream with a specific line buffer.
    pub fn from_unix_with_buffer(stream: UnixStream, buffer: LineBuffer) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_parts(Box::new(reader), Box::new(writer), buffer)
    }

    /// Wrap any bidirectional byte stream.
    pub fn from_io<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::from_parts(Box::new(reader), Box::new(writer), LineBuffer::new())
    }

    fn from_parts(reader: BoxedReader, writer: BoxedWriter, buffer: LineBuffer) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: ConnectionId::next(),
            reader: AsyncMutex::new(LineReader::with_buffer(reader, buffer)),
            writer: AsyncMutex::new(Some(writer)),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            closed,
        }
    }

    /// Bound the time a single `write_line` may block on a slow peer.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Send one line; the terminator is appended here.
    ///
    /// Gives up with `WriteTimeout` when the peer stops reading, and with
    /// `Closed` as soon as `close` is called. Any failure after the first
    /// byte closes the connection.
    pub async fn write_line(&self, line: &str) -> Result<(), TransportError> {
        if line.as_bytes().contains(&LINE_TERMINATOR) {
            return Err(TransportError::InvalidLine);
        }

        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }

        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            () = wait_closed(&mut closed) => return Err(TransportError::Closed),
        };
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;

        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(LINE_TERMINATOR);

        let timeout = self.write_timeout;
        let result = tokio::select! {
            written = tokio::time::timeout(timeout, write_frame(writer, &frame)) => match written {
                Ok(written) => written.map_err(TransportError::from),
                Err(_) => Err(TransportError::WriteTimeout { timeout }),
            },
            () = wait_closed(&mut closed) => Err(TransportError::Closed),
        };

        if result.is_err() {
            // Dropping the write half shuts it down
            guard.take();
            self.closed.send_replace(true);
        }
        result
    }

    /// Wait for the next line.
    ///
    /// Returns `Ok(None)` at end-of-stream: the peer closed its end or this
    /// connection was closed locally.
    pub async fn read_line(&self) -> Result<Option<String>, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }

        tokio::select! {
            line = async { self.reader.lock().await.read_line().await } => line,
            () = wait_closed(&mut closed) => Ok(None),
        }
    }

    /// Close the connection. Idempotent.
    ///
    /// Shuts down the write half, which the peer observes as end-of-stream,
    /// and wakes any task blocked in `read_line` or `write_line`.
    pub async fn close(&self) {
        self.closed.send_replace(true);
        // A blocked writer wakes on `closed` and releases the lock
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }
}

async fn write_frame(writer: &mut BoxedWriter, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The connection is already registered.
    Duplicate(ConnectionId),
    /// The registry holds `capacity` connections already.
    Full { capacity: usize },
    /// No more connections are accepted (shutdown in progress).
    Closed,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Duplicate(id) => write!(f, "{} is already registered", id),
            RegistryError::Full { capacity } => {
                write!(f, "connection limit reached ({} clients)", capacity)
            }
            RegistryError::Closed => write!(f, "no longer accepting connections"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Registry of live connections using slab allocation.
///
/// Membership is keyed by `ConnectionId`; a connection appears at most
/// once. Iteration goes through `snapshot`, never the live set.
pub struct ConnectionRegistry {
    members: Mutex<Slab<Arc<Connection>>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            members: Mutex::new(Slab::with_capacity(max_connections.min(64))),
            max_connections,
        }
    }

    fn members(&self) -> MutexGuard<'_, Slab<Arc<Connection>>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection.
    pub fn add(&self, conn: Arc<Connection>) -> Result<(), RegistryError> {
        let mut members = self.members();
        if members.iter().any(|(_, member)| member.id() == conn.id()) {
            return Err(RegistryError::Duplicate(conn.id()));
        }
        if members.len() >= self.max_connections {
            return Err(RegistryError::Full {
                capacity: self.max_connections,
            });
        }
        members.insert(conn);
        Ok(())
    }

    /// Deregister a connection. Returns false if it was not registered.
    pub fn remove(&self, conn: &Connection) -> bool {
        let mut members = self.members();
        let key = members
            .iter()
            .find(|(_, member)| member.id() == conn.id())
            .map(|(key, _)| key);

        match key {
            Some(key) => {
                members.remove(key);
                true
            }
            None => false,
        }
    }

    /// Check if a connection is registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members().iter().any(|(_, member)| member.id() == id)
    }

    /// Point-in-time copy of the members, in accept order.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut snapshot: Vec<Arc<Connection>> = self
            .members()
            .iter()
            .map(|(_, member)| Arc::clone(member))
            .collect();
        snapshot.sort_by_key(|conn| conn.id());
        snapshot
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.members().len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.members().is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}
