//! Connection broker: multiplexed read and broadcast/unicast send.
//!
//! The broker owns the registry of attached connections. Until the first
//! call to `read`, connections are only tracked. From then on every
//! connection gets a reader task that forwards its lines, tagged with the
//! source connection, into one FIFO queue which `read` drains.
//!
//! A reader task ends on end-of-stream, on a read error, or at shutdown,
//! and always deregisters its connection on the way out.

use crate::runtime::{
    Connection, ConnectionRegistry, PendingQueue, RegistryError, LINE_TERMINATOR,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

/// Default limit on attached clients.
pub const DEFAULT_MAX_CLIENTS: usize = 64;

/// Default queue length that triggers a warning.
pub const DEFAULT_QUEUE_WARN_THRESHOLD: usize = 1024;

/// A line received from a connected peer.
#[derive(Debug, Clone)]
pub struct Message {
    pub line: String,
    pub source: Arc<Connection>,
}

/// Target of `Broker::send`.
#[derive(Debug, Clone, Copy)]
pub enum Recipient<'a> {
    One(&'a Arc<Connection>),
    All,
}

struct Readers {
    /// Set by the first `read`; from then on every connection has a reader.
    multiplexing: bool,
    tasks: JoinSet<()>,
}

/// Registry, reader tasks and message queue of the server side.
pub struct Broker {
    registry: Arc<ConnectionRegistry>,
    queue: Arc<PendingQueue<Message>>,
    /// Guards the multiplexing switch together with reader spawning.
    readers: Mutex<Readers>,
    shutdown: watch::Sender<bool>,
}

impl Broker {
    /// Create a broker admitting at most `max_clients` connections.
    pub fn new(max_clients: usize, queue_warn_threshold: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry: Arc::new(ConnectionRegistry::new(max_clients)),
            queue: Arc::new(PendingQueue::new(queue_warn_threshold)),
            readers: Mutex::new(Readers {
                multiplexing: false,
                tasks: JoinSet::new(),
            }),
            shutdown,
        }
    }

    fn readers(&self) -> MutexGuard<'_, Readers> {
        self.readers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection.
    ///
    /// Once multiplexing has started a reader task is spawned for it right
    /// away. Must be called from within a tokio runtime.
    pub fn attach(&self, conn: Connection) -> Result<Arc<Connection>, RegistryError> {
        let conn = Arc::new(conn);

        let mut readers = self.readers();
        if *self.shutdown.borrow() {
            return Err(RegistryError::Closed);
        }
        self.registry.add(Arc::clone(&conn))?;
        if readers.multiplexing {
            // Reap readers of departed peers
            while readers.tasks.try_join_next().is_some() {}
            self.spawn_reader(&mut readers.tasks, Arc::clone(&conn));
        }
        drop(readers);

        debug!(conn = %conn.id(), clients = self.registry.len(), "Connection attached");
        Ok(conn)
    }

    /// Wait for the next line from any connection, oldest first.
    ///
    /// The first call starts a reader for every attached connection; after
    /// that, connections must not be read directly. Returns `None` once the
    /// broker has been shut down.
    pub async fn read(&self) -> Option<Message> {
        self.start_multiplexing();
        let mut shutdown = self.shutdown.subscribe();
        self.queue.pop(&mut shutdown).await
    }

    fn start_multiplexing(&self) {
        let mut readers = self.readers();
        if readers.multiplexing {
            return;
        }
        readers.multiplexing = true;

        let members = self.registry.snapshot();
        debug!(readers = members.len(), "Starting multiplexed read");
        for conn in members {
            self.spawn_reader(&mut readers.tasks, conn);
        }
    }

    fn spawn_reader(&self, tasks: &mut JoinSet<()>, conn: Arc<Connection>) {
        let registry = Arc::clone(&self.registry);
        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown.subscribe();
        tasks.spawn(reader_task(conn, registry, queue, shutdown));
    }

    /// Send one line to one connection or to every attached connection.
    ///
    /// Broadcasts go to a snapshot of the registry, one connection at a
    /// time. A connection whose write fails is deregistered and closed;
    /// the remaining targets are still tried. Returns the number of
    /// connections the line was delivered to.
    pub async fn send(&self, line: &str, to: Recipient<'_>) -> usize {
        if line.as_bytes().contains(&LINE_TERMINATOR) {
            warn!("Refusing to send a line containing a line terminator");
            return 0;
        }

        let targets = match to {
            Recipient::One(conn) => vec![Arc::clone(conn)],
            Recipient::All => self.registry.snapshot(),
        };

        let mut delivered = 0;
        for conn in targets {
            match conn.write_line(line).await {
                Ok(()) => {
                    trace!(conn = %conn.id(), len = line.len(), "Sent line");
                    delivered += 1;
                }
                Err(e) => {
                    debug!(conn = %conn.id(), error = %e, "Write failed, dropping connection");
                    self.deregister(&conn).await;
                }
            }
        }
        delivered
    }

    /// Remove a connection and close it. Returns false if it was not attached.
    pub async fn deregister(&self, conn: &Connection) -> bool {
        let removed = self.registry.remove(conn);
        conn.close().await;
        if removed {
            debug!(conn = %conn.id(), clients = self.registry.len(), "Connection detached");
        }
        removed
    }

    /// Snapshot of the attached connections, in accept order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.snapshot()
    }

    /// Number of attached connections.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Check if no connection is attached.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Returns true once `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop everything: refuse new connections, close attached ones, wake
    /// a blocked `read`, and wait for every reader task to finish.
    /// Messages still queued are dropped. Idempotent.
    pub async fn shutdown(&self) {
        let mut tasks = {
            let mut readers = self.readers();
            if self.shutdown.send_replace(true) {
                return;
            }
            std::mem::take(&mut readers.tasks)
        };

        info!(clients = self.registry.len(), "Shutting down broker");

        for conn in self.registry.snapshot() {
            self.registry.remove(&conn);
            conn.close().await;
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Reader task failed");
            }
        }

        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!(dropped, "Discarded undelivered messages");
        }
    }
}

async fn reader_task(
    conn: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    queue: Arc<PendingQueue<Message>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let id = conn.id();
    trace!(conn = %id, "Reader started");

    loop {
        tokio::select! {
            () = shutdown_signaled(&mut shutdown) => break,
            line = conn.read_line() => match line {
                Ok(Some(line)) => {
                    trace!(conn = %id, len = line.len(), "Received line");
                    queue.push(Message {
                        line,
                        source: Arc::clone(&conn),
                    });
                }
                Ok(None) => {
                    debug!(conn = %id, "Peer disconnected");
                    break;
                }
                Err(e) => {
                    warn!(conn = %id, error = %e, "Read failed, dropping connection");
                    break;
                }
            },
        }
    }

    registry.remove(&conn);
    conn.close().await;
    trace!(conn = %id, "Reader stopped");
}

/// Resolves when shutdown is signaled or the broker is gone.
async fn shutdown_signaled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::LineBuffer;
    use std::time::Duration;
    use tokio::net::UnixStream;

    const TIMEOUT: Duration = Duration::from_secs(2);

    /// Attach the server end of a socket pair; return the client end.
    fn attach_client(broker: &Broker) -> (Arc<Connection>, Connection) {
        let (server, client) = UnixStream::pair().unwrap();
        let conn = broker.attach(Connection::from_unix(server)).unwrap();
        (conn, Connection::from_unix(client))
    }

    async fn read(broker: &Broker) -> Message {
        tokio::time::timeout(TIMEOUT, broker.read())
            .await
            .expect("Timed out waiting for message")
            .expect("broker shut down")
    }

    async fn read_line(conn: &Connection) -> Option<String> {
        tokio::time::timeout(TIMEOUT, conn.read_line())
            .await
            .expect("Timed out waiting for line")
            .unwrap()
    }

    async fn wait_for_len(broker: &Broker, len: usize) {
        tokio::time::timeout(TIMEOUT, async {
            while broker.len() != len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry did not reach expected size");
    }

    #[tokio::test]
    async fn test_multiplexed_read_preserves_per_peer_order() {
        let broker = Broker::new(8, 1024);
        let (a_id, a) = attach_client(&broker);
        let (b_id, b) = attach_client(&broker);

        for i in 0..3 {
            a.write_line(&format!("a{}", i)).await.unwrap();
            b.write_line(&format!("b{}", i)).await.unwrap();
        }

        let mut from_a = Vec::new();
        let mut from_b = Vec::new();
        for _ in 0..6 {
            let message = read(&broker).await;
            if message.source.id() == a_id.id() {
                from_a.push(message.line);
            } else {
                assert_eq!(message.source.id(), b_id.id());
                from_b.push(message.line);
            }
        }
        assert_eq!(from_a, vec!["a0", "a1", "a2"]);
        assert_eq!(from_b, vec!["b0", "b1", "b2"]);
    }

    #[tokio::test]
    async fn test_reply_to_source() {
        let broker = Broker::new(8, 1024);
        let (_, a) = attach_client(&broker);
        let (_, b) = attach_client(&broker);

        b.write_line("ping").await.unwrap();
        let message = read(&broker).await;
        assert_eq!(message.line, "ping");

        let delivered = broker
            .send("pong", Recipient::One(&message.source))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(read_line(&b).await.as_deref(), Some("pong"));

        // Only the source got the reply
        broker.send("next", Recipient::All).await;
        assert_eq!(read_line(&a).await.as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn test_broadcast_pid_reaches_every_client_once() {
        let broker = Broker::new(8, 1024);
        let (_, a) = attach_client(&broker);
        let (_, b) = attach_client(&broker);

        assert_eq!(broker.send("PID: 4242", Recipient::All).await, 2);
        assert_eq!(broker.send("PID: 4243", Recipient::All).await, 2);

        for client in [&a, &b] {
            assert_eq!(read_line(client).await.as_deref(), Some("PID: 4242"));
            assert_eq!(read_line(client).await.as_deref(), Some("PID: 4243"));
        }
    }

    #[tokio::test]
    async fn test_disconnected_peer_is_deregistered() {
        let broker = Arc::new(Broker::new(8, 1024));
        let (_, a) = attach_client(&broker);
        let (b_conn, b) = attach_client(&broker);

        // Start multiplexing so readers notice the disconnect
        let pending = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move { broker.read().await }
        });

        drop(b);
        wait_for_len(&broker, 1).await;
        assert!(broker
            .connections()
            .iter()
            .all(|conn| conn.id() != b_conn.id()));

        assert_eq!(broker.send("hello", Recipient::All).await, 1);
        assert_eq!(read_line(&a).await.as_deref(), Some("hello"));

        a.write_line("still here").await.unwrap();
        let message = tokio::time::timeout(TIMEOUT, pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message.line, "still here");
    }

    #[tokio::test]
    async fn test_write_failure_deregisters_target() {
        let broker = Broker::new(8, 1024);
        let (_, a) = attach_client(&broker);
        let (_, b) = attach_client(&broker);
        drop(b);

        // No readers yet; the failed write is what removes the peer
        assert_eq!(broker.send("hello", Recipient::All).await, 1);
        assert_eq!(broker.len(), 1);
        assert_eq!(read_line(&a).await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_connection_attached_after_first_read_is_read() {
        let broker = Arc::new(Broker::new(8, 1024));

        let pending = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move { broker.read().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (conn, client) = attach_client(&broker);
        client.write_line("late").await.unwrap();

        let message = tokio::time::timeout(TIMEOUT, pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message.line, "late");
        assert_eq!(message.source.id(), conn.id());
    }

    #[tokio::test]
    async fn test_shutdown_releases_read_and_closes_clients() {
        let broker = Arc::new(Broker::new(8, 1024));
        let (_, a) = attach_client(&broker);

        let pending = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move { broker.read().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(TIMEOUT, broker.shutdown())
            .await
            .expect("shutdown should join readers");

        let result = tokio::time::timeout(TIMEOUT, pending).await.unwrap().unwrap();
        assert!(result.is_none());
        assert!(broker.is_empty());
        assert!(broker.is_shut_down());
        assert_eq!(read_line(&a).await, None);

        // Idempotent, and later connections are refused
        broker.shutdown().await;
        let (server, _client) = UnixStream::pair().unwrap();
        assert_eq!(
            broker.attach(Connection::from_unix(server)).unwrap_err(),
            RegistryError::Closed
        );
    }

    #[tokio::test]
    async fn test_client_limit() {
        let broker = Broker::new(1, 1024);
        let (_, _a) = attach_client(&broker);

        let (server, _client) = UnixStream::pair().unwrap();
        assert_eq!(
            broker.attach(Connection::from_unix(server)).unwrap_err(),
            RegistryError::Full { capacity: 1 }
        );
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_block_broadcast() {
        let broker = Broker::new(8, 1024);

        // Never reads; its socket buffer fills up after a few lines
        let (server, _stalled) = UnixStream::pair().unwrap();
        let stalled = broker
            .attach(Connection::from_unix(server).with_write_timeout(Duration::from_millis(200)))
            .unwrap();
        let (_, draining) = attach_client(&broker);

        let line = "x".repeat(16 * 1024);
        let count = 64;
        let reader = tokio::spawn({
            let expected = line.clone();
            async move {
                for _ in 0..count {
                    assert_eq!(read_line(&draining).await.as_deref(), Some(expected.as_str()));
                }
            }
        });

        let mut delivered = Vec::new();
        for _ in 0..count {
            let sent = tokio::time::timeout(TIMEOUT, broker.send(&line, Recipient::All))
                .await
                .expect("broadcast stalled on a peer that stopped reading");
            delivered.push(sent);
        }

        // The stalled peer got dropped partway; the other peer got everything
        assert_eq!(delivered.first(), Some(&2));
        assert_eq!(delivered.last(), Some(&1));
        assert!(stalled.is_closed());
        assert_eq!(broker.len(), 1);
        tokio::time::timeout(TIMEOUT, reader).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_overlong_line_drops_only_that_peer() {
        let broker = Arc::new(Broker::new(8, 1024));

        let (server, flooder) = UnixStream::pair().unwrap();
        let flooding = broker
            .attach(Connection::from_unix_with_buffer(
                server,
                LineBuffer::with_max_line_length(64),
            ))
            .unwrap();
        let flooder = Connection::from_unix(flooder);
        let (steady_conn, steady) = attach_client(&broker);

        let pending = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move { broker.read().await }
        });

        flooder.write_line(&"y".repeat(200)).await.unwrap();
        wait_for_len(&broker, 1).await;
        assert!(broker
            .connections()
            .iter()
            .all(|conn| conn.id() != flooding.id()));
        assert_eq!(read_line(&flooder).await, None);

        steady.write_line("ok").await.unwrap();
        let message = tokio::time::timeout(TIMEOUT, pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message.line, "ok");
        assert_eq!(message.source.id(), steady_conn.id());
    }

    #[tokio::test]
    async fn test_send_rejects_embedded_newline() {
        let broker = Broker::new(8, 1024);
        let (_, _a) = attach_client(&broker);
        assert_eq!(broker.send("two\nlines", Recipient::All).await, 0);
        assert_eq!(broker.len(), 1);
    }
}
