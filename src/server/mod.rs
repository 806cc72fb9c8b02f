//! Notification server.
//!
//! Binds the socket, greets every client with the server's PID and the
//! published settings, and dispatches incoming lines:
//!
//! - `Settings: <bundle>` updates the current values of known settings and
//!   rebroadcasts the published bundle to every client
//! - `PID: <pid>` from a client is ignored
//! - anything else goes to the `CommandHandler`

mod broker;

pub use broker::{
    Broker, Message, Recipient, DEFAULT_MAX_CLIENTS, DEFAULT_QUEUE_WARN_THRESHOLD,
};

use crate::protocol::{pid_line, settings_line, Notice};
use crate::runtime::{
    BindError, Connection, Listener, DEFAULT_MAX_LINE_LENGTH, DEFAULT_WRITE_TIMEOUT,
};
use crate::settings::SettingsBundle;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// What to send back after a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Nothing.
    None,
    /// A line to the client that sent the command.
    Sender(String),
    /// A line to every client.
    All(String),
    /// The published settings, to every client.
    Settings,
}

/// Application hook for commands other than `Settings` and `PID`.
pub trait CommandHandler {
    /// Handle one command. `settings` is the published bundle and may be
    /// modified; reply with `Reply::Settings` to announce the change.
    fn command(&mut self, command: &str, payload: &str, settings: &mut SettingsBundle) -> Reply;

    /// Called after a client changed current values.
    fn settings_changed(&mut self, _settings: &SettingsBundle, _changed: &[String]) {}
}

/// Handler that accepts no commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreCommands;

impl CommandHandler for IgnoreCommands {
    fn command(&mut self, command: &str, _payload: &str, _settings: &mut SettingsBundle) -> Reply {
        debug!(command, "Ignoring unknown command");
        Reply::None
    }
}

/// Server parameters.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub socket: PathBuf,
    pub max_clients: usize,
    pub queue_warn_threshold: usize,
    pub max_line_length: usize,
    /// A client that takes longer than this to accept one line is dropped.
    pub write_timeout: Duration,
    /// Initially published settings.
    pub settings: SettingsBundle,
}

impl ServerOptions {
    /// Defaults for everything but the socket path.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            max_clients: DEFAULT_MAX_CLIENTS,
            queue_warn_threshold: DEFAULT_QUEUE_WARN_THRESHOLD,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            settings: SettingsBundle::new(),
        }
    }
}

type Published = Arc<Mutex<SettingsBundle>>;

fn lock(settings: &Published) -> MutexGuard<'_, SettingsBundle> {
    settings.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A bound server, ready to run.
pub struct Server {
    listener: Listener,
    broker: Arc<Broker>,
    settings: Published,
    pid: u32,
}

impl Server {
    /// Bind the socket. Must be called from within a tokio runtime.
    pub fn bind(options: ServerOptions) -> Result<Self, BindError> {
        let listener = Listener::bind(options.socket)?
            .with_max_line_length(options.max_line_length)
            .with_write_timeout(options.write_timeout);
        let broker = Arc::new(Broker::new(
            options.max_clients,
            options.queue_warn_threshold,
        ));

        Ok(Self {
            listener,
            broker,
            settings: Arc::new(Mutex::new(options.settings)),
            pid: std::process::id(),
        })
    }

    /// Path of the bound socket.
    pub fn path(&self) -> &Path {
        self.listener.path()
    }

    /// The connection broker.
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Copy of the published settings.
    pub fn settings(&self) -> SettingsBundle {
        lock(&self.settings).clone()
    }

    /// Serve clients until `shutdown` completes.
    ///
    /// On return the socket file is gone, every client connection is closed
    /// and every reader task has finished.
    pub async fn run<H, F>(self, mut handler: H, shutdown: F) -> SettingsBundle
    where
        H: CommandHandler,
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            broker,
            settings,
            pid,
        } = self;

        info!(
            path = %listener.path().display(),
            pid,
            settings = lock(&settings).len(),
            "Server ready"
        );

        let (stop_accepting, accept_stopped) = watch::channel(false);
        let accept_task = tokio::spawn({
            let broker = Arc::clone(&broker);
            let settings = Arc::clone(&settings);
            async move {
                listener
                    .accept_loop(
                        move |conn| {
                            let broker = Arc::clone(&broker);
                            let settings = Arc::clone(&settings);
                            async move { welcome(&broker, conn, pid, &settings).await }
                        },
                        accept_stopped,
                    )
                    .await;
                // Dropping the listener unlinks the socket file
            }
        });

        tokio::pin!(shutdown);
        loop {
            let message = tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                message = broker.read() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            // Replies may be stuck on a slow client; shutdown still wins
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested during dispatch");
                    break;
                }
                () = dispatch(&broker, &settings, &mut handler, message) => {}
            }
        }

        stop_accepting.send_replace(true);
        if let Err(e) = accept_task.await {
            warn!(error = %e, "Accept task failed");
        }
        broker.shutdown().await;

        info!("Server stopped");
        let published = lock(&settings).clone();
        published
    }
}

/// Attach a new client and send it the PID and the published settings.
async fn welcome(broker: &Broker, conn: Connection, pid: u32, settings: &Published) {
    let id = conn.id();
    let conn = match broker.attach(conn) {
        Ok(conn) => conn,
        Err(e) => {
            warn!(conn = %id, error = %e, "Rejecting client");
            return;
        }
    };

    let settings = settings_line(&lock(settings));
    let delivered = broker.send(&pid_line(pid), Recipient::One(&conn)).await
        + broker.send(&settings, Recipient::One(&conn)).await;
    if delivered < 2 {
        debug!(conn = %id, "Client left during greeting");
    }
}

async fn dispatch<H: CommandHandler>(
    broker: &Broker,
    settings: &Published,
    handler: &mut H,
    message: Message,
) {
    let Message { line, source } = message;
    let id = source.id();
    trace!(conn = %id, line = %line, "Dispatching");

    match Notice::parse(&line) {
        Ok(Notice::Settings(update)) => {
            let (report, announcement) = {
                let mut published = lock(settings);
                let report = published.apply_current(&update);
                if !report.changed.is_empty() {
                    handler.settings_changed(&published, &report.changed);
                }
                (report, settings_line(&published))
            };

            for error in &report.rejected {
                warn!(conn = %id, error = %error, "Ignoring setting update");
            }
            if !report.changed.is_empty() {
                info!(conn = %id, changed = ?report.changed, "Settings updated");
            }
            broker.send(&announcement, Recipient::All).await;
        }
        Ok(Notice::Pid(pid)) => {
            debug!(conn = %id, pid, "Ignoring PID announced by client");
        }
        Ok(Notice::Command { command, payload }) => {
            let (reply, announcement) = {
                let mut published = lock(settings);
                let reply = handler.command(&command, &payload, &mut published);
                let announcement = match reply {
                    Reply::Settings => Some(settings_line(&published)),
                    _ => None,
                };
                (reply, announcement)
            };

            match (reply, announcement) {
                (Reply::Sender(line), _) => {
                    broker.send(&line, Recipient::One(&source)).await;
                }
                (Reply::All(line), _) | (Reply::Settings, Some(line)) => {
                    broker.send(&line, Recipient::All).await;
                }
                _ => {}
            }
        }
        Err(e) => {
            warn!(conn = %id, error = %e, "Dropping malformed message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::bundle;
    use crate::settings::{Setting, Value};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn initial_settings() -> SettingsBundle {
        let mut bundle = SettingsBundle::with_script(Some("blueshift.conf".to_string()));
        bundle
            .add(
                Setting::new("gamma", "Gamma", 1.0)
                    .unwrap()
                    .with_range(0.1, 5.0)
                    .unwrap(),
            )
            .unwrap();
        bundle
            .add(Setting::new("temp", "Temperature", 6500i64).unwrap())
            .unwrap();
        bundle
    }

    /// Echoes `echo:` to the sender, `announce:` to everyone, and resets
    /// all settings on `reset`.
    struct TestCommands;

    impl CommandHandler for TestCommands {
        fn command(&mut self, command: &str, payload: &str, settings: &mut SettingsBundle) -> Reply {
            match command {
                "echo" => Reply::Sender(format!("echo: {}", payload)),
                "announce" => Reply::All(format!("announce: {}", payload)),
                "reset" => {
                    *settings = initial_settings();
                    Reply::Settings
                }
                _ => Reply::None,
            }
        }
    }

    struct Running {
        _dir: tempfile::TempDir,
        path: PathBuf,
        stop: oneshot::Sender<()>,
        task: JoinHandle<SettingsBundle>,
    }

    fn start() -> Running {
        start_with(|_| {})
    }

    fn start_with(configure: impl FnOnce(&mut ServerOptions)) -> Running {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("srv");
        let mut options = ServerOptions::new(&path);
        options.settings = initial_settings();
        configure(&mut options);
        let server = Server::bind(options).unwrap();

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(server.run(TestCommands, async move {
            let _ = stopped.await;
        }));

        Running {
            _dir: dir,
            path,
            stop,
            task,
        }
    }

    async fn next_line(conn: &Connection) -> String {
        tokio::time::timeout(TIMEOUT, conn.read_line())
            .await
            .expect("Timed out waiting for line")
            .unwrap()
            .expect("server closed the connection")
    }

    /// Connect and consume the greeting.
    async fn connect(path: &Path) -> Connection {
        let conn = Connection::connect(path).await.unwrap();
        assert_eq!(
            next_line(&conn).await,
            format!("PID: {}", std::process::id())
        );
        let settings = next_line(&conn).await;
        assert!(settings.starts_with("Settings: "));
        conn
    }

    fn decode_settings(line: &str) -> SettingsBundle {
        let payload = line.strip_prefix("Settings: ").expect("settings line");
        bundle::decode(payload).unwrap()
    }

    #[tokio::test]
    async fn test_greeting() {
        let running = start();
        let conn = Connection::connect(&running.path).await.unwrap();

        assert_eq!(
            next_line(&conn).await,
            format!("PID: {}", std::process::id())
        );
        assert_eq!(decode_settings(&next_line(&conn).await), initial_settings());
    }

    #[tokio::test]
    async fn test_settings_update_is_broadcast() {
        let running = start();
        let a = connect(&running.path).await;
        let b = connect(&running.path).await;

        let mut update = SettingsBundle::new();
        update
            .add(Setting::new("gamma", "Gamma", 1.0).unwrap().with_current(2.0).unwrap())
            .unwrap();
        a.write_line(&settings_line(&update)).await.unwrap();

        for client in [&a, &b] {
            let published = decode_settings(&next_line(client).await);
            assert_eq!(
                published.get("gamma").unwrap().current_value(),
                &Value::Float(2.0)
            );
            // Untouched fields keep the server's values
            assert_eq!(published.script(), Some("blueshift.conf"));
            assert_eq!(published.len(), 2);
        }

        running.stop.send(()).unwrap();
        let final_settings = tokio::time::timeout(TIMEOUT, running.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            final_settings.get("gamma").unwrap().current_value(),
            &Value::Float(2.0)
        );
    }

    #[tokio::test]
    async fn test_invalid_update_is_not_applied() {
        let running = start();
        let a = connect(&running.path).await;

        let mut update = SettingsBundle::new();
        update
            .add(Setting::new("gamma", "Gamma", 9.0).unwrap())
            .unwrap();
        a.write_line(&settings_line(&update)).await.unwrap();

        let published = decode_settings(&next_line(&a).await);
        assert_eq!(published, initial_settings());
    }

    #[tokio::test]
    async fn test_commands() {
        let running = start();
        let a = connect(&running.path).await;
        let b = connect(&running.path).await;

        a.write_line("echo: hi").await.unwrap();
        assert_eq!(next_line(&a).await, "echo: hi");

        b.write_line("announce: dusk").await.unwrap();
        assert_eq!(next_line(&a).await, "announce: dusk");
        assert_eq!(next_line(&b).await, "announce: dusk");

        b.write_line("reset").await.unwrap();
        assert_eq!(decode_settings(&next_line(&a).await), initial_settings());
        assert_eq!(decode_settings(&next_line(&b).await), initial_settings());
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_connection() {
        let running = start();
        let a = connect(&running.path).await;

        a.write_line("Settings: (None, [").await.unwrap();
        a.write_line("PID: 77").await.unwrap();
        a.write_line("echo: after").await.unwrap();
        assert_eq!(next_line(&a).await, "echo: after");
    }

    #[tokio::test]
    async fn test_shutdown_while_reply_is_stuck_on_silent_client() {
        // Long enough that only shutdown can release the stuck broadcast
        let running = start_with(|options| options.write_timeout = Duration::from_secs(600));
        let _silent = Connection::connect(&running.path).await.unwrap();
        let talker = connect(&running.path).await;

        let payload = "z".repeat(16 * 1024);
        for _ in 0..40 {
            talker
                .write_line(&format!("announce: {}", payload))
                .await
                .unwrap();
        }
        // Give the server time to fill both socket buffers
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!running.task.is_finished());

        running.stop.send(()).unwrap();
        tokio::time::timeout(TIMEOUT, running.task)
            .await
            .expect("server should stop despite a client that never reads")
            .unwrap();
        assert!(!running.path.exists());
    }

    #[tokio::test]
    async fn test_slow_client_is_dropped_and_others_still_served() {
        let running = start_with(|options| options.write_timeout = Duration::from_millis(200));
        let _silent = Connection::connect(&running.path).await.unwrap();
        let talker = connect(&running.path).await;

        let payload = "z".repeat(16 * 1024);
        for i in 0..40 {
            talker
                .write_line(&format!("announce: {} {}", i, payload))
                .await
                .unwrap();
            assert_eq!(
                next_line(&talker).await,
                format!("announce: {} {}", i, payload)
            );
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let running = start();
        let a = connect(&running.path).await;

        running.stop.send(()).unwrap();
        tokio::time::timeout(TIMEOUT, running.task)
            .await
            .expect("server should stop")
            .unwrap();

        assert!(!running.path.exists());
        let eof = tokio::time::timeout(TIMEOUT, a.read_line()).await.unwrap();
        assert!(matches!(eof, Ok(None)));
        assert!(Connection::connect(&running.path).await.is_err());
    }
}
