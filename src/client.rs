//! Client side of the notification channel.
//!
//! A `Session` is one connection to the server plus what the server has
//! told it so far: its PID, the latest settings and the last announced
//! configuration script. Incoming lines are decoded and handed to a
//! `NoticeHandler`.

use crate::control::{ControlError, ServerControl};
use crate::protocol::{settings_line, Notice, ProtocolError};
use crate::runtime::{Connection, TransportError};
use crate::settings::SettingsBundle;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

/// Failure to reach the server.
#[derive(Debug)]
pub struct ConnectError {
    pub path: PathBuf,
    pub source: io::Error,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot connect to {}: {}. Is the server running?",
            self.path.display(),
            self.source
        )
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Callbacks for server notices. Every method defaults to doing nothing.
pub trait NoticeHandler {
    /// The server announced its process id.
    fn pid(&mut self, _pid: u32) {}

    /// The server published settings.
    fn settings(&mut self, _settings: &SettingsBundle) {}

    /// The announced configuration script differs from the previous one.
    /// Runs before `settings` for the same notice.
    fn script_changed(&mut self, _script: Option<&str>) {}

    /// Any other command.
    fn command(&mut self, _command: &str, _payload: &str) {}

    /// A line that could not be decoded.
    fn malformed(&mut self, line: &str, error: &ProtocolError) {
        warn!(error = %error, len = line.len(), "Ignoring malformed notice");
    }

    /// The server closed the connection.
    fn closed(&mut self) {}
}

/// A connection to the server and the state it has announced.
#[derive(Debug)]
pub struct Session {
    conn: Connection,
    path: PathBuf,
    server_pid: Option<u32>,
    settings: Option<SettingsBundle>,
    last_script: Option<String>,
}

impl Session {
    /// Connect to the server socket. Fails immediately if nobody listens.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ConnectError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::connect(&path)
            .await
            .map_err(|source| ConnectError {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), "Connected to server");

        Ok(Self {
            conn,
            path,
            server_pid: None,
            settings: None,
            last_script: None,
        })
    }

    /// Socket path of the server.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID announced by the server.
    pub fn server_pid(&self) -> Option<u32> {
        self.server_pid
    }

    /// Latest settings published by the server.
    pub fn settings(&self) -> Option<&SettingsBundle> {
        self.settings.as_ref()
    }

    /// Configuration script from the latest settings.
    pub fn last_script(&self) -> Option<&str> {
        self.last_script.as_deref()
    }

    /// Signal handle for the server, once its PID is known.
    pub fn control(&self) -> Option<Result<ServerControl, ControlError>> {
        self.server_pid.map(ServerControl::new)
    }

    /// Send a raw line to the server.
    pub async fn send_line(&self, line: &str) -> Result<(), TransportError> {
        trace!(len = line.len(), "Sending line");
        self.conn.write_line(line).await
    }

    /// Ask the server to adopt the current values in `settings`.
    pub async fn send_settings(&self, settings: &SettingsBundle) -> Result<(), TransportError> {
        self.send_line(&settings_line(settings)).await
    }

    /// Read and dispatch one notice.
    ///
    /// Returns `Ok(false)` once the server has closed the connection.
    /// Cancel-safe: no line is lost if the future is dropped.
    pub async fn next<H: NoticeHandler>(&mut self, handler: &mut H) -> Result<bool, TransportError> {
        let Some(line) = self.conn.read_line().await? else {
            return Ok(false);
        };
        trace!(len = line.len(), "Received notice");

        match Notice::parse(&line) {
            Ok(Notice::Pid(pid)) => {
                self.server_pid = Some(pid);
                handler.pid(pid);
            }
            Ok(Notice::Settings(settings)) => {
                if settings.script() != self.last_script.as_deref() {
                    self.last_script = settings.script().map(str::to_string);
                    handler.script_changed(settings.script());
                }
                handler.settings(&settings);
                self.settings = Some(settings);
            }
            Ok(Notice::Command { command, payload }) => handler.command(&command, &payload),
            Err(e) => handler.malformed(&line, &e),
        }
        Ok(true)
    }

    /// Dispatch notices until the server closes the connection.
    pub async fn run<H: NoticeHandler>(&mut self, handler: &mut H) -> Result<(), TransportError> {
        while self.next(handler).await? {}
        info!(path = %self.path.display(), "Server closed the connection");
        handler.closed();
        Ok(())
    }

    /// Close the connection.
    pub async fn close(&self) {
        self.conn.close().await;
    }
}
