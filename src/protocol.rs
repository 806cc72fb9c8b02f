//! Line protocol spoken between the server and its clients.
//!
//! Every message is one line of the form `<command>: <payload>`:
//! - `Settings: <bundle>`: the published settings (either direction)
//! - `PID: <pid>`: the server's process id, sent to each new client
//! - anything else: an application command, split on the first `": "`
//!
//! A line without `": "` is a command with an empty payload.

use crate::protocols::bundle::{self, MalformedPayload};
use crate::settings::SettingsBundle;
use std::fmt;

/// Command name of a settings message.
pub const SETTINGS_COMMAND: &str = "Settings";

/// Command name of a process id message.
pub const PID_COMMAND: &str = "PID";

/// Separator between command and payload.
pub const SEPARATOR: &str = ": ";

/// A parsed protocol line.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Settings bundle.
    Settings(SettingsBundle),
    /// Server process id.
    Pid(u32),
    /// Any other command.
    Command { command: String, payload: String },
}

/// Protocol errors
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// The settings payload could not be decoded.
    Payload(MalformedPayload),
    /// The process id is not a positive integer.
    InvalidPid(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Payload(e) => write!(f, "Invalid settings: {}", e),
            ProtocolError::InvalidPid(s) => write!(f, "Invalid PID: {:?}", s),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Payload(e) => Some(e),
            ProtocolError::InvalidPid(_) => None,
        }
    }
}

impl From<MalformedPayload> for ProtocolError {
    fn from(e: MalformedPayload) -> Self {
        ProtocolError::Payload(e)
    }
}

/// Split a line into command and payload.
pub fn split(line: &str) -> (&str, &str) {
    line.split_once(SEPARATOR).unwrap_or((line, ""))
}

impl Notice {
    /// Parse one line (without its terminator).
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (command, payload) = split(line);
        match command {
            SETTINGS_COMMAND => Ok(Notice::Settings(bundle::decode(payload)?)),
            PID_COMMAND => parse_pid(payload).map(Notice::Pid),
            _ => Ok(Notice::Command {
                command: command.to_string(),
                payload: payload.to_string(),
            }),
        }
    }

    /// Build a custom command message.
    pub fn command(command: impl Into<String>, payload: impl Into<String>) -> Self {
        Notice::Command {
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// Encode as one line, without terminator.
    ///
    /// Command names must not contain `": "` and payloads must not contain
    /// a line terminator.
    pub fn encode(&self) -> String {
        match self {
            Notice::Settings(bundle) => settings_line(bundle),
            Notice::Pid(pid) => pid_line(*pid),
            Notice::Command { command, payload } if payload.is_empty() => command.clone(),
            Notice::Command { command, payload } => {
                format!("{}{}{}", command, SEPARATOR, payload)
            }
        }
    }
}

/// `Settings: <bundle>` line.
pub fn settings_line(bundle: &SettingsBundle) -> String {
    format!("{}{}{}", SETTINGS_COMMAND, SEPARATOR, bundle::encode(bundle))
}

/// `PID: <pid>` line.
pub fn pid_line(pid: u32) -> String {
    format!("{}{}{}", PID_COMMAND, SEPARATOR, pid)
}

fn parse_pid(payload: &str) -> Result<u32, ProtocolError> {
    // Must fit a pid_t for kill(2)
    match payload.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(pid as u32),
        _ => Err(ProtocolError::InvalidPid(payload.to_string())),
    }
}
