//! Configuration module for blueshift-ipc.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::control::ControlAction;
use crate::endpoint::{Endpoint, EndpointError, DEFAULT_DIRECTORY, DEFAULT_PREFIX};
use crate::runtime::{DEFAULT_MAX_LINE_LENGTH, DEFAULT_WRITE_TIMEOUT};
use crate::server::{ServerOptions, DEFAULT_MAX_CLIENTS, DEFAULT_QUEUE_WARN_THRESHOLD};
use crate::settings::{Number, Setting, SettingParts, SettingsBundle, SettingsError, Value, ValueType};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "blueshift-ipc")]
#[command(author = "blueshift-ipc authors")]
#[command(version = "0.1.0")]
#[command(about = "Local notification channel for a display adjustment daemon", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Socket path (overrides the path derived from $USER and $DISPLAY)
    #[arg(short, long)]
    pub socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// What to run.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the notification server
    Serve,
    /// Connect, print notices, and forward lines from stdin
    Attach,
    /// Send a control signal to the running server
    Signal {
        #[arg(value_enum)]
        action: ControlAction,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub settings: Vec<SettingConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Socket naming
#[derive(Debug, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Overrides $USER
    pub user: Option<String>,
    /// Overrides $DISPLAY
    pub session: Option<String>,
    /// Full socket path; bypasses the naming scheme
    pub socket: Option<PathBuf>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            prefix: default_prefix(),
            user: None,
            session: None,
            socket: None,
        }
    }
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_queue_warn_threshold")]
    pub queue_warn_threshold: usize,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Milliseconds a client may take to accept one line
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Configuration script announced with the settings
    pub script: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            queue_warn_threshold: default_queue_warn_threshold(),
            max_line_length: default_max_line_length(),
            write_timeout_ms: default_write_timeout_ms(),
            script: None,
        }
    }
}

/// One `[[settings]]` entry
#[derive(Debug, Deserialize)]
pub struct SettingConfig {
    pub name: String,
    /// Defaults to the name
    pub title: Option<String>,
    /// Inferred from `default` when absent
    #[serde(rename = "type")]
    pub value_type: Option<String>,
    pub default: toml::Value,
    pub minimum: Option<toml::Value>,
    pub maximum: Option<toml::Value>,
    pub epsilon: Option<toml::Value>,
    pub values: Option<Vec<toml::Value>>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_directory() -> PathBuf {
    PathBuf::from(DEFAULT_DIRECTORY)
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_max_clients() -> usize {
    DEFAULT_MAX_CLIENTS
}

fn default_queue_warn_threshold() -> usize {
    DEFAULT_QUEUE_WARN_THRESHOLD
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH // 1 MB
}

fn default_write_timeout_ms() -> u64 {
    DEFAULT_WRITE_TIMEOUT.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,
    pub socket: PathBuf,
    pub max_clients: usize,
    pub queue_warn_threshold: usize,
    pub max_line_length: usize,
    pub write_timeout: Duration,
    pub settings: SettingsBundle,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve parsed arguments against the process environment.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config, |var| std::env::var(var).ok())
    }

    /// Merge CLI args with TOML config; `env` looks up environment variables.
    pub fn resolve<F>(cli: CliArgs, toml_config: TomlConfig, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let TomlConfig {
            endpoint,
            server,
            settings,
            logging,
        } = toml_config;

        let socket = match cli.socket.or(endpoint.socket) {
            Some(socket) => Endpoint::at(socket),
            None => {
                let EndpointConfig {
                    directory,
                    prefix,
                    user,
                    session,
                    ..
                } = endpoint;
                Endpoint::from_lookup(directory, &prefix, |var| match var {
                    crate::endpoint::USER_VAR if user.is_some() => user.clone(),
                    crate::endpoint::SESSION_VAR if session.is_some() => session.clone(),
                    other => env(other),
                })?
            }
        };

        let mut bundle = SettingsBundle::with_script(server.script);
        for entry in settings {
            bundle.add(entry.into_setting()?)?;
        }

        Ok(Config {
            command: cli.command,
            socket: socket.into_path(),
            max_clients: server.max_clients,
            queue_warn_threshold: server.queue_warn_threshold,
            max_line_length: server.max_line_length,
            write_timeout: Duration::from_millis(server.write_timeout_ms),
            settings: bundle,
            log_level: cli.log_level.unwrap_or(logging.level),
        })
    }

    /// Options for `Server::bind`.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            socket: self.socket.clone(),
            max_clients: self.max_clients,
            queue_warn_threshold: self.queue_warn_threshold,
            max_line_length: self.max_line_length,
            write_timeout: self.write_timeout,
            settings: self.settings.clone(),
        }
    }
}

impl SettingConfig {
    fn into_setting(self) -> Result<Setting, ConfigError> {
        let name = self.name;
        let invalid = |reason: String| ConfigError::InvalidSetting {
            name: name.clone(),
            reason,
        };

        let default_value = to_value(self.default).map_err(&invalid)?;
        let value_type = match self.value_type {
            Some(t) => ValueType::from_name(&t)
                .ok_or_else(|| invalid(format!("unknown type `{}`", t)))?,
            None => match default_value {
                Value::Str(_) => ValueType::Str,
                Value::Int(_) => ValueType::Int,
                Value::Float(_) => ValueType::Float,
                Value::List(_) => ValueType::List,
            },
        };
        let number = |value: Option<toml::Value>| -> Result<Option<Number>, ConfigError> {
            match value {
                None => Ok(None),
                Some(toml::Value::Integer(i)) => Ok(Some(Number::Int(i))),
                Some(toml::Value::Float(x)) => Ok(Some(Number::Float(x))),
                Some(other) => Err(invalid(format!(
                    "expected a number, found {}",
                    other.type_str()
                ))),
            }
        };
        let minimum = number(self.minimum)?;
        let maximum = number(self.maximum)?;
        let epsilon = number(self.epsilon)?;
        let possible_values = match self.values {
            Some(values) => Some(
                values
                    .into_iter()
                    .map(to_value)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(&invalid)?,
            ),
            None => None,
        };

        Ok(Setting::from_parts(SettingParts {
            title: self.title.unwrap_or_else(|| name.clone()),
            name: name.clone(),
            value_type,
            current_value: default_value.clone(),
            default_value,
            minimum,
            maximum,
            epsilon,
            possible_values,
        })?)
    }
}

fn to_value(value: toml::Value) -> Result<Value, String> {
    match value {
        toml::Value::String(s) => Ok(Value::Str(s)),
        toml::Value::Integer(i) => Ok(Value::Int(i)),
        toml::Value::Float(x) => Ok(Value::Float(x)),
        toml::Value::Array(items) => items
            .into_iter()
            .map(to_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        other => Err(format!("unsupported value type {}", other.type_str())),
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Endpoint(EndpointError),
    InvalidSetting { name: String, reason: String },
    Settings(SettingsError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Endpoint(e) => write!(f, "Cannot determine socket path: {}", e),
            ConfigError::InvalidSetting { name, reason } => {
                write!(f, "Invalid setting '{}': {}", name, reason)
            }
            ConfigError::Settings(e) => write!(f, "Invalid settings: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<EndpointError> for ConfigError {
    fn from(e: EndpointError) -> Self {
        ConfigError::Endpoint(e)
    }
}

impl From<SettingsError> for ConfigError {
    fn from(e: SettingsError) -> Self {
        ConfigError::Settings(e)
    }
}
