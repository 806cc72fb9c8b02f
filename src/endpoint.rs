//! Socket path naming.
//!
//! Server and clients agree on a path of the form
//! `<directory>/<prefix>-<user>-<session>`, where the user and session
//! come from `$USER` and `$DISPLAY`. One server runs per user per display.

use std::fmt;
use std::path::{Path, PathBuf};

/// Directory the socket is created in by default.
pub const DEFAULT_DIRECTORY: &str = "/dev/shm";

/// File name prefix of the socket.
pub const DEFAULT_PREFIX: &str = ".blueshift-curse";

/// Environment variable naming the user.
pub const USER_VAR: &str = "USER";

/// Environment variable naming the display session.
pub const SESSION_VAR: &str = "DISPLAY";

/// Errors deriving the socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// A required environment variable is not set.
    MissingVariable(&'static str),
    /// A path component is empty.
    EmptyComponent(&'static str),
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::MissingVariable(var) => {
                write!(f, "environment variable ${} is not set", var)
            }
            EndpointError::EmptyComponent(what) => {
                write!(f, "socket name component '{}' is empty", what)
            }
        }
    }
}

impl std::error::Error for EndpointError {}

/// Location of the server socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    path: PathBuf,
}

impl Endpoint {
    /// Build the path from explicit components.
    pub fn new(
        directory: impl Into<PathBuf>,
        prefix: &str,
        user: &str,
        session: &str,
    ) -> Result<Self, EndpointError> {
        let prefix = component("prefix", prefix)?;
        let user = component("user", user)?;
        let session = component("session", session)?;

        let mut path = directory.into();
        path.push(format!("{}-{}-{}", prefix, user, session));
        Ok(Self { path })
    }

    /// Build the path, resolving user and session through `lookup`.
    ///
    /// `lookup` receives `USER_VAR` or `SESSION_VAR`.
    pub fn from_lookup<F>(
        directory: impl Into<PathBuf>,
        prefix: &str,
        lookup: F,
    ) -> Result<Self, EndpointError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let user = lookup(USER_VAR).ok_or(EndpointError::MissingVariable(USER_VAR))?;
        let session = lookup(SESSION_VAR).ok_or(EndpointError::MissingVariable(SESSION_VAR))?;
        Self::new(directory, prefix, &user, &session)
    }

    /// Build the path from the process environment.
    pub fn from_env(directory: impl Into<PathBuf>, prefix: &str) -> Result<Self, EndpointError> {
        Self::from_lookup(directory, prefix, |var| std::env::var(var).ok())
    }

    /// Use an explicit socket path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_path(self) -> PathBuf {
        self.path
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Validate one file name component; `/` would escape the directory.
fn component(what: &'static str, value: &str) -> Result<String, EndpointError> {
    if value.is_empty() {
        return Err(EndpointError::EmptyComponent(what));
    }
    Ok(value.replace('/', "_"))
}
