//! blueshift-ipc: local notification channel for a display adjustment daemon
//!
//! One long-running server publishes its settings to any number of
//! short-lived clients over a Unix domain socket and accepts updates and
//! commands from them.
//!
//! Features:
//! - Newline-framed text connections with lossy UTF-8 decoding
//! - Owner-only socket with stale socket recovery
//! - Multiplexed FIFO read over all connected clients
//! - Broadcast and unicast delivery with automatic deregistration
//! - Closed-schema settings bundle codec
//! - Signal-based control of the server process

pub mod client;
pub mod config;
pub mod control;
pub mod endpoint;
pub mod protocol;
pub mod protocols;
pub mod runtime;
pub mod server;
pub mod settings;

pub use client::{ConnectError, NoticeHandler, Session};
pub use control::{ControlAction, ControlError, ServerControl};
pub use endpoint::{Endpoint, EndpointError};
pub use protocol::{Notice, ProtocolError};
pub use protocols::bundle::MalformedPayload;
pub use runtime::{BindError, Connection, RegistryError, TransportError};
pub use server::{Broker, CommandHandler, Message, Recipient, Reply, Server, ServerOptions};
pub use settings::{Setting, SettingsBundle, SettingsError, Value, ValueType};
