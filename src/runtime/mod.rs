//! Socket runtime for the notification channel.
//!
//! Everything here is protocol-agnostic: it moves newline-terminated text
//! lines between processes and keeps track of who is connected.
//!
//! - `LineBuffer` / `LineReader`: line assembly over arbitrary read splits
//! - `Connection`: one framed peer, independently readable and writable
//! - `ConnectionRegistry`: the set of live peers
//! - `Listener`: owner-only Unix socket that produces connections
//! - `PendingQueue`: FIFO feeding the multiplexed read

mod buffer;
mod connection;
mod listener;
mod queue;

pub use buffer::{LineBuffer, LineReader, DEFAULT_MAX_LINE_LENGTH, LINE_TERMINATOR};
pub use connection::{
    Connection, ConnectionId, ConnectionRegistry, RegistryError, TransportError,
    DEFAULT_WRITE_TIMEOUT,
};
pub use listener::{BindError, Listener, MAX_SOCKET_PATH};
pub use queue::PendingQueue;
