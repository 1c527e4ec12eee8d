//! Pub/sub transport.
//!
//! Two layers:
//! - [`PubSub`]: the three primitives the dispatcher consumes.
//! - [`Connection`] / [`Connector`]: a broker connection with liveness
//!   probing and lifecycle events, wrapped by [`TransportClient`] into one
//!   publish connection and one subscribe connection per process.
//!
//! [`MemoryBroker`] is an in-process broker; several dispatchers sharing one
//! broker behave like a fleet sharing a real one.

mod client;
mod memory;

pub use client::{ReadyCallback, TransportClient};
pub use memory::{MemoryBroker, MemoryConnection};

use crate::config::ConnectionConfig;
use crate::error::Result;
use crossbeam_channel::Receiver;
use std::sync::Arc;

/// Callback invoked with each raw message published on a channel.
pub type MessageHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Handlers are compared by identity, never by behaviour.
pub fn same_handler(a: &MessageHandler, b: &MessageHandler) -> bool {
    Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8
}

/// Publish/subscribe primitives.
pub trait PubSub: Send + Sync {
    fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<()>;

    /// Remove exactly this handler from the channel.
    fn unsubscribe(&self, channel: &str, handler: &MessageHandler) -> Result<()>;

    fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;
}

/// Connection lifecycle notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Ready,
    Reconnecting,
    Error(String),
    End,
}

/// What a connection is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionRole {
    Publisher,
    Listener,
}

/// A long-lived broker connection.
pub trait Connection: PubSub {
    /// No-op round trip used as a liveness probe.
    fn ping(&self) -> Result<()>;

    /// Stream of lifecycle events. Read by a single consumer.
    fn lifecycle(&self) -> Receiver<ConnectionEvent>;
}

/// Opens broker connections.
pub trait Connector: Send + Sync {
    fn connect(&self, config: &ConnectionConfig, role: ConnectionRole) -> Result<Arc<dyn Connection>>;
}
