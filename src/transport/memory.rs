//! In-process broker.

use super::{same_handler, Connection, ConnectionEvent, ConnectionRole, Connector, MessageHandler, PubSub};
use crate::config::ConnectionConfig;
use crate::error::{DispatchError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

struct Registration {
    connection_id: u64,
    online: Arc<AtomicBool>,
    handler: MessageHandler,
}

#[derive(Default)]
struct BrokerInner {
    channels: RwLock<HashMap<String, Vec<Registration>>>,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
    next_connection: AtomicU64,
    published: AtomicUsize,
}

/// Broker shared by every connection it hands out.
///
/// Delivery is synchronous on the publishing thread, skipping connections
/// that are currently offline.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection and keep a concrete handle to it.
    pub fn open(&self, role: ConnectionRole) -> Arc<MemoryConnection> {
        let id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);
        let (events_tx, events_rx) = unbounded();

        let connection = Arc::new(MemoryConnection {
            id,
            role,
            broker: Arc::clone(&self.inner),
            online: Arc::new(AtomicBool::new(true)),
            events_tx,
            events_rx,
            pings: AtomicUsize::new(0),
        });
        connection.emit(ConnectionEvent::Connect);
        connection.emit(ConnectionEvent::Ready);

        self.inner.connections.lock().push(Arc::downgrade(&connection));
        connection
    }

    /// Every connection opened so far that is still held somewhere.
    pub fn connections(&self) -> Vec<Arc<MemoryConnection>> {
        self.inner
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Number of handlers registered on a channel.
    pub fn handler_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .read()
            .get(channel)
            .map_or(0, |regs| regs.len())
    }

    /// Messages accepted by `publish` so far.
    pub fn published_count(&self) -> usize {
        self.inner.published.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryBroker {
    fn connect(&self, _config: &ConnectionConfig, role: ConnectionRole) -> Result<Arc<dyn Connection>> {
        let connection: Arc<dyn Connection> = self.open(role);
        Ok(connection)
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    role: ConnectionRole,
    broker: Arc<BrokerInner>,
    online: Arc<AtomicBool>,
    events_tx: Sender<ConnectionEvent>,
    events_rx: Receiver<ConnectionEvent>,
    pings: AtomicUsize,
}

impl MemoryConnection {
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Drop the link. Subscriptions are kept and resume on reconnect.
    pub fn disconnect(&self) {
        self.online.store(false, Ordering::SeqCst);
        self.emit(ConnectionEvent::End);
    }

    pub fn reconnect(&self) {
        self.emit(ConnectionEvent::Reconnecting);
        self.online.store(true, Ordering::SeqCst);
        self.emit(ConnectionEvent::Connect);
        self.emit(ConnectionEvent::Ready);
    }

    /// Report a connection error without changing state.
    pub fn fail(&self, message: impl Into<String>) {
        self.emit(ConnectionEvent::Error(message.into()));
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }
}

impl PubSub for MemoryConnection {
    fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<()> {
        self.broker
            .channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .push(Registration {
                connection_id: self.id,
                online: Arc::clone(&self.online),
                handler,
            });
        Ok(())
    }

    fn unsubscribe(&self, channel: &str, handler: &MessageHandler) -> Result<()> {
        let mut channels = self.broker.channels.write();
        if let Some(regs) = channels.get_mut(channel) {
            regs.retain(|reg| !(reg.connection_id == self.id && same_handler(&reg.handler, handler)));
            if regs.is_empty() {
                channels.remove(channel);
            }
        }
        Ok(())
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        if !self.is_online() {
            return Err(DispatchError::NotConnected);
        }
        self.broker.published.fetch_add(1, Ordering::SeqCst);

        // Handlers run without the table lock so they may (un)subscribe.
        let handlers: Vec<MessageHandler> = self
            .broker
            .channels
            .read()
            .get(channel)
            .map(|regs| {
                regs.iter()
                    .filter(|reg| reg.online.load(Ordering::SeqCst))
                    .map(|reg| Arc::clone(&reg.handler))
                    .collect()
            })
            .unwrap_or_default();

        for handler in handlers {
            handler(payload);
        }
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn ping(&self) -> Result<()> {
        if !self.is_online() {
            return Err(DispatchError::NotConnected);
        }
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn lifecycle(&self) -> Receiver<ConnectionEvent> {
        self.events_rx.clone()
    }
}
