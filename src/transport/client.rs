//! Process-wide transport client.
//!
//! Holds at most one publish connection and one subscribe connection, both
//! created on first use from the same [`ConnectionConfig`]. Each connection
//! gets a watcher thread that reacts to its lifecycle events:
//! - errors are always logged
//! - the first `Connect` starts a liveness probe that pings, waits
//!   `ping_interval`, and pings again whether or not the last ping failed
//! - on the listener only, every event is forwarded to [`LifecycleHooks`] and
//!   `Ready` fires the one-shot callback passed to [`TransportClient::listener`]
//!
//! Background threads stop when the client is dropped.

use super::{Connection, ConnectionEvent, ConnectionRole, Connector, MessageHandler, PubSub};
use crate::config::{Config, ConnectionConfig, LifecycleHooks};
use crate::error::Result;
use crossbeam_channel::{select, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Called once, the first time the listener reports ready.
pub type ReadyCallback = Box<dyn FnOnce() + Send>;

pub struct TransportClient {
    config: ConnectionConfig,
    hooks: LifecycleHooks,
    connector: Arc<dyn Connector>,
    publisher: Mutex<Option<Arc<dyn Connection>>>,
    listener: Mutex<Option<Arc<dyn Connection>>>,
    /// Never sent on; dropping it disconnects `stop_rx` and stops the threads.
    _stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl TransportClient {
    pub fn new(config: &Config, connector: Arc<dyn Connector>) -> Self {
        let (stop_tx, stop_rx) = unbounded();
        Self {
            config: config.connection.clone(),
            hooks: config.hooks.clone(),
            connector,
            publisher: Mutex::new(None),
            listener: Mutex::new(None),
            _stop_tx: stop_tx,
            stop_rx,
        }
    }

    /// The publish connection, opened on first call.
    pub fn publisher(&self) -> Result<Arc<dyn Connection>> {
        let mut slot = self.publisher.lock();
        if let Some(conn) = slot.as_ref() {
            return Ok(Arc::clone(conn));
        }

        let conn = self.connector.connect(&self.config, ConnectionRole::Publisher)?;
        self.watch(Arc::clone(&conn), ConnectionRole::Publisher, None)?;
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// The subscribe connection, opened on first call.
    ///
    /// `on_ready` is only used when this call opens the connection; later
    /// calls return the existing listener and drop it.
    pub fn listener(&self, on_ready: Option<ReadyCallback>) -> Result<Arc<dyn Connection>> {
        let mut slot = self.listener.lock();
        if let Some(conn) = slot.as_ref() {
            return Ok(Arc::clone(conn));
        }

        let conn = self.connector.connect(&self.config, ConnectionRole::Listener)?;
        self.watch(Arc::clone(&conn), ConnectionRole::Listener, on_ready)?;
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    fn watch(
        &self,
        conn: Arc<dyn Connection>,
        role: ConnectionRole,
        on_ready: Option<ReadyCallback>,
    ) -> Result<()> {
        let watcher = Watcher {
            events: conn.lifecycle(),
            conn,
            role,
            hooks: self.hooks.clone(),
            on_ready,
            ping_interval: self.config.ping_interval(),
            stop: self.stop_rx.clone(),
            probing: false,
        };

        thread::Builder::new()
            .name(format!("changefeed-{:?}-watch", role).to_lowercase())
            .spawn(move || watcher.run())?;
        Ok(())
    }
}

impl PubSub for TransportClient {
    fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<()> {
        self.listener(None)?.subscribe(channel, handler)
    }

    fn unsubscribe(&self, channel: &str, handler: &MessageHandler) -> Result<()> {
        self.listener(None)?.unsubscribe(channel, handler)
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.publisher()?.publish(channel, payload)
    }
}

struct Watcher {
    conn: Arc<dyn Connection>,
    events: Receiver<ConnectionEvent>,
    role: ConnectionRole,
    hooks: LifecycleHooks,
    on_ready: Option<ReadyCallback>,
    ping_interval: Duration,
    stop: Receiver<()>,
    probing: bool,
}

impl Watcher {
    fn run(mut self) {
        let events = self.events.clone();
        let stop = self.stop.clone();

        loop {
            select! {
                recv(events) -> event => match event {
                    Ok(event) => self.handle(event),
                    Err(_) => break,
                },
                recv(stop) -> _ => break,
            }
        }
        tracing::debug!(role = ?self.role, "Connection watcher stopped");
    }

    fn handle(&mut self, event: ConnectionEvent) {
        if let ConnectionEvent::Error(ref message) = event {
            tracing::error!(role = ?self.role, error = %message, "Transport connection error");
        }

        if event == ConnectionEvent::Connect && !self.probing {
            self.probing = true;
            self.start_probe();
        }

        if self.role != ConnectionRole::Listener {
            return;
        }

        if event == ConnectionEvent::Ready {
            if let Some(on_ready) = self.on_ready.take() {
                on_ready();
            }
        }
        forward(&self.hooks, &event);
    }

    fn start_probe(&self) {
        let conn = Arc::clone(&self.conn);
        let stop = self.stop.clone();
        let interval = self.ping_interval;
        let role = self.role;

        let spawned = thread::Builder::new()
            .name(format!("changefeed-{:?}-ping", role).to_lowercase())
            .spawn(move || loop {
                if let Err(e) = conn.ping() {
                    tracing::error!(role = ?role, error = %e, "Liveness ping failed");
                }
                match stop.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            });

        if let Err(e) = spawned {
            tracing::error!(role = ?role, error = %e, "Could not start liveness probe");
        }
    }
}

fn forward(hooks: &LifecycleHooks, event: &ConnectionEvent) {
    match event {
        ConnectionEvent::Connect => match &hooks.connect {
            Some(hook) => hook(),
            None => tracing::info!("Established connection to transport"),
        },
        ConnectionEvent::Ready => match &hooks.ready {
            Some(hook) => hook(),
            None => tracing::info!("Connection to transport is ready"),
        },
        ConnectionEvent::Reconnecting => match &hooks.reconnecting {
            Some(hook) => hook(),
            None => tracing::info!("Reconnecting to transport"),
        },
        ConnectionEvent::End => match &hooks.end {
            Some(hook) => hook(),
            None => tracing::info!("Connection to transport ended"),
        },
        ConnectionEvent::Error(message) => {
            if let Some(hook) = &hooks.error {
                hook(message);
            }
        }
    }
}
