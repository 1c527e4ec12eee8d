//! Channel registry and event dispatcher.
//!
//! All registry state lives on a single [`SerialQueue`] worker. Attaching,
//! detaching and every inbound event (local or from the transport) become
//! tasks on that queue, so a detach can never interleave with an event that
//! is half-way through delivery, and two attaches can never both create the
//! same channel.

use super::subscriber::{fields_of_interest_from_all, same_subscriber, FieldInterest, Subscriber};
use super::types::{DeliveryFailure, FailureHook, PublishOptions};
use crate::codec;
use crate::config::Config;
use crate::error::{Result, SubscriberError};
use crate::queue::{panic_message, QueueHandle, SerialQueue};
use crate::transport::{MessageHandler, PubSub};
use crate::types::{Document, Envelope, Event, ProcessId};
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

/// Name of the dispatch worker thread.
const WORKER_NAME: &str = "changefeed-dispatch";

/// Immutable settings shared by the worker and the transport handlers.
struct Context {
    uid: ProcessId,
    transport: Arc<dyn PubSub>,
    config: Config,
    failure_hook: Option<FailureHook>,
}

/// State owned by the dispatch worker.
///
/// A channel has an entry in `store` exactly when it has an entry in
/// `channel_handlers`, and only while at least one subscriber is attached.
struct Registry {
    store: BTreeMap<String, Vec<Arc<dyn Subscriber>>>,
    channel_handlers: HashMap<String, MessageHandler>,
    ctx: Arc<Context>,
    queue: QueueHandle<Registry>,
}

impl Registry {
    fn attach(&mut self, subscriber: Arc<dyn Subscriber>) {
        for channel in subscriber.channels() {
            if !self.store.contains_key(channel) {
                self.initialize_channel(channel);
            }
            if let Some(subscribers) = self.store.get_mut(channel) {
                subscribers.push(Arc::clone(&subscriber));
            }
        }
    }

    fn detach(&mut self, subscriber: &Arc<dyn Subscriber>) {
        for channel in subscriber.channels() {
            let Some(subscribers) = self.store.get_mut(channel) else {
                tracing::warn!(
                    channel = %channel,
                    "Trying to detach a subscriber from a non-existent channel"
                );
                continue;
            };

            subscribers.retain(|s| !same_subscriber(s, subscriber));
            if subscribers.is_empty() {
                self.destroy_channel(channel);
            }
        }
    }

    fn initialize_channel(&mut self, channel: &str) {
        let target = self.ctx.config.transport_channel(channel);
        tracing::debug!(channel = %target, "Subscribing to channel");

        let handler = channel_handler(channel.to_string(), Arc::clone(&self.ctx), self.queue.clone());
        if let Err(e) = self.ctx.transport.subscribe(&target, Arc::clone(&handler)) {
            tracing::error!(channel = %target, error = %e, "Transport subscribe failed");
        }

        self.channel_handlers.insert(channel.to_string(), handler);
        self.store.insert(channel.to_string(), Vec::new());
    }

    fn destroy_channel(&mut self, channel: &str) {
        let target = self.ctx.config.transport_channel(channel);
        tracing::debug!(channel = %target, "Unsubscribing from channel");

        if let Some(handler) = self.channel_handlers.remove(channel) {
            if let Err(e) = self.ctx.transport.unsubscribe(&target, &handler) {
                tracing::error!(channel = %target, error = %e, "Transport unsubscribe failed");
            }
        }
        self.store.remove(channel);
    }

    fn process(&self, channel: &str, envelope: Envelope, from_transport: bool) {
        let kind = if envelope.synthetic { "synthetic" } else { "real" };

        // Already applied optimistically when we published it.
        if from_transport && self.ctx.uid.as_str() == envelope.uid {
            tracing::debug!(
                channel = %channel, event = %envelope.event, kind, doc_id = ?envelope.doc_id(),
                "Ignored event (same uid)"
            );
            return;
        }

        let Some(subscribers) = self.store.get(channel) else {
            tracing::debug!(
                channel = %channel, event = %envelope.event, kind, doc_id = ?envelope.doc_id(),
                "Ignored event (no subscribers)"
            );
            return;
        };

        if self.ctx.config.debug {
            tracing::debug!(
                channel = %channel, event = %envelope.event, kind, doc_id = ?envelope.doc_id(),
                "Received event"
            );
        } else {
            tracing::trace!(
                channel = %channel, event = %envelope.event, kind, doc_id = ?envelope.doc_id(),
                "Received event"
            );
        }

        if subscribers.is_empty() {
            return;
        }

        if envelope.synthetic {
            for (index, subscriber) in subscribers.iter().enumerate() {
                self.deliver(channel, &envelope, index, || {
                    subscriber.process_synthetic(
                        envelope.event,
                        &envelope.doc,
                        envelope.modifier.as_ref(),
                        envelope.modified_top_level_fields.as_deref(),
                    )
                });
            }
            return;
        }

        let doc = match envelope.event {
            // A removed document cannot be fetched again.
            Event::Remove => Some(envelope.doc.clone()),
            Event::Insert | Event::Update => self.resolve_document(channel, subscribers, &envelope),
        };

        // Deleted before we got to it.
        let Some(doc) = doc else {
            return;
        };

        for (index, subscriber) in subscribers.iter().enumerate() {
            self.deliver(channel, &envelope, index, || {
                subscriber.process(envelope.event, &doc, envelope.fields.as_deref())
            });
        }
    }

    /// The document every subscriber of the channel receives for this event.
    fn resolve_document(
        &self,
        channel: &str,
        subscribers: &[Arc<dyn Subscriber>],
        envelope: &Envelope,
    ) -> Option<Document> {
        let collection = subscribers[0].collection();

        if !collection.protect_against_race_conditions() {
            return Some(envelope.doc.clone());
        }

        let Some(id) = envelope.doc_id() else {
            tracing::warn!(
                channel = %channel, event = %envelope.event, collection = collection.name(),
                "Event document has no _id; cannot resolve"
            );
            return None;
        };

        let fetched = match fields_of_interest_from_all(subscribers) {
            FieldInterest::All => collection.find_one(id, None),
            FieldInterest::Only(fields) => collection.find_one(id, Some(&fields)),
        };

        match fetched {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!(
                    channel = %channel, event = %envelope.event, collection = collection.name(),
                    doc_id = %id, error = %e,
                    "Failed to fetch authoritative document"
                );
                None
            }
        }
    }

    /// Run one subscriber callback, containing both errors and panics.
    fn deliver<F>(&self, channel: &str, envelope: &Envelope, index: usize, call: F)
    where
        F: FnOnce() -> std::result::Result<(), SubscriberError>,
    {
        let message = match panic::catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };

        tracing::error!(
            channel = %channel,
            event = %envelope.event,
            synthetic = envelope.synthetic,
            doc_id = ?envelope.doc_id(),
            subscriber = index,
            error = %message,
            "Exception while processing event"
        );

        if let Some(hook) = &self.ctx.failure_hook {
            hook(&DeliveryFailure {
                channel: channel.to_string(),
                event: envelope.event,
                synthetic: envelope.synthetic,
                doc_id: envelope.doc_id().cloned(),
                subscriber: index,
                message,
            });
        }
    }
}

/// Transport callback for one channel: decode, then re-enqueue.
fn channel_handler(channel: String, ctx: Arc<Context>, queue: QueueHandle<Registry>) -> MessageHandler {
    Arc::new(move |payload: &[u8]| {
        let envelope = match codec::decode(payload, ctx.config.wire_format) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "Dropping undecodable message");
                return;
            }
        };

        let channel = channel.clone();
        if queue
            .queue_task(move |registry| registry.process(&channel, envelope, true))
            .is_err()
        {
            tracing::debug!("Dispatcher stopped; dropping message");
        }
    })
}

struct Inner {
    queue: SerialQueue<Registry>,
}

/// Process-wide subscription registry and dispatcher.
///
/// Construct one per process and share it (`Arc`) with whatever attaches
/// subscribers or publishes changes. The dispatch worker starts on
/// [`init`](Self::init) or on first use.
pub struct SubscriptionManager {
    ctx: Arc<Context>,
    inner: OnceLock<Inner>,
}

impl SubscriptionManager {
    /// Dispatcher over `transport`, with a fresh process uid.
    pub fn new(config: Config, transport: Arc<dyn PubSub>) -> Self {
        Self::build(config, transport, None)
    }

    /// Like [`new`](Self::new), reporting failed deliveries to `hook`.
    pub fn with_failure_hook(config: Config, transport: Arc<dyn PubSub>, hook: FailureHook) -> Self {
        Self::build(config, transport, Some(hook))
    }

    fn build(config: Config, transport: Arc<dyn PubSub>, failure_hook: Option<FailureHook>) -> Self {
        let ctx = Context {
            uid: ProcessId::generate(),
            transport,
            config,
            failure_hook,
        };
        Self {
            ctx: Arc::new(ctx),
            inner: OnceLock::new(),
        }
    }

    /// Start the dispatch worker. Calling it again is a no-op.
    pub fn init(&self) -> Result<()> {
        if self.inner.get().is_some() {
            tracing::debug!(uid = %self.ctx.uid, "Init called, but was already initialized");
            return Ok(());
        }
        self.inner()?;
        Ok(())
    }

    fn inner(&self) -> Result<&Inner> {
        if let Some(inner) = self.inner.get() {
            return Ok(inner);
        }

        let ctx = Arc::clone(&self.ctx);
        let queue = SerialQueue::start_with(WORKER_NAME, move |queue| Registry {
            store: BTreeMap::new(),
            channel_handlers: HashMap::new(),
            ctx,
            queue,
        })?;

        // Losing a concurrent race just drops the spare worker.
        let inner = self.inner.get_or_init(|| Inner { queue });
        tracing::debug!(uid = %self.ctx.uid, "Initialized");
        Ok(inner)
    }

    /// Identifier stamped on everything this process publishes.
    pub fn uid(&self) -> &ProcessId {
        &self.ctx.uid
    }

    /// Settings this dispatcher was built with.
    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// Register a subscriber on all of its channels.
    ///
    /// Queued; takes effect after every previously queued operation.
    pub fn attach(&self, subscriber: Arc<dyn Subscriber>) {
        self.enqueue("attach", move |registry| registry.attach(subscriber));
    }

    /// Remove a subscriber from all of its channels, dropping channels left
    /// without subscribers.
    pub fn detach(&self, subscriber: &Arc<dyn Subscriber>) {
        let subscriber = Arc::clone(subscriber);
        self.enqueue("detach", move |registry| registry.detach(&subscriber));
    }

    /// Apply an envelope to this process's subscribers without going through
    /// the transport.
    pub fn process(&self, channel: &str, envelope: Envelope) {
        let channel = channel.to_string();
        self.enqueue("process", move |registry| registry.process(&channel, envelope, false));
    }

    /// Publish using [`Config::mutation_defaults`].
    pub fn publish(&self, channel: &str, envelope: Envelope) {
        self.publish_with(channel, envelope, self.ctx.config.mutation_defaults.into());
    }

    /// Apply the envelope locally if `optimistic`, and push it to the
    /// transport if requested.
    ///
    /// Only an optimistically applied envelope carries this process's uid, so
    /// a non-optimistic one comes back from the transport and is delivered
    /// here like any other.
    ///
    /// Failures are logged; nothing is returned to the publisher.
    pub fn publish_with(&self, channel: &str, mut envelope: Envelope, options: PublishOptions) {
        envelope.uid = if options.optimistic {
            self.ctx.uid.to_string()
        } else {
            String::new()
        };

        let push = options.push_to_transport && !self.ctx.config.external_publisher;
        if options.optimistic {
            if push {
                self.process(channel, envelope.clone());
            } else {
                self.process(channel, envelope);
                return;
            }
        }

        if push {
            let target = self.ctx.config.transport_channel(channel);
            let sent = codec::encode(&envelope, self.ctx.config.wire_format)
                .and_then(|payload| self.ctx.transport.publish(&target, &payload));
            if let Err(e) = sent {
                tracing::error!(channel = %target, event = %envelope.event, error = %e, "Publish failed");
            }
        }
    }

    /// Every attached subscriber, once each, regardless of channel.
    pub fn all_subscribers(&self) -> Result<Vec<Arc<dyn Subscriber>>> {
        self.inner()?.queue.run_task(|registry| {
            let mut all: Vec<Arc<dyn Subscriber>> = Vec::new();
            for subscriber in registry.store.values().flatten() {
                if !all.iter().any(|s| same_subscriber(s, subscriber)) {
                    all.push(Arc::clone(subscriber));
                }
            }
            all
        })
    }

    /// Channels that currently have subscribers, sorted.
    pub fn channels(&self) -> Result<Vec<String>> {
        self.inner()?.queue.run_task(|registry| {
            debug_assert_eq!(registry.store.len(), registry.channel_handlers.len());
            registry.store.keys().cloned().collect()
        })
    }

    /// Subscribers attached to `channel`; zero for unknown channels.
    pub fn subscriber_count(&self, channel: &str) -> Result<usize> {
        let channel = channel.to_string();
        self.inner()?
            .queue
            .run_task(move |registry| registry.store.get(&channel).map_or(0, Vec::len))
    }

    /// Wait until every operation queued so far has been applied.
    pub fn flush(&self) -> Result<()> {
        self.inner()?.queue.flush()
    }

    fn enqueue<F>(&self, operation: &'static str, task: F)
    where
        F: FnOnce(&mut Registry) + Send + 'static,
    {
        let queued = self.inner().and_then(|inner| inner.queue.queue_task(task));
        if let Err(e) = queued {
            tracing::error!(operation, error = %e, "Could not queue dispatcher task");
        }
    }
}
