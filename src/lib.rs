//! # Change Feed
//!
//! Reactive change distribution across a fleet of processes.
//!
//! A process publishes document change events (insert, update, remove, or a
//! manually triggered "synthetic" change) on named channels of a shared
//! pub/sub transport. Every process delivers them to the subscribers it has
//! attached to those channels, skipping events it published itself (already
//! applied locally) and re-reading documents at dispatch time so subscribers
//! never act on a stale snapshot.
//!
//! ## Core Concepts
//!
//! - **Envelope**: one change on the wire, stamped with its publisher's uid
//! - **Channel**: opaque key subscribers listen on
//! - **Subscriber**: the calling layer's interest registration
//! - **SubscriptionManager**: registry + dispatcher, serialized on one queue
//! - **TransportClient**: one publish and one subscribe connection per process
//!
//! ## Example
//!
//! ```ignore
//! use changefeed::{Config, Envelope, MemoryBroker, SubscriptionManager, TransportClient};
//!
//! let config = Config::from_env()?.unwrap_or_default();
//! let transport = Arc::new(TransportClient::new(&config, Arc::new(MemoryBroker::new())));
//! let manager = SubscriptionManager::new(config, transport);
//! manager.init()?;
//!
//! manager.attach(subscriber);
//! manager.publish("tasks", Envelope::insert(doc));
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod queue;
pub mod storage;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use codec::WireFormat;
pub use config::{Config, ConnectionConfig, LifecycleHooks, MutationDefaults};
pub use error::{DispatchError, Result, SubscriberError};
pub use queue::{QueueHandle, SerialQueue};
pub use storage::{Collection, MemoryCollection};
pub use subscriptions::{
    fields_of_interest_from_all, ChannelSubscriber, Delivery, DeliveryFailure, DeliveryHandle,
    FailureHook, FieldInterest, PublishOptions, Subscriber, SubscriptionManager,
};
pub use transport::{
    Connection, ConnectionEvent, ConnectionRole, Connector, MemoryBroker, MemoryConnection,
    MessageHandler, PubSub, TransportClient,
};
pub use types::*;
