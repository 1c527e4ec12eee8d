//! Subscription registry and dispatch.
//!
//! - [`SubscriptionManager`]: channel → subscribers registry, serialized event
//!   processing, self-echo suppression and authoritative document resolution
//! - [`Subscriber`]: what the calling layer implements to receive changes
//! - [`ChannelSubscriber`]: a ready-made subscriber that forwards deliveries
//!   to a [`DeliveryHandle`]
//!
//! # Example
//!
//! ```ignore
//! let broker = MemoryBroker::new();
//! let client = Arc::new(TransportClient::new(&config, Arc::new(broker)));
//! let manager = SubscriptionManager::new(config, client);
//!
//! let tasks = Arc::new(MemoryCollection::new("tasks"));
//! let (subscriber, handle) =
//!     ChannelSubscriber::new(vec!["tasks".into()], tasks, FieldInterest::All);
//! manager.attach(subscriber);
//!
//! manager.publish("tasks", Envelope::synthetic(Event::Update, doc, json!({"$set": {"done": true}})));
//! let delivery = handle.recv()?;
//! ```

mod forwarding;
mod manager;
mod subscriber;
mod types;

pub use forwarding::{ChannelSubscriber, DEFAULT_BUFFER_SIZE};
pub use manager::SubscriptionManager;
pub use subscriber::{fields_of_interest_from_all, same_subscriber, FieldInterest, Subscriber};
pub use types::{Delivery, DeliveryFailure, DeliveryHandle, FailureHook, PublishOptions};
