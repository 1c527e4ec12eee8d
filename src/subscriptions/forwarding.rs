//! Subscriber that hands deliveries to another thread.

use super::subscriber::{FieldInterest, Subscriber};
use super::types::{Delivery, DeliveryHandle};
use crate::error::SubscriberError;
use crate::storage::Collection;
use crate::types::{Document, Event};
use crossbeam_channel::{bounded, Sender, TrySendError};
use serde_json::Value;
use std::sync::Arc;

/// Default delivery buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Forwards every call into a bounded channel read through a
/// [`DeliveryHandle`].
///
/// The dispatcher never waits on a consumer: a full buffer or a dropped handle
/// is reported as a failed delivery.
pub struct ChannelSubscriber {
    channels: Vec<String>,
    collection: Arc<dyn Collection>,
    interest: FieldInterest,
    sender: Sender<Delivery>,
}

impl ChannelSubscriber {
    pub fn new(
        channels: Vec<String>,
        collection: Arc<dyn Collection>,
        interest: FieldInterest,
    ) -> (Arc<Self>, DeliveryHandle) {
        Self::with_buffer_size(channels, collection, interest, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(
        channels: Vec<String>,
        collection: Arc<dyn Collection>,
        interest: FieldInterest,
        buffer_size: usize,
    ) -> (Arc<Self>, DeliveryHandle) {
        let (sender, receiver) = bounded(buffer_size.max(1));
        let subscriber = Arc::new(Self {
            channels,
            collection,
            interest,
            sender,
        });
        (subscriber, DeliveryHandle { receiver })
    }

    fn forward(&self, delivery: Delivery) -> Result<(), SubscriberError> {
        match self.sender.try_send(delivery) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SubscriberError::new("delivery buffer full")),
            Err(TrySendError::Disconnected(_)) => Err(SubscriberError::new("delivery handle dropped")),
        }
    }
}

impl Subscriber for ChannelSubscriber {
    fn channels(&self) -> &[String] {
        &self.channels
    }

    fn collection(&self) -> Arc<dyn Collection> {
        Arc::clone(&self.collection)
    }

    fn fields_of_interest(&self) -> FieldInterest {
        self.interest.clone()
    }

    fn process(
        &self,
        event: Event,
        doc: &Document,
        fields: Option<&[String]>,
    ) -> Result<(), SubscriberError> {
        self.forward(Delivery::Change {
            event,
            doc: doc.clone(),
            fields: fields.map(<[String]>::to_vec),
        })
    }

    fn process_synthetic(
        &self,
        event: Event,
        doc: &Document,
        modifier: Option<&Value>,
        modified_top_level_fields: Option<&[String]>,
    ) -> Result<(), SubscriberError> {
        self.forward(Delivery::Synthetic {
            event,
            doc: doc.clone(),
            modifier: modifier.cloned(),
            modified_top_level_fields: modified_top_level_fields.map(<[String]>::to_vec),
        })
    }
}
