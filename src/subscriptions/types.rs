//! Types exchanged with the dispatcher.

use crate::config::MutationDefaults;
use crate::types::{Document, Event};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// How a published envelope is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishOptions {
    /// Send to every process via the transport.
    pub push_to_transport: bool,
    /// Apply to this process's subscribers right away.
    pub optimistic: bool,
}

impl From<MutationDefaults> for PublishOptions {
    fn from(defaults: MutationDefaults) -> Self {
        Self {
            push_to_transport: defaults.push_to_transport,
            optimistic: defaults.optimistic,
        }
    }
}

/// A subscriber callback that failed or panicked.
#[derive(Clone, Debug)]
pub struct DeliveryFailure {
    pub channel: String,
    pub event: Event,
    pub synthetic: bool,
    pub doc_id: Option<Value>,
    /// Position of the subscriber in the channel's list.
    pub subscriber: usize,
    pub message: String,
}

/// Observer notified of every [`DeliveryFailure`]. Runs on the dispatch
/// worker and must not block.
pub type FailureHook = Arc<dyn Fn(&DeliveryFailure) + Send + Sync>;

/// One call made on a [`super::ChannelSubscriber`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delivery {
    Change {
        event: Event,
        doc: Document,
        fields: Option<Vec<String>>,
    },
    Synthetic {
        event: Event,
        doc: Document,
        modifier: Option<Value>,
        modified_top_level_fields: Option<Vec<String>>,
    },
}

impl Delivery {
    pub fn event(&self) -> Event {
        match self {
            Delivery::Change { event, .. } | Delivery::Synthetic { event, .. } => *event,
        }
    }

    pub fn doc(&self) -> &Document {
        match self {
            Delivery::Change { doc, .. } | Delivery::Synthetic { doc, .. } => doc,
        }
    }
}

/// Receiving side of a [`super::ChannelSubscriber`].
pub struct DeliveryHandle {
    pub receiver: crossbeam_channel::Receiver<Delivery>,
}

impl DeliveryHandle {
    /// Receive the next delivery (blocking).
    pub fn recv(&self) -> Result<Delivery, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a delivery (non-blocking).
    pub fn try_recv(&self) -> Result<Delivery, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Delivery, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
