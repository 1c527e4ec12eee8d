//! Error types for change distribution.

use thiserror::Error;

/// Main error type for dispatcher, transport and storage operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection is not established")]
    NotConnected,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Document has no _id")]
    MissingDocumentId,

    #[error("Subscriber error: {0}")]
    Subscriber(String),

    #[error("Task queue is closed")]
    QueueClosed,

    #[error("Cannot wait on the task queue from inside a queued task")]
    Reentrant,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for DispatchError {
    fn from(e: serde_json::Error) -> Self {
        DispatchError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for DispatchError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        DispatchError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DispatchError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        DispatchError::Deserialization(e.to_string())
    }
}

/// Failure reported by a subscriber callback.
///
/// Never propagates past the dispatcher; it is logged and handed to the
/// failure hook.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct SubscriberError(pub String);

impl SubscriberError {
    pub fn new(message: impl Into<String>) -> Self {
        SubscriberError(message.into())
    }
}

impl From<DispatchError> for SubscriberError {
    fn from(e: DispatchError) -> Self {
        SubscriberError(e.to_string())
    }
}

/// Result type for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
