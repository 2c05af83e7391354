//! Client capability sets: the boundary between relaykit and the broker client.
//!
//! Relaykit never talks to a broker itself. Everything that touches the wire
//! goes through one of two role-specific capability sets:
//!
//! - [`ConsumerApi`] creates [`ConsumerClient`] handles (close, subscribe,
//!   read, commit)
//! - [`ProducerApi`] creates [`ProducerClient`] handles (close, produce,
//!   flush, delivery event stream)
//!
//! The default implementations live in `relaykit-redpanda` (rdkafka). Test
//! doubles live in `relaykit-testing`. A capability set is chosen once, when a
//! consumer or producer is constructed, and never changes afterwards.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   create(settings)   ┌─────────────────────┐
//! │   Consumer   │ ───────────────────► │  ConsumerApi        │
//! │   Producer   │                      │  ProducerApi        │
//! └──────┬───────┘                      └──────────┬──────────┘
//!        │                                         │
//!        │  subscribe / read / commit / produce    ▼
//!        └──────────────────────────────► ┌─────────────────────┐
//!                                         │ ConsumerClient      │
//!                                         │ ProducerClient      │
//!                                         └─────────────────────┘
//! ```

use crate::config::Settings;
use crate::message::{DeliveryEvent, Message, TopicPartitionOffset};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by the underlying broker client.
///
/// The variants mirror the boundary operations so that callers can tell a
/// failed read from a failed commit without inspecting strings. The type is
/// `Clone` because delivery events carry it across channels.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The client's local send queue is full (transient, retryable)
    #[error("Local send queue is full")]
    QueueFull,

    /// The client instance could not be created
    #[error("Client creation failed: {0}")]
    Creation(String),

    /// Subscribing to topics failed
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    Subscription {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Reading the next message failed
    #[error("Read failed: {0}")]
    Read(String),

    /// Committing offsets failed
    #[error("Commit failed: {0}")]
    Commit(String),

    /// The client refused to enqueue a message
    #[error("Produce failed for topic '{topic}': {reason}")]
    Produce {
        /// The topic the message was addressed to
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// The broker reported a failed delivery for a message
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Instance-level condition (broker down, authentication, ...)
    ///
    /// The client recovers from these on its own; they are informational.
    #[error("Client error: {0}")]
    Instance(String),
}

impl ClientError {
    /// Whether the error is the transient "send queue full" condition that
    /// the producer retry engine backs off on.
    #[must_use]
    pub const fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull)
    }
}

/// Boxed future returned by the async client operations.
pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ClientError>> + Send + 'a>>;

/// Single-use delivery channel bound to one produced message.
///
/// Exactly one [`DeliveryEvent`] is sent on it; the receiving side is
/// dropped after that event (or on any early exit).
pub type DeliverySender = tokio::sync::oneshot::Sender<DeliveryEvent>;

/// The shared stream of delivery events for a producer client.
///
/// The stream is bounded by the `relaykit.events.channel.size` setting; once
/// it is full, further events are dropped until the reader catches up.
pub type DeliveryEvents = tokio::sync::mpsc::Receiver<DeliveryEvent>;

/// Which role a capability set serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    /// Consumer-shaped capability set
    Consumer,
    /// Producer-shaped capability set
    Producer,
}

impl std::fmt::Display for ClientRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Consumer => f.write_str("consumer"),
            Self::Producer => f.write_str("producer"),
        }
    }
}

/// Factory half of the consumer capability set (`Create`).
pub trait ConsumerApi: Send + Sync {
    /// Create a consumer client from the given settings.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Creation`] if the underlying client rejects the
    /// settings or cannot be instantiated.
    fn create(&self, settings: &Settings) -> Result<Box<dyn ConsumerClient>, ClientError>;
}

/// A live consumer client handle.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the consumer loop reads from one
/// task while `close` may be called from another.
pub trait ConsumerClient: Send + Sync {
    /// Release the client. Called exactly once by the owning consumer.
    fn close(&self);

    /// Register interest in the given topics.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Subscription`] if the subscription is rejected.
    fn subscribe(&self, topics: &[String]) -> Result<(), ClientError>;

    /// Read the next message.
    ///
    /// `None` waits forever. `Ok(None)` means the client woke up without a
    /// message (housekeeping or an elapsed timeout) and should be ignored.
    fn read_message(&self, timeout: Option<Duration>) -> ClientFuture<'_, Option<Message>>;

    /// Commit offsets, returning the offsets the client accepted.
    ///
    /// Offsets are the positions of the processed messages themselves;
    /// translating to the broker's "next offset" convention is up to the
    /// client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Commit`] if the commit fails.
    fn commit_offsets(
        &self,
        offsets: &[TopicPartitionOffset],
    ) -> Result<Vec<TopicPartitionOffset>, ClientError>;
}

/// Factory half of the producer capability set (`Create`).
pub trait ProducerApi: Send + Sync {
    /// Create a producer client from the given settings.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Creation`] if the underlying client rejects the
    /// settings or cannot be instantiated.
    fn create(&self, settings: &Settings) -> Result<Box<dyn ProducerClient>, ClientError>;
}

/// A live producer client handle.
pub trait ProducerClient: Send + Sync {
    /// Release the client. Ends the shared delivery event stream.
    fn close(&self);

    /// Enqueue a message for delivery.
    ///
    /// When `delivery` is set, the outcome for this message is sent there
    /// instead of on the shared event stream.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::QueueFull`] when the local queue is full, or
    /// [`ClientError::Produce`] for any other enqueue failure.
    fn produce(&self, message: Message, delivery: Option<DeliverySender>) -> Result<(), ClientError>;

    /// Wait up to `timeout` for outstanding deliveries, returning how many
    /// messages are still in flight afterwards.
    fn flush(&self, timeout: Duration) -> usize;

    /// Take the shared delivery event stream.
    ///
    /// The stream can be taken once; later calls return `None`.
    fn events(&self) -> Option<DeliveryEvents>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_is_the_only_transient_error() {
        assert!(ClientError::QueueFull.is_queue_full());
        assert!(!ClientError::Read("gone".to_string()).is_queue_full());
        assert!(!ClientError::Instance("broker down".to_string()).is_queue_full());
    }

    #[test]
    fn subscription_error_names_topics() {
        let err = ClientError::Subscription {
            topics: vec!["orders".to_string()],
            reason: "unknown topic".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("orders"));
        assert!(text.contains("unknown topic"));
    }

    #[test]
    fn client_role_display() {
        assert_eq!(ClientRole::Consumer.to_string(), "consumer");
        assert_eq!(ClientRole::Producer.to_string(), "producer");
    }
}
