//! Messages, offsets and delivery events.
//!
//! Payloads are opaque bytes: relaykit never decodes them. Middleware and
//! topic handlers receive exactly the bytes the client produced.

use crate::client::ClientError;

/// A message read from, or written to, a topic.
///
/// `partition` and `offset` are `None` for messages that have not been
/// assigned a position yet (i.e. before the broker acknowledged them).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Topic id
    pub topic: String,
    /// Partition id, if known
    pub partition: Option<i32>,
    /// Offset within the partition, if known
    pub offset: Option<i64>,
    /// Key bytes
    pub key: Option<Vec<u8>>,
    /// Value bytes
    pub value: Vec<u8>,
    /// Per-message delivery error reported by the broker
    pub error: Option<ClientError>,
}

impl Message {
    /// Create a message for `topic` carrying `value`.
    ///
    /// # Example
    ///
    /// ```
    /// use relaykit_core::Message;
    ///
    /// let msg = Message::new("orders", b"order placed".to_vec()).with_key("customer-7");
    /// assert_eq!(msg.topic, "orders");
    /// assert_eq!(msg.key.as_deref(), Some(&b"customer-7"[..]));
    /// ```
    #[must_use]
    pub fn new(topic: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            value: value.into(),
            ..Self::default()
        }
    }

    /// Set the message key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Pin the message to a partition.
    #[must_use]
    pub const fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Set the offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Attach a delivery error.
    #[must_use]
    pub fn with_error(mut self, error: ClientError) -> Self {
        self.error = Some(error);
        self
    }

    /// Whether the message is addressed to a topic at all.
    #[must_use]
    pub fn has_topic(&self) -> bool {
        !self.topic.is_empty()
    }

    /// The position of this message, if the client assigned one.
    #[must_use]
    pub fn position(&self) -> Option<TopicPartitionOffset> {
        Some(TopicPartitionOffset {
            topic: self.topic.clone(),
            partition: self.partition?,
            offset: self.offset?,
        })
    }
}

/// A topic/partition/offset triple, as used for commits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartitionOffset {
    /// Topic id
    pub topic: String,
    /// Partition id
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

impl std::fmt::Display for TopicPartitionOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// An event the client emits that relaykit has no dedicated variant for.
///
/// Forwarded as-is so that drift in the client library stays visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnexpectedEvent {
    /// Short name of the event shape (e.g. `"statistics"`)
    pub kind: String,
    /// Human-readable rendering of the event
    pub detail: String,
}

impl UnexpectedEvent {
    /// Create a new unexpected event description.
    #[must_use]
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for UnexpectedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} event: {}", self.kind, self.detail)
    }
}

/// Outcome notifications produced by a producer client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// Delivery report for one message; `Message::error` is set on failure
    Delivered(Message),
    /// Instance-level client condition (informational)
    ClientError(ClientError),
    /// Anything else the client emitted
    Unexpected(UnexpectedEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_requires_partition_and_offset() {
        let msg = Message::new("orders", b"x".to_vec());
        assert_eq!(msg.position(), None);

        let msg = msg.with_partition(3).with_offset(42);
        assert_eq!(
            msg.position(),
            Some(TopicPartitionOffset {
                topic: "orders".to_string(),
                partition: 3,
                offset: 42,
            })
        );
    }

    #[test]
    fn empty_topic_is_not_a_topic() {
        assert!(!Message::new("", b"x".to_vec()).has_topic());
        assert!(Message::new("t", Vec::new()).has_topic());
    }

    #[test]
    fn offset_display() {
        let tpo = TopicPartitionOffset {
            topic: "payments".to_string(),
            partition: 1,
            offset: 7,
        };
        assert_eq!(tpo.to_string(), "payments[1]@7");
    }
}
