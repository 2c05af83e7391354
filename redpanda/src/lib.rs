//! rdkafka-backed client capability sets for relaykit.
//!
//! This crate provides the default implementations of the
//! [`ConsumerApi`](relaykit_core::ConsumerApi) and
//! [`ProducerApi`](relaykit_core::ProducerApi) capability sets from
//! `relaykit-core`, using rdkafka (Kafka-compatible) under the hood. Any
//! Kafka-compatible broker works: Redpanda, Apache Kafka, AWS MSK, ...
//!
//! # Mapping
//!
//! | Capability | rdkafka |
//! |---|---|
//! | `create` | [`ClientConfig::create`] from the relaykit settings |
//! | `subscribe` | `Consumer::subscribe` |
//! | `read_message` | `StreamConsumer::recv`, optionally under `tokio::time::timeout` |
//! | `commit_offsets` | `Consumer::commit` (sync), offset + 1 |
//! | `produce` | `ThreadedProducer::send`, delivery routed by the record opaque |
//! | `flush` | `Producer::flush` then `in_flight_count` |
//! | `events` | client errors, statistics and shared delivery reports |
//!
//! Rebalancing, reconnection and wire-level retries are left to librdkafka.
//!
//! # Example
//!
//! ```no_run
//! use relaykit_core::{ConsumerApi, Config};
//! use relaykit_redpanda::RdKafkaConsumerApi;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = Config::new()
//!     .with_bootstrap_servers("localhost:9092")
//!     .with_group_id("inventory");
//! let client = RdKafkaConsumerApi.create(cfg.settings())?;
//! client.subscribe(&["inventory-events".to_string()])?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consumer;
pub mod producer;

pub use consumer::{RdKafkaConsumerApi, RdKafkaConsumerClient};
pub use producer::{DeliveryRoute, RdKafkaProducerApi, RdKafkaProducerClient, RelayContext};

use rdkafka::config::ClientConfig;
use rdkafka::message::Message as KafkaMessage;
use relaykit_core::{Message, Settings};

/// Render relaykit settings into an rdkafka [`ClientConfig`].
///
/// `relaykit.*` settings stay behind; librdkafka rejects unknown properties.
#[must_use]
pub fn client_config(settings: &Settings) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in settings.client_properties() {
        config.set(key, value.to_string());
    }
    config
}

/// Copy an rdkafka message into an owned relaykit [`Message`].
pub(crate) fn to_message<M: KafkaMessage>(message: &M) -> Message {
    Message {
        topic: message.topic().to_string(),
        partition: Some(message.partition()),
        offset: Some(message.offset()),
        key: message.key().map(<[u8]>::to_vec),
        value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::OwnedMessage;
    use rdkafka::message::Timestamp;
    use relaykit_core::Config;

    #[test]
    fn settings_are_rendered_as_text() {
        let cfg = Config::new()
            .with_bootstrap_servers(["a:9092", "b:9092"])
            .with_auto_commit(false)
            .with_batch_size(1024);

        let config = client_config(cfg.settings());

        assert_eq!(config.get("bootstrap.servers"), Some("a:9092,b:9092"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("batch.size"), Some("1024"));
    }

    #[test]
    fn local_settings_are_not_rendered() {
        let cfg = Config::new()
            .with_bootstrap_servers("a:9092")
            .with_events_channel_size(16);

        let config = client_config(cfg.settings());

        assert_eq!(config.get("bootstrap.servers"), Some("a:9092"));
        assert_eq!(config.get(relaykit_core::EVENTS_CHANNEL_SIZE), None);
    }

    #[test]
    fn owned_message_is_copied() {
        let owned = OwnedMessage::new(
            Some(b"value".to_vec()),
            Some(b"key".to_vec()),
            "orders".to_string(),
            Timestamp::NotAvailable,
            3,
            17,
            None,
        );

        let msg = to_message(&owned);

        assert_eq!(msg.topic, "orders");
        assert_eq!(msg.partition, Some(3));
        assert_eq!(msg.offset, Some(17));
        assert_eq!(msg.key.as_deref(), Some(&b"key"[..]));
        assert_eq!(msg.value, b"value".to_vec());
        assert!(msg.error.is_none());
    }
}
