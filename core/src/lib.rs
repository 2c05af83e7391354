//! # Relaykit Core
//!
//! Configuration, message types and client capability traits for relaykit,
//! a dispatch/retry layer in front of a Kafka-compatible broker client.
//!
//! This crate owns no I/O. It defines:
//!
//! - [`Config`]: an immutable, fluent configuration snapshot
//! - [`Message`], [`TopicPartitionOffset`], [`DeliveryEvent`]: the data
//!   flowing through consumers and producers
//! - [`ConsumerApi`] / [`ProducerApi`]: the capability sets that isolate
//!   relaykit from the concrete broker client
//! - [`Context`]: the execution context handed to topic handlers
//!
//! The consumer loop and producer delivery engine live in
//! `relaykit-runtime`; the rdkafka-backed capability sets live in
//! `relaykit-redpanda`; test doubles live in `relaykit-testing`.
//!
//! ## Example
//!
//! ```
//! use relaykit_core::{Config, FailurePolicy};
//!
//! let cfg = Config::new()
//!     .with_bootstrap_servers("localhost:9092")
//!     .with_group_id("order-projector")
//!     .with_auto_commit(false)
//!     .with_failure_policy(FailurePolicy::SkipMessage)
//!     .with_topic_handler("order-events", |_ctx, payload| async move {
//!         tracing::info!(bytes = payload.len(), "order event");
//!         Ok(())
//!     });
//!
//! assert!(cfg.validate().is_ok());
//! assert!(!cfg.auto_commit_enabled());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod context;
pub mod message;

pub use client::{
    ClientError, ClientFuture, ClientRole, ConsumerApi, ConsumerClient, DeliveryEvents,
    DeliverySender, ProducerApi, ProducerClient,
};
pub use config::{
    ClientOverride, Config, ConfigError, ConfigKey, FailurePolicy, HandlerFuture, MessageHandler,
    Middleware, SettingValue, Settings, DEFAULT_EVENTS_CHANNEL_SIZE, DEFAULT_RETRY_BACKOFF,
    EVENTS_CHANNEL_SIZE, LOCAL_SETTING_PREFIX, MAX_PRODUCER_RETRIES,
};
pub use context::Context;
pub use message::{DeliveryEvent, Message, TopicPartitionOffset, UnexpectedEvent};
