//! # Relaykit Testing
//!
//! Test doubles for the relaykit client capability sets.
//!
//! This crate provides:
//! - [`MockConsumer`]: scripted reads, recorded subscriptions, commits and closes
//! - [`MockProducer`]: hookable produce and flush, an injectable delivery
//!   event stream, recorded sends and closes
//!
//! Hand either one to a [`Config`](relaykit_core::Config) with
//! `with_consumer_client` / `with_producer_client`, or pass it straight to
//! `Consumer::with_client` / `Producer::with_client`.
//!
//! ## Example
//!
//! ```ignore
//! use relaykit_core::{Config, Message};
//! use relaykit_runtime::Consumer;
//! use relaykit_testing::MockConsumer;
//! use std::sync::Arc;
//!
//! #[tokio::test]
//! async fn dispatches_orders() {
//!     let mock = MockConsumer::new().with_messages([Message::new("orders", "placed")]);
//!     let cfg = Config::new()
//!         .with_consumer_client(Arc::new(mock.clone()))
//!         .with_topic_handler("orders", |_ctx, _payload| async { Ok(()) });
//!
//!     let consumer = Consumer::new(&cfg).unwrap();
//!     let _ = consumer.run().await;
//!     assert_eq!(mock.close_count(), 1);
//! }
//! ```

pub mod consumer_mocks;
pub mod producer_mocks;

pub use consumer_mocks::{MockConsumer, MockConsumerClient, ReadStep};
pub use producer_mocks::{FlushHook, MockProducer, MockProducerClient, ProduceHook};

/// Install a `tracing` subscriber that writes to the test harness output.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
