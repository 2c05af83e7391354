//! # Relaykit Runtime
//!
//! The consumer loop and the producer delivery engine.
//!
//! ## Core Components
//!
//! - **Consumer**: subscribes to every handler topic, runs each message
//!   through the middleware and its topic handler, commits on success
//! - **Producer**: fire-and-forget, retrying and synchronous sends, flushing,
//!   and dispatch of the shared delivery event stream
//! - **Retry**: bounded exponential backoff on a full local queue
//!
//! Both engines take their client from the config's override when one is
//! set and fall back to the rdkafka clients from `relaykit-redpanda`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use relaykit_core::{Config, Message};
//! use relaykit_runtime::{Consumer, Producer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let base = Config::new().with_bootstrap_servers(["kafka-1:9092", "kafka-2:9092"]);
//!
//! let producer = Producer::new(&base.clone().with_synchronous_delivery(true))?;
//! producer.send(Message::new("audit", "login")).await?;
//! producer.close();
//!
//! let consumer = Consumer::new(
//!     &base
//!         .with_group_id("auditor")
//!         .with_auto_commit(false)
//!         .with_topic_handler("audit", |_ctx, _payload| async { Ok(()) }),
//! )?;
//! consumer.run().await?;
//! # Ok(())
//! # }
//! ```

/// Consumer loop
pub mod consumer;

/// Producer delivery engine
pub mod producer;

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

pub use consumer::{Consumer, ConsumerError, ConsumerState};
pub use producer::{
    FLUSH_ALL_INTERVAL, Producer, ProducerError, ProducerEventHandler, check_event, must_produce,
};
pub use retry::{RetryError, RetryPolicy};
