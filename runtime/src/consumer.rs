//! The consumer loop: subscribe, read, transform, dispatch, commit.
//!
//! ```text
//!  Created ──run()──► Subscribed ──► Running ──(read error | stop policy)──► Closed
//!     │                   │                                                     ▲
//!     └──── close() ──────┴─────────── close() / run future dropped ────────────┘
//! ```
//!
//! One message is processed at a time, in the order the client returns
//! them. A message is only committed explicitly when auto-commit is
//! disabled and its handler succeeded.

use crate::metrics::{
    CONSUMER_COMMIT_FAILURES_TOTAL, CONSUMER_HANDLER_FAILURES_TOTAL, CONSUMER_MESSAGES_TOTAL,
};
use metrics::counter;
use relaykit_core::{
    ClientError, Config, ConfigError, ConsumerApi, ConsumerClient, Context, FailurePolicy,
    Message,
};
use relaykit_redpanda::RdKafkaConsumerApi;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

/// Lifecycle of a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    /// Constructed, not yet run
    Created = 0,
    /// `run` has claimed the consumer and is subscribing
    Subscribed = 1,
    /// Reading and dispatching messages
    Running = 2,
    /// Client released; terminal
    Closed = 3,
}

impl ConsumerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Subscribed,
            2 => Self::Running,
            _ => Self::Closed,
        }
    }
}

/// Errors returned by [`Consumer`] construction and [`Consumer::run`].
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The configuration is unusable
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// The client capability set could not create a client
    #[error("Failed to create consumer client: {0}")]
    ClientCreation(#[source] ClientError),

    /// Subscribing to the handler topics failed
    #[error("Failed to subscribe: {0}")]
    Subscribe(#[source] ClientError),

    /// Reading the next message failed; the loop stopped
    #[error("Failed to read message: {0}")]
    Read(#[source] ClientError),

    /// Middleware rejected a message (only under [`FailurePolicy::StopConsuming`])
    #[error("Middleware failed for topic '{topic}': {source}")]
    Middleware {
        /// Topic of the rejected message
        topic: String,
        /// The middleware error
        source: anyhow::Error,
    },

    /// A topic handler failed (only under [`FailurePolicy::StopConsuming`])
    #[error("Handler failed for topic '{topic}': {source}")]
    Handler {
        /// Topic of the failed message
        topic: String,
        /// The handler error
        source: anyhow::Error,
    },

    /// `run` was called on a consumer that is no longer `Created`
    #[error("Consumer cannot run from state {0:?}")]
    AlreadyRun(ConsumerState),
}

/// Reads messages from the subscribed topics and dispatches them to the
/// configured topic handlers.
///
/// # Example
///
/// ```rust,no_run
/// use relaykit_core::Config;
/// use relaykit_runtime::Consumer;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let cfg = Config::new()
///     .with_bootstrap_servers("localhost:9092")
///     .with_group_id("billing")
///     .with_topic_handler("invoices", |_ctx, payload| async move {
///         println!("{} bytes", payload.len());
///         Ok(())
///     });
///
/// let consumer = Consumer::new(&cfg)?;
/// consumer.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Consumer {
    config: Config,
    client: Box<dyn ConsumerClient>,
    auto_commit: bool,
    state: AtomicU8,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("topics", &self.config.topic_ids())
            .field("auto_commit", &self.auto_commit)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Consumer {
    /// Build a consumer from a config snapshot.
    ///
    /// Uses the config's consumer client override when present, the rdkafka
    /// client otherwise.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::Configuration`] if the config carries an invalid
    ///   setting or a producer override
    /// - [`ConsumerError::ClientCreation`] if the client cannot be created
    pub fn new(config: &Config) -> Result<Self, ConsumerError> {
        let api: Arc<dyn ConsumerApi> = match config.consumer_override()? {
            Some(api) => api,
            None => Arc::new(RdKafkaConsumerApi),
        };
        Self::with_client(config, api.as_ref())
    }

    /// Build a consumer with an explicit client capability set, ignoring any
    /// override carried by the config.
    ///
    /// # Errors
    ///
    /// Same as [`Consumer::new`], minus the role check.
    pub fn with_client(config: &Config, api: &dyn ConsumerApi) -> Result<Self, ConsumerError> {
        config.validate()?;

        let client = api.create(config.settings()).map_err(|e| {
            tracing::error!(error = %e, "Failed to create consumer client");
            ConsumerError::ClientCreation(e)
        })?;

        let auto_commit = config.auto_commit_enabled();
        tracing::info!(
            topics = ?config.topic_ids(),
            auto_commit,
            "Consumer created"
        );

        Ok(Self {
            config: config.clone(),
            client,
            auto_commit,
            state: AtomicU8::new(ConsumerState::Created as u8),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Release the client. Idempotent: only the first call reaches it.
    pub fn close(&self) {
        let previous = self.state.swap(ConsumerState::Closed as u8, Ordering::SeqCst);
        if ConsumerState::from_u8(previous) != ConsumerState::Closed {
            self.client.close();
            tracing::info!("Consumer closed");
        }
    }

    /// Subscribe to every handler topic and process messages until a read
    /// fails (or, under [`FailurePolicy::StopConsuming`], a message fails).
    ///
    /// The consumer is closed when this returns and when the returned
    /// future is dropped before completing.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::AlreadyRun`] if the consumer is not `Created`
    /// - [`ConsumerError::Subscribe`] if subscribing fails
    /// - [`ConsumerError::Read`] when a read fails
    /// - [`ConsumerError::Middleware`] / [`ConsumerError::Handler`] under
    ///   [`FailurePolicy::StopConsuming`]
    pub async fn run(&self) -> Result<(), ConsumerError> {
        self.state
            .compare_exchange(
                ConsumerState::Created as u8,
                ConsumerState::Subscribed as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|current| ConsumerError::AlreadyRun(ConsumerState::from_u8(current)))?;
        let _close = CloseOnExit(self);

        let ctx = self.config.context().cloned().unwrap_or_else(|| {
            tracing::warn!("No context configured, using a default context");
            Context::new()
        });

        let topics = self.config.topic_ids();
        self.client.subscribe(&topics).map_err(|e| {
            tracing::error!(topics = ?topics, error = %e, "Failed to subscribe");
            ConsumerError::Subscribe(e)
        })?;

        // A concurrent close() wins; the next read then fails on a closed client.
        let _ = self.state.compare_exchange(
            ConsumerState::Subscribed as u8,
            ConsumerState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        tracing::info!(topics = ?topics, "Consumer running");

        loop {
            let message = match self.client.read_message(None).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read message, consumer stopping");
                    return Err(ConsumerError::Read(e));
                },
            };

            self.dispatch(&ctx, message).await?;
        }
    }

    async fn dispatch(&self, ctx: &Context, message: Message) -> Result<(), ConsumerError> {
        let topic = message.topic.clone();
        counter!(CONSUMER_MESSAGES_TOTAL, "topic" => topic.clone()).increment(1);
        tracing::trace!(
            topic = %topic,
            partition = ?message.partition,
            offset = ?message.offset,
            "Message received"
        );

        let position = message.position();
        let payload = match self.config.middleware() {
            Some(middleware) => match middleware(message.value) {
                Ok(payload) => payload,
                Err(source) => {
                    return self.on_failure(ConsumerError::Middleware { topic, source });
                },
            },
            None => message.value,
        };

        let Some(handler) = self.config.handler(&topic) else {
            tracing::warn!(topic = %topic, "No handler registered for topic, message dropped");
            return Ok(());
        };

        if let Err(source) = handler(ctx.clone(), payload).await {
            return self.on_failure(ConsumerError::Handler { topic, source });
        }
        tracing::debug!(topic = %topic, "Message handled");

        if !self.auto_commit {
            match position {
                Some(position) => {
                    if let Err(e) = self.client.commit_offsets(std::slice::from_ref(&position)) {
                        counter!(CONSUMER_COMMIT_FAILURES_TOTAL).increment(1);
                        tracing::warn!(position = %position, error = %e, "Failed to commit offset");
                    }
                },
                None => {
                    counter!(CONSUMER_COMMIT_FAILURES_TOTAL).increment(1);
                    tracing::warn!(topic = %topic, "Message has no position, nothing to commit");
                },
            }
        }

        Ok(())
    }

    fn on_failure(&self, error: ConsumerError) -> Result<(), ConsumerError> {
        let topic = match &error {
            ConsumerError::Middleware { topic, .. } | ConsumerError::Handler { topic, .. } => {
                topic.clone()
            },
            _ => String::new(),
        };
        counter!(CONSUMER_HANDLER_FAILURES_TOTAL, "topic" => topic).increment(1);

        match self.config.failure_policy() {
            FailurePolicy::SkipMessage => {
                tracing::error!(error = %error, "Message processing failed, message dropped");
                Ok(())
            },
            FailurePolicy::StopConsuming => {
                tracing::error!(error = %error, "Message processing failed, consumer stopping");
                Err(error)
            },
        }
    }
}

struct CloseOnExit<'a>(&'a Consumer);

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use relaykit_testing::MockConsumer;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ConsumerState::Created,
            ConsumerState::Subscribed,
            ConsumerState::Running,
            ConsumerState::Closed,
        ] {
            assert_eq!(ConsumerState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn close_before_run_is_terminal() {
        let mock = MockConsumer::new();
        let consumer = Consumer::with_client(&Config::new(), &mock).unwrap();

        consumer.close();
        consumer.close();

        assert_eq!(consumer.state(), ConsumerState::Closed);
        assert_eq!(mock.close_count(), 1);
    }

    #[tokio::test]
    async fn run_after_close_is_rejected() {
        let mock = MockConsumer::new();
        let consumer = Consumer::with_client(&Config::new(), &mock).unwrap();
        consumer.close();

        let err = consumer.run().await.unwrap_err();

        assert!(matches!(err, ConsumerError::AlreadyRun(ConsumerState::Closed)));
        assert!(mock.subscriptions().is_empty());
    }

    #[test]
    fn creation_failure_is_reported() {
        let mock = MockConsumer::new().failing_create(ClientError::Creation("boom".to_string()));

        let err = Consumer::with_client(&Config::new(), &mock).unwrap_err();

        assert!(matches!(err, ConsumerError::ClientCreation(ClientError::Creation(_))));
    }
}
