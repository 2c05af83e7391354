//! The producer delivery engine.
//!
//! Three ways to send a message, from cheapest to strongest guarantee:
//!
//! | Method | Waits for | On a full queue |
//! |---|---|---|
//! | [`Producer::produce`] | nothing | fails |
//! | [`Producer::produce_with_retry`] | the client accepting the message | backs off and retries |
//! | [`Producer::must_produce`] | the broker's delivery report | fails |
//!
//! Delivery reports for messages sent without a dedicated channel arrive
//! on the shared event stream, which [`Producer::handle_events`] drains
//! into a [`ProducerEventHandler`].

use crate::metrics::{PRODUCER_DELIVERY_EVENTS_TOTAL, PRODUCER_RETRIES_TOTAL, PRODUCER_TIMEOUTS_TOTAL};
use crate::retry::{RetryError, RetryPolicy, retry_with_predicate};
use metrics::counter;
use relaykit_core::{
    ClientError, Config, ConfigError, DeliveryEvent, DeliveryEvents, Message, ProducerApi,
    ProducerClient, UnexpectedEvent,
};
use relaykit_redpanda::RdKafkaProducerApi;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Flush interval used by [`Producer::flush_all`].
pub const FLUSH_ALL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors returned by the producer.
#[derive(Error, Debug)]
pub enum ProducerError {
    /// The configuration is unusable
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// The client capability set could not create a client
    #[error("Failed to create producer client: {0}")]
    ClientCreation(#[source] ClientError),

    /// The message has no topic
    #[error("Message has no topic id")]
    MissingTopicId,

    /// Middleware rejected the message
    #[error("Middleware failed for topic '{topic}': {source}")]
    Middleware {
        /// Topic of the rejected message
        topic: String,
        /// The middleware error
        source: anyhow::Error,
    },

    /// The client refused the message
    #[error("Failed to produce message: {0}")]
    Send(#[source] ClientError),

    /// The broker reported a failed delivery
    #[error("Delivery failed for topic '{}': {source}", .message.topic)]
    Delivery {
        /// The message as reported back by the client
        message: Box<Message>,
        /// The delivery error
        source: ClientError,
    },

    /// The client reported an instance-level error instead of a delivery
    #[error("Producer client error: {0}")]
    Client(#[source] ClientError),

    /// The client emitted an event that is not a delivery report
    #[error("Unexpected delivery event: {0}")]
    UnexpectedDeliveryEvent(UnexpectedEvent),

    /// The local queue stayed full through every retry
    #[error("Timed out after {attempts} attempts: local send queue stayed full")]
    TimedOut {
        /// Total number of attempts made
        attempts: usize,
    },

    /// The delivery channel closed before a report arrived
    #[error("Delivery channel closed before a delivery report arrived")]
    DeliveryChannelClosed,

    /// The shared event stream has already been taken
    #[error("Producer event stream is not available")]
    EventStreamUnavailable,
}

impl ProducerError {
    /// The failed message, for delivery failures.
    #[must_use]
    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Delivery { message, .. } => Some(message.as_ref()),
            _ => None,
        }
    }
}

/// Turn a delivery event into a delivered message or an error.
///
/// # Errors
///
/// - [`ProducerError::Delivery`] for a delivery report carrying an error
/// - [`ProducerError::Client`] for a client-level error event
/// - [`ProducerError::UnexpectedDeliveryEvent`] for anything else
pub fn check_event(event: DeliveryEvent) -> Result<Message, ProducerError> {
    match event {
        DeliveryEvent::Delivered(message) => match message.error.clone() {
            Some(source) => Err(ProducerError::Delivery {
                message: Box::new(message),
                source,
            }),
            None => Ok(message),
        },
        DeliveryEvent::ClientError(err) => Err(ProducerError::Client(err)),
        DeliveryEvent::Unexpected(event) => Err(ProducerError::UnexpectedDeliveryEvent(event)),
    }
}

/// Callbacks for events on the producer's shared event stream.
///
/// Returning [`ControlFlow::Break`] from the error callbacks closes the
/// producer and ends the dispatcher.
pub trait ProducerEventHandler: Send + 'static {
    /// A message was delivered.
    fn on_message_delivered(&mut self, message: &Message);

    /// The broker reported a failed delivery for `message`.
    fn on_message_error(&mut self, message: &Message, error: &ClientError);

    /// The client reported an instance-level error.
    fn on_producer_error(&mut self, error: &ClientError) -> ControlFlow<()>;

    /// The client emitted something other than a delivery report or error.
    fn on_unexpected_event(&mut self, event: &UnexpectedEvent) -> ControlFlow<()>;
}

struct ProducerHandle {
    client: Box<dyn ProducerClient>,
    closed: AtomicBool,
}

impl ProducerHandle {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.client.close();
            tracing::info!("Producer closed");
        }
    }
}

/// Sends messages to topics.
///
/// # Example
///
/// ```rust,no_run
/// use relaykit_core::{Config, Message};
/// use relaykit_runtime::Producer;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let cfg = Config::new()
///     .with_bootstrap_servers("localhost:9092")
///     .with_max_producer_retries(3);
///
/// let producer = Producer::new(&cfg)?;
/// producer.produce_with_retry(Message::new("invoices", "paid")).await?;
/// producer.flush_all();
/// producer.close();
/// # Ok(())
/// # }
/// ```
pub struct Producer {
    handle: Arc<ProducerHandle>,
    events: Mutex<Option<DeliveryEvents>>,
    config: Config,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("retry", &self.retry)
            .field("synchronous_delivery", &self.config.synchronous_delivery())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Producer {
    /// Build a producer from a config snapshot.
    ///
    /// Uses the config's producer client override when present, the rdkafka
    /// client otherwise.
    ///
    /// # Errors
    ///
    /// - [`ProducerError::Configuration`] if the config carries an invalid
    ///   setting or a consumer override
    /// - [`ProducerError::ClientCreation`] if the client cannot be created
    pub fn new(config: &Config) -> Result<Self, ProducerError> {
        let api: Arc<dyn ProducerApi> = match config.producer_override()? {
            Some(api) => api,
            None => Arc::new(RdKafkaProducerApi),
        };
        Self::with_client(config, api.as_ref())
    }

    /// Build a producer with an explicit client capability set, ignoring any
    /// override carried by the config.
    ///
    /// # Errors
    ///
    /// Same as [`Producer::new`], minus the role check.
    pub fn with_client(config: &Config, api: &dyn ProducerApi) -> Result<Self, ProducerError> {
        config.validate()?;

        let client = api.create(config.settings()).map_err(|e| {
            tracing::error!(error = %e, "Failed to create producer client");
            ProducerError::ClientCreation(e)
        })?;
        let events = client.events();
        let retry = RetryPolicy::for_producer(config);

        tracing::info!(
            max_retries = retry.max_retries,
            synchronous_delivery = config.synchronous_delivery(),
            "Producer created"
        );

        Ok(Self {
            handle: Arc::new(ProducerHandle {
                client,
                closed: AtomicBool::new(false),
            }),
            events: Mutex::new(events),
            config: config.clone(),
            retry,
        })
    }

    /// Whether [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.handle.closed.load(Ordering::SeqCst)
    }

    fn prepare(&self, mut message: Message) -> Result<Message, ProducerError> {
        if !message.has_topic() {
            return Err(ProducerError::MissingTopicId);
        }

        let Some(middleware) = self.config.middleware() else {
            return Ok(message);
        };
        let value = std::mem::take(&mut message.value);
        match middleware(value) {
            Ok(value) => Ok(Message { value, ..message }),
            Err(source) => Err(ProducerError::Middleware {
                topic: message.topic,
                source,
            }),
        }
    }

    /// Hand a message to the client without waiting for anything.
    ///
    /// The delivery report arrives on the shared event stream.
    ///
    /// # Errors
    ///
    /// - [`ProducerError::MissingTopicId`] / [`ProducerError::Middleware`]
    ///   before the client is called
    /// - [`ProducerError::Send`] if the client refuses the message
    pub fn produce(&self, message: Message) -> Result<(), ProducerError> {
        let message = self.prepare(message)?;
        self.handle
            .client
            .produce(message, None)
            .map_err(ProducerError::Send)
    }

    /// Hand a message to the client, backing off while its local queue is
    /// full.
    ///
    /// With `r` configured retries the client is asked at most `r + 1`
    /// times; waits start at the configured backoff and double each time.
    ///
    /// # Errors
    ///
    /// - [`ProducerError::TimedOut`] if the queue stayed full throughout
    /// - [`ProducerError::Send`] at once for any other client error
    /// - [`ProducerError::MissingTopicId`] / [`ProducerError::Middleware`]
    ///   before the client is called
    pub async fn produce_with_retry(&self, message: Message) -> Result<(), ProducerError> {
        let message = self.prepare(message)?;
        let client = &self.handle.client;
        let mut retrying = false;

        let result = retry_with_predicate(
            &self.retry,
            || {
                if retrying {
                    counter!(PRODUCER_RETRIES_TOTAL).increment(1);
                }
                retrying = true;
                std::future::ready(client.produce(message.clone(), None))
            },
            ClientError::is_queue_full,
        )
        .await;

        result.map_err(|e| match e {
            RetryError::Rejected(err) => ProducerError::Send(err),
            RetryError::Exhausted { attempts, .. } => {
                counter!(PRODUCER_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!(topic = %message.topic, attempts, "Producer timed out, queue full");
                ProducerError::TimedOut { attempts }
            },
        })
    }

    /// Send a message and wait for its delivery report.
    ///
    /// # Errors
    ///
    /// - [`ProducerError::MissingTopicId`] / [`ProducerError::Middleware`]
    ///   before the client is called
    /// - [`ProducerError::Send`] if the client refuses the message
    /// - [`ProducerError::DeliveryChannelClosed`] if the client drops the
    ///   channel without reporting
    /// - any error from [`check_event`]
    pub async fn must_produce(&self, message: Message) -> Result<Message, ProducerError> {
        let message = self.prepare(message)?;
        let (tx, rx) = oneshot::channel();

        self.handle
            .client
            .produce(message, Some(tx))
            .map_err(ProducerError::Send)?;

        let event = rx.await.map_err(|_| ProducerError::DeliveryChannelClosed)?;
        check_event(event)
    }

    /// Send a message the way the config asks for: wait for the delivery
    /// report with synchronous delivery on, retry on a full queue otherwise.
    ///
    /// Returns the delivered message when synchronous delivery is on.
    ///
    /// # Errors
    ///
    /// See [`must_produce`](Self::must_produce) and
    /// [`produce_with_retry`](Self::produce_with_retry).
    pub async fn send(&self, message: Message) -> Result<Option<Message>, ProducerError> {
        if self.config.synchronous_delivery() {
            self.must_produce(message).await.map(Some)
        } else {
            self.produce_with_retry(message).await.map(|()| None)
        }
    }

    /// Wait up to `timeout` for outstanding messages; returns how many are
    /// still in flight.
    pub fn flush(&self, timeout: Duration) -> usize {
        let remaining = self.handle.client.flush(timeout);
        if remaining > 0 {
            tracing::info!(remaining, "Messages still in flight after flush");
        }
        remaining
    }

    /// Flush until nothing is in flight.
    pub fn flush_all(&self) {
        while self.flush(FLUSH_ALL_INTERVAL) > 0 {}
    }

    /// Take the shared event stream to consume it directly.
    ///
    /// Returns `None` once taken (here or by [`handle_events`](Self::handle_events)).
    pub fn take_events(&self) -> Option<DeliveryEvents> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Spawn a task that dispatches the shared event stream to `handler`.
    ///
    /// The task closes the producer when the handler asks for it or when the
    /// stream ends.
    ///
    /// # Errors
    ///
    /// Returns [`ProducerError::EventStreamUnavailable`] if the stream has
    /// already been taken.
    pub fn handle_events<H: ProducerEventHandler>(
        &self,
        mut handler: H,
    ) -> Result<JoinHandle<()>, ProducerError> {
        let mut events = self.take_events().ok_or(ProducerError::EventStreamUnavailable)?;
        let handle = Arc::clone(&self.handle);

        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if dispatch_event(&mut handler, event).is_break() {
                    tracing::info!("Event handler requested producer close");
                    break;
                }
            }
            handle.close();
        }))
    }

    /// Release the client. Idempotent.
    pub fn close(&self) {
        self.handle.close();
    }
}

fn dispatch_event<H: ProducerEventHandler>(handler: &mut H, event: DeliveryEvent) -> ControlFlow<()> {
    match event {
        DeliveryEvent::Delivered(message) => {
            if let Some(error) = &message.error {
                counter!(PRODUCER_DELIVERY_EVENTS_TOTAL, "outcome" => "failed").increment(1);
                tracing::error!(
                    topic = %message.topic,
                    partition = ?message.partition,
                    error = %error,
                    "Delivery failed"
                );
                handler.on_message_error(&message, error);
            } else {
                counter!(PRODUCER_DELIVERY_EVENTS_TOTAL, "outcome" => "delivered").increment(1);
                tracing::info!(
                    topic = %message.topic,
                    partition = ?message.partition,
                    offset = ?message.offset,
                    "Message delivered"
                );
                handler.on_message_delivered(&message);
            }
            ControlFlow::Continue(())
        },
        DeliveryEvent::ClientError(error) => {
            counter!(PRODUCER_DELIVERY_EVENTS_TOTAL, "outcome" => "client_error").increment(1);
            tracing::warn!(error = %error, "Producer client error");
            handler.on_producer_error(&error)
        },
        DeliveryEvent::Unexpected(event) => {
            counter!(PRODUCER_DELIVERY_EVENTS_TOTAL, "outcome" => "unexpected").increment(1);
            tracing::info!(kind = %event.kind, "Ignored producer event");
            handler.on_unexpected_event(&event)
        },
    }
}

/// Send one message with a temporary producer and wait for its delivery
/// report.
///
/// # Errors
///
/// [`ProducerError::MissingTopicId`] before any client is created, any
/// construction error, or any error from [`Producer::must_produce`].
pub async fn must_produce(config: &Config, message: Message) -> Result<Message, ProducerError> {
    if !message.has_topic() {
        return Err(ProducerError::MissingTopicId);
    }

    let producer = Producer::new(config)?;
    let result = producer.must_produce(message).await;
    producer.close();
    result
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn delivered(topic: &str) -> Message {
        Message::new(topic, "v").with_partition(1).with_offset(7)
    }

    #[test]
    fn delivered_event_yields_message() {
        let message = check_event(DeliveryEvent::Delivered(delivered("orders"))).unwrap();
        assert_eq!(message.offset, Some(7));
    }

    #[test]
    fn failed_delivery_keeps_the_message() {
        let failed = delivered("orders").with_error(ClientError::Delivery("timed out".to_string()));

        let err = check_event(DeliveryEvent::Delivered(failed)).unwrap_err();

        assert!(matches!(err, ProducerError::Delivery { ref source, .. } if *source == ClientError::Delivery("timed out".to_string())));
        assert_eq!(err.message().map(|m| m.topic.as_str()), Some("orders"));
    }

    #[test]
    fn client_error_event_is_an_error() {
        let err = check_event(DeliveryEvent::ClientError(ClientError::Instance("down".to_string())))
            .unwrap_err();

        assert!(matches!(err, ProducerError::Client(ClientError::Instance(_))));
        assert!(err.message().is_none());
    }

    #[test]
    fn unexpected_event_is_an_error() {
        let err = check_event(DeliveryEvent::Unexpected(UnexpectedEvent::new("statistics", "{}")))
            .unwrap_err();

        assert!(matches!(err, ProducerError::UnexpectedDeliveryEvent(ref ev) if ev.kind == "statistics"));
    }

    #[test]
    fn delivery_error_names_topic() {
        let failed = delivered("orders").with_error(ClientError::Delivery("timed out".to_string()));
        let err = check_event(DeliveryEvent::Delivered(failed)).unwrap_err();

        assert_eq!(
            err.to_string(),
            "Delivery failed for topic 'orders': Delivery failed: timed out"
        );
    }
}
