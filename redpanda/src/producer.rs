//! rdkafka-backed producer capability set.
//!
//! Delivery reports are routed by a custom [`ProducerContext`]: each record
//! carries a [`DeliveryRoute`] as its delivery opaque, naming either a
//! dedicated single-use channel or the shared event stream.
//!
//! ```text
//!   produce(msg, Some(tx)) ──► BaseRecord { opaque: Dedicated(tx) } ──► tx
//!   produce(msg, None)     ──► BaseRecord { opaque: Shared }        ──► events
//!   ClientContext::error   ─────────────────────────────────────────► events
//!   ClientContext::stats   ─────────────────────────────────────────► events
//! ```
//!
//! The shared stream is bounded by `relaykit.events.channel.size`. When it is
//! full the event is dropped, logged and counted in
//! [`EVENTS_DROPPED_TOTAL`].

use crate::{client_config, to_message};
use rdkafka::client::ClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::util::Timeout;
use relaykit_core::{
    ClientError, DeliveryEvent, DeliveryEvents, DeliverySender, Message, ProducerApi,
    ProducerClient, Settings, UnexpectedEvent,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Shared-stream events dropped because the stream was full.
pub const EVENTS_DROPPED_TOTAL: &str = "relaykit_producer_events_dropped_total";

/// Where the delivery report for one record goes.
pub enum DeliveryRoute {
    /// The producer's shared event stream
    Shared,
    /// A dedicated single-use channel
    Dedicated(DeliverySender),
}

/// Client context that turns librdkafka callbacks into [`DeliveryEvent`]s.
pub struct RelayContext {
    events: mpsc::Sender<DeliveryEvent>,
}

impl RelayContext {
    fn publish(&self, event: DeliveryEvent) {
        match self.events.try_send(event) {
            Ok(()) => {},
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    capacity = self.events.max_capacity(),
                    "Delivery event stream full, event dropped"
                );
                metrics::counter!(EVENTS_DROPPED_TOTAL).increment(1);
            },
            Err(TrySendError::Closed(_)) => {
                tracing::trace!("Delivery event stream dropped, event discarded");
            },
        }
    }
}

impl ClientContext for RelayContext {
    fn error(&self, error: KafkaError, reason: &str) {
        tracing::warn!(error = %error, reason, "rdkafka client error");
        self.publish(DeliveryEvent::ClientError(ClientError::Instance(format!(
            "{error}: {reason}"
        ))));
    }

    fn stats_raw(&self, statistics: &[u8]) {
        self.publish(DeliveryEvent::Unexpected(UnexpectedEvent::new(
            "statistics",
            String::from_utf8_lossy(statistics),
        )));
    }
}

impl ProducerContext for RelayContext {
    type DeliveryOpaque = Box<DeliveryRoute>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, route: Self::DeliveryOpaque) {
        let message = match delivery_result {
            Ok(delivered) => to_message(delivered),
            Err((err, failed)) => to_message(failed).with_error(ClientError::Delivery(err.to_string())),
        };
        let event = DeliveryEvent::Delivered(message);

        match *route {
            DeliveryRoute::Dedicated(tx) => {
                if tx.send(event).is_err() {
                    tracing::debug!("Delivery waiter gone, report discarded");
                }
            },
            DeliveryRoute::Shared => self.publish(event),
        }
    }
}

/// Default producer capability set: creates rdkafka [`ThreadedProducer`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct RdKafkaProducerApi;

impl ProducerApi for RdKafkaProducerApi {
    fn create(&self, settings: &Settings) -> Result<Box<dyn ProducerClient>, ClientError> {
        let capacity = settings.events_channel_size();
        let (tx, rx) = mpsc::channel(capacity);
        let producer: ThreadedProducer<RelayContext> = client_config(settings)
            .create_with_context(RelayContext { events: tx })
            .map_err(|e| ClientError::Creation(format!("Failed to create producer: {e}")))?;

        tracing::info!(
            settings = settings.len(),
            events_capacity = capacity,
            "rdkafka producer created"
        );

        Ok(Box::new(RdKafkaProducerClient {
            producer: Mutex::new(Some(Arc::new(producer))),
            events: Mutex::new(Some(rx)),
        }))
    }
}

/// A live rdkafka producer.
pub struct RdKafkaProducerClient {
    producer: Mutex<Option<Arc<ThreadedProducer<RelayContext>>>>,
    events: Mutex<Option<DeliveryEvents>>,
}

impl RdKafkaProducerClient {
    fn handle(&self) -> Option<Arc<ThreadedProducer<RelayContext>>> {
        self.producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ProducerClient for RdKafkaProducerClient {
    fn close(&self) {
        let producer = self
            .producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if producer.is_some() {
            // Dropping the last reference drops the context and its sender,
            // which ends the shared event stream.
            drop(producer);
            tracing::debug!("rdkafka producer closed");
        }
    }

    fn produce(&self, message: Message, delivery: Option<DeliverySender>) -> Result<(), ClientError> {
        let producer = self.handle().ok_or_else(|| ClientError::Produce {
            topic: message.topic.clone(),
            reason: "producer is closed".to_string(),
        })?;

        let route = Box::new(delivery.map_or(DeliveryRoute::Shared, DeliveryRoute::Dedicated));
        let mut record: BaseRecord<'_, Vec<u8>, Vec<u8>, Box<DeliveryRoute>> =
            BaseRecord::with_opaque_to(&message.topic, route).payload(&message.value);
        if let Some(key) = &message.key {
            record = record.key(key);
        }
        if let Some(partition) = message.partition {
            record = record.partition(partition);
        }

        producer
            .send(record)
            .map_err(|(err, _record)| send_error(&message.topic, &err))
    }

    fn flush(&self, timeout: Duration) -> usize {
        let Some(producer) = self.handle() else {
            return 0;
        };
        if let Err(e) = producer.flush(Timeout::After(timeout)) {
            tracing::debug!(error = %e, "Flush returned before all messages were delivered");
        }
        usize::try_from(producer.in_flight_count()).unwrap_or(0)
    }

    fn events(&self) -> Option<DeliveryEvents> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

fn send_error(topic: &str, err: &KafkaError) -> ClientError {
    match err {
        KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull) => ClientError::QueueFull,
        other => ClientError::Produce {
            topic: topic.to_string(),
            reason: other.to_string(),
        },
    }
}
