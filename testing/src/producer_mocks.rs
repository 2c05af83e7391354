//! In-memory producer client for testing the delivery engine.
//!
//! By default every produce succeeds; a message sent with a dedicated
//! delivery channel is acknowledged on it immediately (partition 0, offsets
//! counting up from 0). The shared event stream only carries what the test
//! [`emit`](MockProducer::emit)s. Closing the client ends the shared stream.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use relaykit_core::{
    ClientError, DeliveryEvent, DeliveryEvents, DeliverySender, Message, ProducerApi,
    ProducerClient, Settings, DEFAULT_EVENTS_CHANNEL_SIZE,
};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Replacement for the default produce behaviour.
pub type ProduceHook =
    Arc<dyn Fn(Message, Option<DeliverySender>) -> Result<(), ClientError> + Send + Sync>;

/// Replacement for the default flush behaviour (which reports nothing in flight).
pub type FlushHook = Arc<dyn Fn(Duration) -> usize + Send + Sync>;

struct Inner {
    produced: Mutex<Vec<Message>>,
    produce_calls: AtomicUsize,
    flush_calls: Mutex<Vec<Duration>>,
    close_calls: AtomicUsize,
    next_offset: AtomicI64,
    created: Mutex<Vec<Settings>>,
    create_error: Mutex<Option<ClientError>>,
    produce_hook: Mutex<Option<ProduceHook>>,
    flush_hook: Mutex<Option<FlushHook>>,
    events_tx: Mutex<Option<mpsc::Sender<DeliveryEvent>>>,
    events_rx: Mutex<Option<DeliveryEvents>>,
}

impl Default for Inner {
    fn default() -> Self {
        let (tx, rx) = mpsc::channel(DEFAULT_EVENTS_CHANNEL_SIZE);
        Self {
            produced: Mutex::default(),
            produce_calls: AtomicUsize::new(0),
            flush_calls: Mutex::default(),
            close_calls: AtomicUsize::new(0),
            next_offset: AtomicI64::new(0),
            created: Mutex::default(),
            create_error: Mutex::default(),
            produce_hook: Mutex::default(),
            flush_hook: Mutex::default(),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
        }
    }
}

/// Producer capability set with hookable produce and flush.
///
/// # Example
///
/// ```
/// use relaykit_core::ClientError;
/// use relaykit_testing::MockProducer;
///
/// // Every send hits a full queue
/// let mock = MockProducer::new().on_produce(|_msg, _delivery| Err(ClientError::QueueFull));
/// assert_eq!(mock.produce_count(), 0);
/// ```
#[derive(Clone, Default)]
pub struct MockProducer {
    inner: Arc<Inner>,
}

impl MockProducer {
    /// Create a mock with default behaviour.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the produce behaviour. The hook sees every produce call,
    /// including the dedicated delivery channel if one was supplied.
    #[must_use]
    pub fn on_produce<F>(self, hook: F) -> Self
    where
        F: Fn(Message, Option<DeliverySender>) -> Result<(), ClientError> + Send + Sync + 'static,
    {
        *self.inner.produce_hook.lock().unwrap() = Some(Arc::new(hook));
        self
    }

    /// Replace the flush behaviour.
    #[must_use]
    pub fn on_flush<F>(self, hook: F) -> Self
    where
        F: Fn(Duration) -> usize + Send + Sync + 'static,
    {
        *self.inner.flush_hook.lock().unwrap() = Some(Arc::new(hook));
        self
    }

    /// Make `create` fail.
    #[must_use]
    pub fn failing_create(self, error: ClientError) -> Self {
        *self.inner.create_error.lock().unwrap() = Some(error);
        self
    }

    /// Push an event onto the shared event stream.
    ///
    /// Returns `false` if the stream has ended (client closed, or the
    /// receiver was dropped) or is full.
    pub fn emit(&self, event: DeliveryEvent) -> bool {
        self.inner
            .events_tx
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| tx.try_send(event).is_ok())
    }

    /// Messages handed to `produce` (successful or not), in order.
    #[must_use]
    pub fn produced(&self) -> Vec<Message> {
        self.inner.produced.lock().unwrap().clone()
    }

    /// How many times `produce` was called.
    #[must_use]
    pub fn produce_count(&self) -> usize {
        self.inner.produce_calls.load(Ordering::SeqCst)
    }

    /// Timeouts passed to each `flush` call.
    #[must_use]
    pub fn flushes(&self) -> Vec<Duration> {
        self.inner.flush_calls.lock().unwrap().clone()
    }

    /// How many times `close` was called.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.inner.close_calls.load(Ordering::SeqCst)
    }

    /// Settings passed to each `create` call.
    #[must_use]
    pub fn created(&self) -> Vec<Settings> {
        self.inner.created.lock().unwrap().clone()
    }
}

impl ProducerApi for MockProducer {
    fn create(&self, settings: &Settings) -> Result<Box<dyn ProducerClient>, ClientError> {
        self.inner.created.lock().unwrap().push(settings.clone());
        if let Some(err) = self.inner.create_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(Box::new(MockProducerClient {
            inner: Arc::clone(&self.inner),
        }))
    }
}

/// Client handle produced by [`MockProducer`].
pub struct MockProducerClient {
    inner: Arc<Inner>,
}

impl ProducerClient for MockProducerClient {
    fn close(&self) {
        self.inner.close_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.events_tx.lock().unwrap().take();
    }

    fn produce(&self, message: Message, delivery: Option<DeliverySender>) -> Result<(), ClientError> {
        self.inner.produce_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.produced.lock().unwrap().push(message.clone());

        let hook = self.inner.produce_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            return hook(message, delivery);
        }

        if let Some(delivery) = delivery {
            let offset = self.inner.next_offset.fetch_add(1, Ordering::SeqCst);
            let delivered = Message {
                partition: Some(0),
                offset: Some(offset),
                ..message
            };
            // The waiting side may already have given up
            let _ = delivery.send(DeliveryEvent::Delivered(delivered));
        }
        Ok(())
    }

    fn flush(&self, timeout: Duration) -> usize {
        self.inner.flush_calls.lock().unwrap().push(timeout);
        let hook = self.inner.flush_hook.lock().unwrap().clone();
        hook.map_or(0, |hook| hook(timeout))
    }

    fn events(&self) -> Option<DeliveryEvents> {
        self.inner.events_rx.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn dedicated_channel_is_acknowledged() {
        let mock = MockProducer::new();
        let client = mock.create(&Settings::default()).unwrap();
        let (tx, rx) = oneshot::channel();

        client.produce(Message::new("t", "v"), Some(tx)).unwrap();

        let event = rx.await.unwrap();
        assert!(matches!(
            event,
            DeliveryEvent::Delivered(ref msg) if msg.partition == Some(0) && msg.offset == Some(0)
        ));
    }

    #[tokio::test]
    async fn close_ends_the_shared_stream() {
        let mock = MockProducer::new();
        let client = mock.create(&Settings::default()).unwrap();
        let mut events = client.events().unwrap();
        assert!(client.events().is_none());

        assert!(mock.emit(DeliveryEvent::ClientError(ClientError::Instance("x".to_string()))));
        client.close();
        assert!(!mock.emit(DeliveryEvent::ClientError(ClientError::Instance("y".to_string()))));

        assert!(events.recv().await.is_some());
        assert!(events.recv().await.is_none());
        assert_eq!(mock.close_count(), 1);
    }

    #[test]
    fn flush_hook_is_used() {
        let mock = MockProducer::new().on_flush(|_| 3);
        let client = mock.create(&Settings::default()).unwrap();
        assert_eq!(client.flush(Duration::from_millis(100)), 3);
        assert_eq!(mock.flushes(), vec![Duration::from_millis(100)]);
    }
}
