//! In-memory consumer client for testing the consumer loop.
//!
//! Reads are scripted up front; once the script is exhausted every read
//! fails with `"no more messages"`, which ends the consumer loop the same way
//! a transport failure would.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use relaykit_core::{
    ClientError, ClientFuture, ConsumerApi, ConsumerClient, Message, Settings,
    TopicPartitionOffset,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted result for `read_message`.
#[derive(Debug, Clone)]
pub enum ReadStep {
    /// A message is returned
    Message(Message),
    /// The client wakes up with nothing to return
    Idle,
    /// The read fails
    Error(ClientError),
}

#[derive(Default)]
struct Inner {
    reads: Mutex<VecDeque<ReadStep>>,
    read_calls: AtomicUsize,
    close_calls: AtomicUsize,
    created: Mutex<Vec<Settings>>,
    subscriptions: Mutex<Vec<Vec<String>>>,
    commits: Mutex<Vec<TopicPartitionOffset>>,
    create_error: Mutex<Option<ClientError>>,
    subscribe_error: Mutex<Option<ClientError>>,
    commit_error: Mutex<Option<ClientError>>,
}

/// Consumer capability set backed by a script.
///
/// Clones share state, so a test keeps one clone for assertions and hands
/// another to the config.
///
/// # Example
///
/// ```
/// use relaykit_core::{Config, Message};
/// use relaykit_testing::MockConsumer;
/// use std::sync::Arc;
///
/// let mock = MockConsumer::new().with_messages([Message::new("orders", "placed")]);
/// let cfg = Config::new().with_consumer_client(Arc::new(mock.clone()));
/// assert_eq!(mock.close_count(), 0);
/// # let _ = cfg;
/// ```
#[derive(Clone, Default)]
pub struct MockConsumer {
    inner: Arc<Inner>,
}

impl MockConsumer {
    /// Create a mock with an empty read script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append messages to the read script.
    #[must_use]
    pub fn with_messages(self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.push_steps(messages.into_iter().map(ReadStep::Message));
        self
    }

    /// Append arbitrary steps to the read script.
    #[must_use]
    pub fn with_steps(self, steps: impl IntoIterator<Item = ReadStep>) -> Self {
        self.push_steps(steps);
        self
    }

    /// Make `create` fail.
    #[must_use]
    pub fn failing_create(self, error: ClientError) -> Self {
        *self.inner.create_error.lock().unwrap() = Some(error);
        self
    }

    /// Make `subscribe` fail.
    #[must_use]
    pub fn failing_subscribe(self, error: ClientError) -> Self {
        *self.inner.subscribe_error.lock().unwrap() = Some(error);
        self
    }

    /// Make every `commit_offsets` call fail.
    #[must_use]
    pub fn failing_commit(self, error: ClientError) -> Self {
        *self.inner.commit_error.lock().unwrap() = Some(error);
        self
    }

    /// Append steps to the read script.
    pub fn push_steps(&self, steps: impl IntoIterator<Item = ReadStep>) {
        self.inner.reads.lock().unwrap().extend(steps);
    }

    /// How many times `close` was called.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.inner.close_calls.load(Ordering::SeqCst)
    }

    /// How many times `read_message` was called.
    #[must_use]
    pub fn read_count(&self) -> usize {
        self.inner.read_calls.load(Ordering::SeqCst)
    }

    /// Settings passed to each `create` call.
    #[must_use]
    pub fn created(&self) -> Vec<Settings> {
        self.inner.created.lock().unwrap().clone()
    }

    /// Topic lists passed to each `subscribe` call.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.inner.subscriptions.lock().unwrap().clone()
    }

    /// Offsets passed to `commit_offsets`, in order.
    #[must_use]
    pub fn commits(&self) -> Vec<TopicPartitionOffset> {
        self.inner.commits.lock().unwrap().clone()
    }
}

impl ConsumerApi for MockConsumer {
    fn create(&self, settings: &Settings) -> Result<Box<dyn ConsumerClient>, ClientError> {
        self.inner.created.lock().unwrap().push(settings.clone());
        if let Some(err) = self.inner.create_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(Box::new(MockConsumerClient {
            inner: Arc::clone(&self.inner),
        }))
    }
}

/// Client handle produced by [`MockConsumer`].
pub struct MockConsumerClient {
    inner: Arc<Inner>,
}

impl ConsumerClient for MockConsumerClient {
    fn close(&self) {
        self.inner.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), ClientError> {
        self.inner.subscriptions.lock().unwrap().push(topics.to_vec());
        self.inner
            .subscribe_error
            .lock()
            .unwrap()
            .clone()
            .map_or(Ok(()), Err)
    }

    fn read_message(&self, _timeout: Option<Duration>) -> ClientFuture<'_, Option<Message>> {
        self.inner.read_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.inner.reads.lock().unwrap().pop_front();
        Box::pin(async move {
            match step {
                Some(ReadStep::Message(msg)) => Ok(Some(msg)),
                Some(ReadStep::Idle) => Ok(None),
                Some(ReadStep::Error(err)) => Err(err),
                None => Err(ClientError::Read("no more messages".to_string())),
            }
        })
    }

    fn commit_offsets(
        &self,
        offsets: &[TopicPartitionOffset],
    ) -> Result<Vec<TopicPartitionOffset>, ClientError> {
        if let Some(err) = self.inner.commit_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.inner.commits.lock().unwrap().extend_from_slice(offsets);
        Ok(offsets.to_vec())
    }
}
