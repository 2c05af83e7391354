//! rdkafka-backed consumer capability set.

use crate::{client_config, to_message};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Offset, TopicPartitionList};
use relaykit_core::{
    ClientError, ClientFuture, ConsumerApi, ConsumerClient, Message, Settings,
    TopicPartitionOffset,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Default consumer capability set: creates rdkafka [`StreamConsumer`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct RdKafkaConsumerApi;

impl ConsumerApi for RdKafkaConsumerApi {
    fn create(&self, settings: &Settings) -> Result<Box<dyn ConsumerClient>, ClientError> {
        let consumer: StreamConsumer = client_config(settings)
            .create()
            .map_err(|e| ClientError::Creation(format!("Failed to create consumer: {e}")))?;

        tracing::info!(settings = settings.len(), "rdkafka consumer created");

        Ok(Box::new(RdKafkaConsumerClient {
            consumer: Mutex::new(Some(Arc::new(consumer))),
        }))
    }
}

/// A live rdkafka consumer.
///
/// `close` drops this handle's reference; a read that is still in flight
/// keeps the consumer alive until it returns.
pub struct RdKafkaConsumerClient {
    consumer: Mutex<Option<Arc<StreamConsumer>>>,
}

impl RdKafkaConsumerClient {
    fn handle(&self) -> Option<Arc<StreamConsumer>> {
        self.consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ConsumerClient for RdKafkaConsumerClient {
    fn close(&self) {
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(consumer) = consumer {
            consumer.unsubscribe();
            tracing::debug!("rdkafka consumer closed");
        }
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), ClientError> {
        let consumer = self.handle().ok_or_else(|| ClientError::Subscription {
            topics: topics.to_vec(),
            reason: "consumer is closed".to_string(),
        })?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| ClientError::Subscription {
                topics: topics.to_vec(),
                reason: e.to_string(),
            })
    }

    fn read_message(&self, timeout: Option<Duration>) -> ClientFuture<'_, Option<Message>> {
        let consumer = self.handle();

        Box::pin(async move {
            let consumer =
                consumer.ok_or_else(|| ClientError::Read("consumer is closed".to_string()))?;

            let received = match timeout {
                None => consumer.recv().await,
                Some(timeout) => match tokio::time::timeout(timeout, consumer.recv()).await {
                    Ok(received) => received,
                    Err(_elapsed) => return Ok(None),
                },
            };

            let message = received.map_err(|e| ClientError::Read(e.to_string()))?;
            Ok(Some(to_message(&message)))
        })
    }

    fn commit_offsets(
        &self,
        offsets: &[TopicPartitionOffset],
    ) -> Result<Vec<TopicPartitionOffset>, ClientError> {
        let consumer = self
            .handle()
            .ok_or_else(|| ClientError::Commit("consumer is closed".to_string()))?;

        consumer
            .commit(&commit_list(offsets)?, CommitMode::Sync)
            .map_err(|e| ClientError::Commit(e.to_string()))?;

        Ok(offsets.to_vec())
    }
}

/// Build the commit list for processed messages.
///
/// Kafka commits the offset of the *next* message to read, hence `+ 1`.
fn commit_list(offsets: &[TopicPartitionOffset]) -> Result<TopicPartitionList, ClientError> {
    let mut list = TopicPartitionList::with_capacity(offsets.len());
    for tpo in offsets {
        list.add_partition_offset(&tpo.topic, tpo.partition, Offset::Offset(tpo.offset + 1))
            .map_err(|e| ClientError::Commit(format!("{tpo}: {e}")))?;
    }
    Ok(list)
}
