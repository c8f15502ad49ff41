use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::types::{Message, TopicAndPartition};

/// Enumeration of errors returned by a `Fetcher`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("{0} does not exist")]
    UnknownPartition(TopicAndPartition),
    #[error("offset {offset} is out of range for {partition}")]
    OffsetOutOfRange {
        partition: TopicAndPartition,
        offset: i64,
    },
    #[error("the broker is unavailable: {0}")]
    Unavailable(String),
}

/// Reads ordered batches of messages out of the log.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Up to `max_messages` messages of `partition`, starting at `offset`, in
    /// increasing offset order. An empty batch means there is nothing new yet.
    async fn fetch(
        &self,
        partition: &TopicAndPartition,
        offset: i64,
        max_messages: usize,
    ) -> Result<Vec<Message>, FetchError>;

    /// The oldest offset still in the log, and the offset the next appended
    /// message will get.
    async fn watermarks(&self, partition: &TopicAndPartition) -> Result<(i64, i64), FetchError>;
}

/// A log kept in memory. Offsets start at 0 and are contiguous.
#[derive(Default)]
pub struct InMemoryLog {
    partitions: Mutex<HashMap<TopicAndPartition, Vec<Message>>>,
    next_partition: Mutex<HashMap<String, usize>>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut log = self.partitions.lock().expect("poisoned log mutex");
        for partition in 0..partitions {
            log.entry(TopicAndPartition::new(topic, partition))
                .or_default();
        }
    }

    /// Append to one partition, returning the offset of the new message.
    pub fn append(
        &self,
        partition: &TopicAndPartition,
        payload: impl Into<Bytes>,
    ) -> Result<i64, FetchError> {
        let mut log = self.partitions.lock().expect("poisoned log mutex");
        let messages = log
            .get_mut(partition)
            .ok_or_else(|| FetchError::UnknownPartition(partition.clone()))?;
        let offset = messages.len() as i64;
        messages.push(Message::new(
            partition.topic(),
            partition.partition(),
            offset,
            payload,
        ));
        Ok(offset)
    }

    /// Append to the partitions of `topic` in turn, like a keyless producer would.
    pub fn produce(&self, topic: &str, payload: impl Into<Bytes>) -> Result<i64, FetchError> {
        let partition_count = self.partition_count(topic);
        if partition_count == 0 {
            return Err(FetchError::UnknownPartition(TopicAndPartition::new(
                topic, 0,
            )));
        }

        let partition = {
            let mut next = self.next_partition.lock().expect("poisoned log mutex");
            let counter = next.entry(topic.to_owned()).or_default();
            let partition = *counter % partition_count;
            *counter += 1;
            partition
        };

        self.append(&TopicAndPartition::new(topic, partition as i32), payload)
    }

    pub fn partition_count(&self, topic: &str) -> usize {
        self.partitions
            .lock()
            .expect("poisoned log mutex")
            .keys()
            .filter(|partition| partition.topic() == topic)
            .count()
    }
}

#[async_trait]
impl Fetcher for InMemoryLog {
    async fn fetch(
        &self,
        partition: &TopicAndPartition,
        offset: i64,
        max_messages: usize,
    ) -> Result<Vec<Message>, FetchError> {
        let log = self
            .partitions
            .lock()
            .map_err(|_| FetchError::Unavailable("poisoned log mutex".to_owned()))?;
        let messages = log
            .get(partition)
            .ok_or_else(|| FetchError::UnknownPartition(partition.clone()))?;

        if offset < 0 || offset > messages.len() as i64 {
            return Err(FetchError::OffsetOutOfRange {
                partition: partition.clone(),
                offset,
            });
        }

        Ok(messages
            .iter()
            .skip(offset as usize)
            .take(max_messages)
            .cloned()
            .collect())
    }

    async fn watermarks(&self, partition: &TopicAndPartition) -> Result<(i64, i64), FetchError> {
        let log = self
            .partitions
            .lock()
            .map_err(|_| FetchError::Unavailable("poisoned log mutex".to_owned()))?;
        log.get(partition)
            .map(|messages| (0, messages.len() as i64))
            .ok_or_else(|| FetchError::UnknownPartition(partition.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetches_in_offset_order() {
        let log = InMemoryLog::new();
        log.create_topic("events", 1);
        let partition = TopicAndPartition::new("events", 0);
        for i in 0..5 {
            assert_eq!(log.append(&partition, format!("message {}", i)).unwrap(), i);
        }

        let batch = log.fetch(&partition, 1, 3).await.unwrap();
        let offsets: Vec<i64> = batch.iter().map(|message| message.offset).collect();
        assert_eq!(offsets, vec![1, 2, 3]);
        assert_eq!(batch[0].payload, Bytes::from("message 1"));

        assert!(log.fetch(&partition, 5, 3).await.unwrap().is_empty());
        assert!(matches!(
            log.fetch(&partition, 6, 3).await,
            Err(FetchError::OffsetOutOfRange { offset: 6, .. })
        ));
        assert_eq!(log.watermarks(&partition).await.unwrap(), (0, 5));
    }

    #[tokio::test]
    async fn produce_spreads_over_partitions() {
        let log = InMemoryLog::new();
        log.create_topic("events", 3);
        for i in 0..9 {
            log.produce("events", format!("message {}", i)).unwrap();
        }

        for partition in 0..3 {
            let partition = TopicAndPartition::new("events", partition);
            assert_eq!(log.watermarks(&partition).await.unwrap(), (0, 3));
        }
        assert!(matches!(
            log.produce("missing", "payload"),
            Err(FetchError::UnknownPartition(_))
        ));
    }
}
