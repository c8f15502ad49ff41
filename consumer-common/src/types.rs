use std::fmt;

use bytes::Bytes;

/// A partition of a topic. Key for offset tracking and commit bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicAndPartition {
    topic: String,
    partition: i32,
}

impl TopicAndPartition {
    pub fn new(topic: &str, partition: i32) -> Self {
        Self {
            topic: topic.to_owned(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for TopicAndPartition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// A message as fetched from the log. Never modified after the fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: &str, partition: i32, offset: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.to_owned(),
            partition,
            offset,
            payload: payload.into(),
        }
    }

    pub fn topic_partition(&self) -> TopicAndPartition {
        TopicAndPartition::new(&self.topic, self.partition)
    }
}
