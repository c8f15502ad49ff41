use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::types::TopicAndPartition;

/// Enumeration of errors returned by an `OffsetStorage`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OffsetStorageError {
    #[error("failed to commit offset {offset} for {partition}: {reason}")]
    CommitFailed {
        partition: TopicAndPartition,
        offset: i64,
        reason: String,
    },
    #[error("failed to fetch the last committed offset for {partition}: {reason}")]
    FetchFailed {
        partition: TopicAndPartition,
        reason: String,
    },
}

/// Durable storage for the offsets of one consumer group.
///
/// The committed offset is the last offset that was handed to a worker and
/// resolved, not the next offset to read.
#[async_trait]
pub trait OffsetStorage: Send + Sync {
    async fn commit(
        &self,
        partition: &TopicAndPartition,
        offset: i64,
    ) -> Result<(), OffsetStorageError>;

    /// The last committed offset, or `None` if nothing was ever committed.
    async fn fetch_last(
        &self,
        partition: &TopicAndPartition,
    ) -> Result<Option<i64>, OffsetStorageError>;
}

/// An `OffsetStorage` kept in memory, which also records every commit it
/// receives. Used for local runs and tests.
#[derive(Default)]
pub struct InMemoryOffsetStorage {
    offsets: Mutex<HashMap<TopicAndPartition, i64>>,
    history: Mutex<Vec<(TopicAndPartition, i64)>>,
    fail_commits: AtomicBool,
    fail_fetches: AtomicBool,
}

impl InMemoryOffsetStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend an offset was committed earlier, without recording it in the history.
    pub fn seed(&self, partition: TopicAndPartition, offset: i64) {
        self.offsets
            .lock()
            .expect("poisoned offset storage mutex")
            .insert(partition, offset);
    }

    /// Make every following commit fail (or succeed again).
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Make every following `fetch_last` fail (or succeed again).
    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Every successful commit, in order.
    pub fn commit_history(&self) -> Vec<(TopicAndPartition, i64)> {
        self.history
            .lock()
            .expect("poisoned offset storage mutex")
            .clone()
    }

    pub fn commit_count(&self, partition: &TopicAndPartition) -> usize {
        self.commit_history()
            .iter()
            .filter(|(committed, _)| committed == partition)
            .count()
    }

    pub fn committed(&self, partition: &TopicAndPartition) -> Option<i64> {
        self.offsets
            .lock()
            .expect("poisoned offset storage mutex")
            .get(partition)
            .copied()
    }
}

#[async_trait]
impl OffsetStorage for InMemoryOffsetStorage {
    async fn commit(
        &self,
        partition: &TopicAndPartition,
        offset: i64,
    ) -> Result<(), OffsetStorageError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(OffsetStorageError::CommitFailed {
                partition: partition.clone(),
                offset,
                reason: "commits are disabled".to_owned(),
            });
        }

        let (mut offsets, mut history) = match (self.offsets.lock(), self.history.lock()) {
            (Ok(offsets), Ok(history)) => (offsets, history),
            _ => {
                return Err(OffsetStorageError::CommitFailed {
                    partition: partition.clone(),
                    offset,
                    reason: "poisoned offset storage mutex".to_owned(),
                })
            }
        };

        debug!(
            topic = partition.topic(),
            partition = partition.partition(),
            offset,
            "committing offset"
        );
        offsets.insert(partition.clone(), offset);
        history.push((partition.clone(), offset));

        Ok(())
    }

    async fn fetch_last(
        &self,
        partition: &TopicAndPartition,
    ) -> Result<Option<i64>, OffsetStorageError> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(OffsetStorageError::FetchFailed {
                partition: partition.clone(),
                reason: "fetches are disabled".to_owned(),
            });
        }

        self.offsets
            .lock()
            .map(|offsets| offsets.get(partition).copied())
            .map_err(|_| OffsetStorageError::FetchFailed {
                partition: partition.clone(),
                reason: "poisoned offset storage mutex".to_owned(),
            })
    }
}
