use consumer_common::coordinator::CoordinatorError;
use consumer_common::fetch::FetchError;
use consumer_common::offsets::OffsetStorageError;
use consumer_common::types::TopicAndPartition;
use thiserror::Error;

/// Enumeration of errors surfaced by a partition's `WorkerManager`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerManagerError {
    #[error("worker manager for {0} is stopped and accepts no more batches")]
    Stopped(TopicAndPartition),
    #[error("failed to commit offset {offset} for {partition}")]
    Commit {
        partition: TopicAndPartition,
        offset: i64,
        #[source]
        source: OffsetStorageError,
    },
    #[error("worker manager for {0} terminated without reporting how it stopped")]
    Terminated(TopicAndPartition),
}

/// Enumeration of errors related to running a `Consumer`.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("an error occurred talking to the coordination service")]
    CoordinatorError(#[from] CoordinatorError),
    #[error("failed to read committed offsets")]
    OffsetStorageError(#[from] OffsetStorageError),
    #[error("failed to look up a start offset")]
    FetchError(#[from] FetchError),
    #[error("{} partition(s) failed to commit their final offset", .0.len())]
    CommitError(Vec<WorkerManagerError>),
    #[error("topic {0} needs at least one consumer thread")]
    NoThreads(String),
    #[error("this consumer is already consuming")]
    AlreadyStarted,
    #[error("the rebalance loop terminated unexpectedly")]
    Terminated,
}
