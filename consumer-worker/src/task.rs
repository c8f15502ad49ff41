use std::fmt;
use std::sync::Arc;

use consumer_common::types::Message;

/// Correlates a `TaskResult` with the dispatch that produced it.
/// Unique per dispatch within one pool, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// One message handed to one worker.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub message: Arc<Message>,
}

impl Task {
    pub fn new(id: TaskId, message: Message) -> Self {
        Self {
            id,
            message: Arc::new(message),
        }
    }
}

/// The outcome of one task. Exactly one is produced per dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Successful(TaskId),
    ProcessingFailed(TaskId),
    TimedOut(TaskId),
}

impl TaskResult {
    pub fn id(&self) -> TaskId {
        match self {
            TaskResult::Successful(id)
            | TaskResult::ProcessingFailed(id)
            | TaskResult::TimedOut(id) => *id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Successful(_))
    }

    /// Label used for metrics and logs.
    pub fn outcome(&self) -> &'static str {
        match self {
            TaskResult::Successful(_) => "successful",
            TaskResult::ProcessingFailed(_) => "processing_failed",
            TaskResult::TimedOut(_) => "timed_out",
        }
    }
}
