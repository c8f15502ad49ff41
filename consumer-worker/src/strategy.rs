use async_trait::async_trait;
use consumer_common::types::Message;
use tokio::sync::mpsc;
use tracing::warn;

use crate::task::{TaskId, TaskResult};
use crate::worker::WorkerHandle;

/// Application logic processing one message.
///
/// Implementations decide whether a message was processed successfully. They
/// may run for any amount of time: the worker stops waiting at the task
/// timeout, but never interrupts the strategy.
#[async_trait]
pub trait ProcessingStrategy: Send + Sync + 'static {
    async fn process(&self, worker: &WorkerHandle, message: &Message, id: TaskId) -> TaskResult;
}

/// Adapts a synchronous closure into a `ProcessingStrategy`.
/// The closure runs on the async runtime, so it must not block.
pub struct FnStrategy<F>(pub F);

#[async_trait]
impl<F> ProcessingStrategy for FnStrategy<F>
where
    F: Fn(&WorkerHandle, &Message, TaskId) -> TaskResult + Send + Sync + 'static,
{
    async fn process(&self, worker: &WorkerHandle, message: &Message, id: TaskId) -> TaskResult {
        (self.0)(worker, message, id)
    }
}

/// Forwards every message to a consumer thread's stream.
///
/// Processing fails when the stream was dropped by the application.
pub struct StreamStrategy {
    stream: mpsc::Sender<Message>,
}

impl StreamStrategy {
    pub fn new(stream: mpsc::Sender<Message>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl ProcessingStrategy for StreamStrategy {
    async fn process(&self, worker: &WorkerHandle, message: &Message, id: TaskId) -> TaskResult {
        match self.stream.send(message.clone()).await {
            Ok(()) => TaskResult::Successful(id),
            Err(_) => {
                warn!(
                    worker = %worker,
                    topic = message.topic.as_str(),
                    partition = message.partition,
                    offset = message.offset,
                    "message stream was closed"
                );
                TaskResult::ProcessingFailed(id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_strategy_forwards_messages() {
        let (tx, mut rx) = mpsc::channel(1);
        let strategy = StreamStrategy::new(tx);
        let worker = WorkerHandle::new("test-WM", 0);
        let message = Message::new("events", 0, 7, "payload");

        let result = strategy.process(&worker, &message, TaskId(1)).await;

        assert_eq!(result, TaskResult::Successful(TaskId(1)));
        assert_eq!(rx.recv().await, Some(message.clone()));

        drop(rx);
        let result = strategy.process(&worker, &message, TaskId(2)).await;
        assert_eq!(result, TaskResult::ProcessingFailed(TaskId(2)));
    }

    #[tokio::test]
    async fn closures_are_strategies() {
        let strategy = FnStrategy(|_: &WorkerHandle, message: &Message, id: TaskId| {
            if message.offset % 2 == 0 {
                TaskResult::Successful(id)
            } else {
                TaskResult::ProcessingFailed(id)
            }
        });
        let worker = WorkerHandle::new("test-WM", 0);

        let even = Message::new("events", 0, 2, "payload");
        let odd = Message::new("events", 0, 3, "payload");
        assert!(strategy.process(&worker, &even, TaskId(1)).await.is_success());
        assert!(!strategy.process(&worker, &odd, TaskId(2)).await.is_success());
    }
}
