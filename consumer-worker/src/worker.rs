use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::strategy::ProcessingStrategy;
use crate::task::{Task, TaskResult};

/// The identity of a worker, as seen by processing strategies.
///
/// A handle carries no mutable state, so a worker can be handed a new task
/// while a strategy that timed out on it is still running.
///
/// Nothing caps how many timed out strategies keep running: a strategy that
/// hangs for good leaves one tokio task behind per timeout, as many as the
/// pool dispatches while its failure policy lets it continue. They are
/// counted by `Worker::detached` and the `consumer_detached_strategies` gauge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerHandle {
    manager_id: Arc<str>,
    index: usize,
}

impl WorkerHandle {
    pub fn new(manager_id: &str, index: usize) -> Self {
        Self {
            manager_id: Arc::from(manager_id),
            index,
        }
    }

    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-worker-{}", self.manager_id, self.index)
    }
}

/// Runs one task at a time under a deadline, and delivers exactly one
/// `TaskResult` per task on its output queue.
///
/// A worker never puts itself back into its pool: whoever reads the result
/// is responsible for that.
pub struct Worker {
    handle: WorkerHandle,
    output: mpsc::Sender<TaskResult>,
    task_timeout: Duration,
    detached: Arc<AtomicUsize>,
}

/// Counts one strategy that outlived its task timeout, until it is dropped.
struct Detached(Arc<AtomicUsize>);

impl Detached {
    fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!("consumer_detached_strategies").increment(1.0);
        Self(count)
    }
}

impl Drop for Detached {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
        metrics::gauge!("consumer_detached_strategies").decrement(1.0);
    }
}

impl Worker {
    pub fn new(handle: WorkerHandle, output: mpsc::Sender<TaskResult>, task_timeout: Duration) -> Self {
        Self {
            handle,
            output,
            task_timeout,
            detached: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// How many strategies started by this worker timed out and still run.
    pub fn detached(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }

    /// Start processing `task` with `strategy`, without waiting for it.
    ///
    /// The strategy runs in its own tokio task. If it does not return before
    /// the task timeout, a `TimedOut` result is delivered instead and the
    /// strategy is detached: it keeps running, and whatever it returns later
    /// is dropped. A panicking strategy counts as a processing failure.
    ///
    /// The returned handle resolves once the strategy itself has returned.
    pub fn start(&self, task: Task, strategy: Arc<dyn ProcessingStrategy>) -> JoinHandle<()> {
        let handle = self.handle.clone();
        let output = self.output.clone();
        let task_timeout = self.task_timeout;
        let detached_count = self.detached.clone();

        tokio::spawn(async move {
            let id = task.id;
            let offset = task.message.offset;
            let strategy_handle = handle.clone();

            let mut execution = tokio::spawn(async move {
                strategy
                    .process(&strategy_handle, &task.message, task.id)
                    .await
            });

            let mut detached = None;
            let result = match tokio::time::timeout(task_timeout, &mut execution).await {
                Ok(Ok(result)) if result.id() == id => result,
                Ok(Ok(result)) => {
                    warn!(
                        worker = %handle,
                        task = %id,
                        returned = %result.id(),
                        "strategy returned a result for another task"
                    );
                    TaskResult::ProcessingFailed(id)
                }
                Ok(Err(error)) => {
                    warn!(worker = %handle, task = %id, offset, "strategy panicked: {}", error);
                    TaskResult::ProcessingFailed(id)
                }
                Err(_) => {
                    warn!(
                        worker = %handle,
                        task = %id,
                        offset,
                        timeout_ms = task_timeout.as_millis() as u64,
                        "task timed out"
                    );
                    detached = Some(Detached::new(detached_count));
                    TaskResult::TimedOut(id)
                }
            };

            if output.send(result).await.is_err() {
                debug!(worker = %handle, task = %id, "result receiver is gone, dropping result");
            }

            if let Some(detached) = detached {
                if let Err(error) = execution.await {
                    debug!(worker = %handle, task = %id, "detached strategy panicked: {}", error);
                }
                drop(detached);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use consumer_common::types::Message;

    use crate::strategy::FnStrategy;
    use crate::task::TaskId;

    struct SlowStrategy(Duration);

    #[async_trait]
    impl ProcessingStrategy for SlowStrategy {
        async fn process(&self, _: &WorkerHandle, _: &Message, id: TaskId) -> TaskResult {
            tokio::time::sleep(self.0).await;
            TaskResult::Successful(id)
        }
    }

    fn good_strategy() -> Arc<dyn ProcessingStrategy> {
        Arc::new(FnStrategy(|_: &WorkerHandle, _: &Message, id: TaskId| {
            TaskResult::Successful(id)
        }))
    }

    fn fail_strategy() -> Arc<dyn ProcessingStrategy> {
        Arc::new(FnStrategy(|_: &WorkerHandle, _: &Message, id: TaskId| {
            TaskResult::ProcessingFailed(id)
        }))
    }

    fn task(id: u64) -> Task {
        Task::new(TaskId(id), Message::new("fakeTopic", 0, id as i64, "payload"))
    }

    fn worker(output: mpsc::Sender<TaskResult>, task_timeout: Duration) -> Worker {
        Worker::new(WorkerHandle::new("test-WM", 0), output, task_timeout)
    }

    async fn assert_no_result(output: &mut mpsc::Receiver<TaskResult>, wait: Duration) {
        if let Ok(result) = tokio::time::timeout(wait, output.recv()).await {
            panic!("worker produced an unexpected result: {:?}", result);
        }
    }

    #[tokio::test]
    async fn test_successful_strategy() {
        let (tx, mut rx) = mpsc::channel(1);
        let worker = worker(tx, Duration::from_secs(1));

        worker.start(task(1), good_strategy());

        assert_eq!(rx.recv().await, Some(TaskResult::Successful(TaskId(1))));
        assert_no_result(&mut rx, Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn test_failing_strategy() {
        let (tx, mut rx) = mpsc::channel(1);
        let worker = worker(tx, Duration::from_secs(1));

        worker.start(task(2), fail_strategy());

        assert_eq!(rx.recv().await, Some(TaskResult::ProcessingFailed(TaskId(2))));
        assert_no_result(&mut rx, Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn test_slow_strategy_times_out_once() {
        let (tx, mut rx) = mpsc::channel(1);
        let task_timeout = Duration::from_millis(500);
        let worker = worker(tx, task_timeout);

        worker.start(task(3), Arc::new(SlowStrategy(Duration::from_millis(1500))));

        assert_eq!(rx.recv().await, Some(TaskResult::TimedOut(TaskId(3))));
        // The strategy returns while we wait here: its late result must be dropped.
        assert_no_result(&mut rx, task_timeout + Duration::from_millis(1500)).await;
    }

    #[tokio::test]
    async fn test_timed_out_strategy_is_counted_until_it_returns() {
        let (tx, mut rx) = mpsc::channel(1);
        let worker = worker(tx, Duration::from_millis(100));
        assert_eq!(worker.detached(), 0);

        let running = worker.start(task(6), Arc::new(SlowStrategy(Duration::from_millis(600))));

        assert_eq!(rx.recv().await, Some(TaskResult::TimedOut(TaskId(6))));
        assert_eq!(worker.detached(), 1);

        running.await.unwrap();
        assert_eq!(worker.detached(), 0);
    }

    #[tokio::test]
    async fn test_panicking_strategy_fails() {
        let (tx, mut rx) = mpsc::channel(1);
        let worker = worker(tx, Duration::from_secs(1));

        let strategy = Arc::new(FnStrategy(
            |_: &WorkerHandle, _: &Message, _: TaskId| -> TaskResult { panic!("broken strategy") },
        ));
        worker.start(task(4), strategy);

        assert_eq!(rx.recv().await, Some(TaskResult::ProcessingFailed(TaskId(4))));
    }

    #[tokio::test]
    async fn test_mismatched_task_id_fails() {
        let (tx, mut rx) = mpsc::channel(1);
        let worker = worker(tx, Duration::from_secs(1));

        let strategy = Arc::new(FnStrategy(|_: &WorkerHandle, _: &Message, _: TaskId| {
            TaskResult::Successful(TaskId(99))
        }));
        worker.start(task(5), strategy);

        assert_eq!(rx.recv().await, Some(TaskResult::ProcessingFailed(TaskId(5))));
    }

    #[test]
    fn test_handle_display() {
        let handle = WorkerHandle::new("events-0", 2);
        assert_eq!(handle.to_string(), "events-0-worker-2");
        assert_eq!(handle.manager_id(), "events-0");
        assert_eq!(handle.index(), 2);
    }
}
