use std::collections::HashMap;
use std::fmt;
use std::num::{NonZeroU32, NonZeroUsize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use consumer_common::offsets::OffsetStorage;
use consumer_common::types::{Message, TopicAndPartition};
use health::{ComponentStatus, HealthHandle};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::WorkerManagerError;
use crate::failure_counter::FailureCounter;
use crate::strategy::ProcessingStrategy;
use crate::task::{Task, TaskId, TaskResult};
use crate::worker::{Worker, WorkerHandle};

const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

/// What a pool does once its failure counter trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Log, report, and keep dispatching.
    Continue,
    /// Stop accepting batches, drain, and commit.
    StopPool,
    /// Like `StopPool`, and ask the owning consumer to shut down.
    ShutdownConsumer,
}

impl fmt::Display for FailureAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FailureAction::Continue => write!(f, "continue"),
            FailureAction::StopPool => write!(f, "stop_pool"),
            FailureAction::ShutdownConsumer => write!(f, "shutdown_consumer"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseFailureActionError(String);

impl FromStr for FailureAction {
    type Err = ParseFailureActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "continue" => Ok(FailureAction::Continue),
            "stop_pool" => Ok(FailureAction::StopPool),
            "shutdown_consumer" => Ok(FailureAction::ShutdownConsumer),
            invalid => Err(ParseFailureActionError(invalid.to_owned())),
        }
    }
}

/// Decides what happens when processing of a partition fails too often.
pub trait FailurePolicy: Send + Sync {
    fn on_threshold_reached(
        &self,
        partition: &TopicAndPartition,
        threshold: NonZeroU32,
        window: Duration,
    ) -> FailureAction;
}

/// The same action every time.
impl FailurePolicy for FailureAction {
    fn on_threshold_reached(&self, _: &TopicAndPartition, _: NonZeroU32, _: Duration) -> FailureAction {
        *self
    }
}

/// Sent to the owner of a pool every time its failure counter trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolFault {
    pub partition: TopicAndPartition,
    pub action: FailureAction,
}

/// How a pool stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// The offset committed on stop, if any message was ever dispatched.
    pub committed: Option<i64>,
    /// Set when the pool stopped because its failure counter tripped.
    pub fault: Option<FailureAction>,
}

pub struct WorkerManagerConfig {
    pub pool: PoolConfig,
    pub strategy: Arc<dyn ProcessingStrategy>,
    pub offset_storage: Arc<dyn OffsetStorage>,
    pub failure_policy: Arc<dyn FailurePolicy>,
    /// Batches buffered ahead of the dispatch loop.
    pub input_queue_batches: NonZeroUsize,
    /// Where to report faults, if anyone is listening.
    pub faults: Option<mpsc::UnboundedSender<PoolFault>>,
}

struct InFlight {
    offset: i64,
    worker: Arc<Worker>,
    started: Instant,
}

/// Why dispatching stopped before the batch was done.
enum Interrupted {
    Stopped,
    Fault(FailureAction),
}

/// Dispatches the batches of one partition to a fixed pool of workers, and
/// commits the highest dispatched offset once, when it stops.
///
/// The available workers sit in a bounded queue sized to the pool: taking a
/// worker out is the only way to dispatch, which gives backpressure, and only
/// the dispatch loop takes workers out or puts them back. The loop is also
/// the single writer of the pending offset.
pub struct WorkerManager {
    id: String,
    partition: TopicAndPartition,
    labels: [(&'static str, String); 2],
    strategy: Arc<dyn ProcessingStrategy>,
    offset_storage: Arc<dyn OffsetStorage>,
    failure_policy: Arc<dyn FailurePolicy>,
    faults: Option<mpsc::UnboundedSender<PoolFault>>,
    failure_counter: FailureCounter,
    workers: Vec<Arc<Worker>>,
    available_tx: mpsc::Sender<Arc<Worker>>,
    available_rx: mpsc::Receiver<Arc<Worker>>,
    results_rx: mpsc::Receiver<TaskResult>,
    input_tx: mpsc::Sender<Vec<Message>>,
    input_rx: mpsc::Receiver<Vec<Message>>,
    in_flight: HashMap<TaskId, InFlight>,
    next_task_id: u64,
    pending_highest_offset: Option<i64>,
    highest_offset_tx: watch::Sender<Option<i64>>,
    fault_tx: watch::Sender<Option<FailureAction>>,
    liveness: HealthHandle,
    liveness_interval: Interval,
    shutdown: watch::Receiver<bool>,
}

impl WorkerManager {
    /// Build a pool of `config.pool.num_workers` workers for `partition`, all
    /// of them available. The pool stops on its own once `shutdown` turns true.
    pub fn new(
        id: &str,
        config: WorkerManagerConfig,
        partition: TopicAndPartition,
        liveness: HealthHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let num_workers = config.pool.num_workers.get();
        let (results_tx, results_rx) = mpsc::channel(num_workers);
        let (available_tx, available_rx) = mpsc::channel(num_workers);
        let (input_tx, input_rx) = mpsc::channel(config.input_queue_batches.get());
        let (highest_offset_tx, _) = watch::channel(None);
        let (fault_tx, _) = watch::channel(None);

        let workers: Vec<Arc<Worker>> = (0..num_workers)
            .map(|index| {
                Arc::new(Worker::new(
                    WorkerHandle::new(id, index),
                    results_tx.clone(),
                    config.pool.task_timeout.0,
                ))
            })
            .collect();
        for worker in &workers {
            // Cannot fail: the queue is empty and sized to the pool.
            if available_tx.try_send(worker.clone()).is_err() {
                error!(manager = id, "availability queue is full at start");
            }
        }

        let mut liveness_interval = interval(LIVENESS_INTERVAL);
        liveness_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            id: id.to_owned(),
            labels: [
                ("topic", partition.topic().to_owned()),
                ("partition", partition.partition().to_string()),
            ],
            partition,
            strategy: config.strategy,
            offset_storage: config.offset_storage,
            failure_policy: config.failure_policy,
            faults: config.faults,
            failure_counter: FailureCounter::new(
                config.pool.failure_threshold,
                config.pool.failure_window.0,
            ),
            workers,
            available_tx,
            available_rx,
            results_rx,
            input_tx,
            input_rx,
            in_flight: HashMap::new(),
            next_task_id: 0,
            pending_highest_offset: None,
            highest_offset_tx,
            fault_tx,
            liveness,
            liveness_interval,
            shutdown,
        }
    }

    /// Spawn the dispatch loop.
    pub fn start(self) -> WorkerManagerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(None);

        let handle = WorkerManagerHandle {
            id: self.id.clone(),
            partition: self.partition.clone(),
            num_workers: self.workers.len(),
            input: self.input_tx.clone(),
            available: self.available_tx.clone(),
            stop: stop_tx,
            highest_offset: self.highest_offset_tx.subscribe(),
            fault: self.fault_tx.subscribe(),
            done: done_rx,
        };

        tokio::spawn(async move {
            let outcome = self.run(stop_rx).await;
            done_tx.send_replace(Some(outcome));
        });

        handle
    }

    async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<StopOutcome, WorkerManagerError> {
        info!(
            manager = self.id,
            topic = self.partition.topic(),
            partition = self.partition.partition(),
            workers = self.workers.len(),
            "starting worker manager"
        );
        self.liveness.report_healthy();

        let mut shutdown = self.shutdown.clone();
        let mut fault = None;

        loop {
            tokio::select! {
                biased;
                _ = signalled(&mut stop) => break,
                _ = signalled(&mut shutdown) => break,
                Some(result) = self.results_rx.recv() => {
                    if let Some(action) = self.handle_result(result) {
                        fault = Some(action);
                        break;
                    }
                }
                batch = self.input_rx.recv() => match batch {
                    Some(batch) => match self.dispatch_batch(batch, &mut stop, &mut shutdown).await {
                        Ok(()) => {}
                        Err(Interrupted::Stopped) => break,
                        Err(Interrupted::Fault(action)) => {
                            fault = Some(action);
                            break;
                        }
                    },
                    None => break,
                },
                _ = self.liveness_interval.tick() => self.liveness.report_healthy(),
            }
        }

        // Nothing is accepted from here on; queued batches are left unread.
        self.input_rx.close();
        self.drain().await;

        let committed = self.commit().await;
        match fault {
            Some(_) => self.liveness.report_status(ComponentStatus::Unhealthy),
            None => self.liveness.clone().deregister(),
        }
        info!(
            manager = self.id,
            topic = self.partition.topic(),
            partition = self.partition.partition(),
            committed = ?committed,
            "worker manager stopped"
        );

        committed.map(|committed| StopOutcome { committed, fault })
    }

    /// Hand every message of `batch` to a worker, in order. A stop or shutdown
    /// signal leaves the rest of the batch undispatched.
    async fn dispatch_batch(
        &mut self,
        batch: Vec<Message>,
        stop: &mut watch::Receiver<bool>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), Interrupted> {
        debug!(
            manager = self.id,
            messages = batch.len(),
            first_offset = ?batch.first().map(|m| m.offset),
            last_offset = ?batch.last().map(|m| m.offset),
            "dispatching batch"
        );

        let total = batch.len();
        for (position, message) in batch.into_iter().enumerate() {
            if message.topic_partition() != self.partition {
                warn!(
                    manager = self.id,
                    topic = message.topic.as_str(),
                    partition = message.partition,
                    offset = message.offset,
                    "skipping message of another partition"
                );
                continue;
            }

            let worker = match self.acquire_worker(stop, shutdown).await {
                Ok(worker) => worker,
                Err(Interrupted::Stopped) => {
                    info!(
                        manager = self.id,
                        offset = message.offset,
                        undispatched = total - position,
                        "stopped in the middle of a batch"
                    );
                    return Err(Interrupted::Stopped);
                }
                Err(fault) => return Err(fault),
            };

            let id = TaskId(self.next_task_id);
            self.next_task_id += 1;
            let offset = message.offset;
            worker.start(Task::new(id, message), self.strategy.clone());
            self.in_flight.insert(
                id,
                InFlight {
                    offset,
                    worker,
                    started: Instant::now(),
                },
            );
            self.report_saturation();
        }

        self.liveness.report_healthy();
        Ok(())
    }

    /// Wait for a free worker, handling results meanwhile since that is what frees workers.
    async fn acquire_worker(
        &mut self,
        stop: &mut watch::Receiver<bool>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Arc<Worker>, Interrupted> {
        loop {
            tokio::select! {
                biased;
                _ = signalled(stop) => return Err(Interrupted::Stopped),
                _ = signalled(shutdown) => return Err(Interrupted::Stopped),
                Some(result) = self.results_rx.recv() => {
                    if let Some(action) = self.handle_result(result) {
                        return Err(Interrupted::Fault(action));
                    }
                }
                Some(worker) = self.available_rx.recv() => return Ok(worker),
                _ = self.liveness_interval.tick() => self.liveness.report_healthy(),
            }
        }
    }

    /// Wait until every dispatched task has resolved.
    async fn drain(&mut self) {
        while !self.in_flight.is_empty() {
            tokio::select! {
                result = self.results_rx.recv() => match result {
                    Some(result) => {
                        // Already stopping: a tripped counter changes nothing anymore.
                        let _action = self.handle_result(result);
                    }
                    None => break,
                },
                _ = self.liveness_interval.tick() => self.liveness.report_healthy(),
            }
        }
    }

    /// Put the worker back, advance the pending offset, and feed failures to
    /// the failure counter. Returns the action to take if dispatch must stop.
    fn handle_result(&mut self, result: TaskResult) -> Option<FailureAction> {
        let Some(InFlight {
            offset,
            worker,
            started,
        }) = self.in_flight.remove(&result.id())
        else {
            warn!(manager = self.id, task = %result.id(), "result for an unknown task");
            return None;
        };

        if self.available_tx.try_send(worker).is_err() {
            error!(manager = self.id, "availability queue is full, dropping a worker");
        }

        let highest = self.pending_highest_offset.map_or(offset, |current| current.max(offset));
        self.pending_highest_offset = Some(highest);
        self.highest_offset_tx.send_replace(Some(highest));

        let labels = [
            ("topic", self.partition.topic().to_owned()),
            ("partition", self.partition.partition().to_string()),
            ("outcome", result.outcome().to_owned()),
        ];
        metrics::counter!("consumer_tasks_total", &labels).increment(1);
        metrics::histogram!("consumer_task_duration_seconds", &labels)
            .record(started.elapsed().as_secs_f64());
        self.report_saturation();

        if result.is_success() || !self.failure_counter.failed() {
            return None;
        }

        let action = self.failure_policy.on_threshold_reached(
            &self.partition,
            self.failure_counter.threshold(),
            self.failure_counter.window(),
        );
        error!(
            manager = self.id,
            topic = self.partition.topic(),
            partition = self.partition.partition(),
            threshold = self.failure_counter.threshold().get(),
            window_ms = self.failure_counter.window().as_millis() as u64,
            %action,
            "failure threshold reached"
        );
        metrics::counter!("consumer_failure_threshold_reached_total", &self.labels).increment(1);

        if let Some(faults) = &self.faults {
            let fault = PoolFault {
                partition: self.partition.clone(),
                action,
            };
            if let Err(error) = faults.send(fault) {
                warn!(
                    manager = self.id,
                    action = %error.0.action,
                    "pool fault dropped, its owner is gone"
                );
            }
        }

        match action {
            FailureAction::Continue => None,
            action => {
                self.fault_tx.send_replace(Some(action));
                Some(action)
            }
        }
    }

    /// Commit the highest dispatched offset. Called exactly once, when the loop ends.
    async fn commit(&self) -> Result<Option<i64>, WorkerManagerError> {
        let Some(offset) = self.pending_highest_offset else {
            info!(manager = self.id, "nothing was dispatched, no offset to commit");
            return Ok(None);
        };

        match self.offset_storage.commit(&self.partition, offset).await {
            Ok(()) => {
                metrics::counter!("consumer_offset_commits_total", &self.labels).increment(1);
                info!(
                    manager = self.id,
                    topic = self.partition.topic(),
                    partition = self.partition.partition(),
                    offset,
                    "committed offset"
                );
                Ok(Some(offset))
            }
            Err(source) => {
                metrics::counter!("consumer_offset_commit_failures_total", &self.labels)
                    .increment(1);
                error!(
                    manager = self.id,
                    topic = self.partition.topic(),
                    partition = self.partition.partition(),
                    offset,
                    "failed to commit offset: {}",
                    source
                );
                Err(WorkerManagerError::Commit {
                    partition: self.partition.clone(),
                    offset,
                    source,
                })
            }
        }
    }

    fn report_saturation(&self) {
        let available = self.available_tx.max_capacity() - self.available_tx.capacity();
        metrics::gauge!("consumer_worker_saturation_percent", &self.labels)
            .set(1f64 - available as f64 / self.workers.len() as f64);
    }
}

/// Resolves once `signal` turns true, or once its sender is gone.
pub(crate) async fn signalled(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|stop| *stop).await.is_err() {
        debug!("signal sender dropped");
    }
}

/// The owner's side of a running `WorkerManager`.
pub struct WorkerManagerHandle {
    id: String,
    partition: TopicAndPartition,
    num_workers: usize,
    input: mpsc::Sender<Vec<Message>>,
    available: mpsc::Sender<Arc<Worker>>,
    stop: watch::Sender<bool>,
    highest_offset: watch::Receiver<Option<i64>>,
    fault: watch::Receiver<Option<FailureAction>>,
    done: watch::Receiver<Option<Result<StopOutcome, WorkerManagerError>>>,
}

impl WorkerManagerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn partition(&self) -> &TopicAndPartition {
        &self.partition
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Workers currently waiting for a task.
    pub fn available_workers(&self) -> usize {
        self.available.max_capacity() - self.available.capacity()
    }

    /// The highest offset dispatched and resolved so far.
    pub fn highest_offset(&self) -> Option<i64> {
        *self.highest_offset.borrow()
    }

    /// Set once the failure counter tripped with an action that stops the pool.
    pub fn fault(&self) -> Option<FailureAction> {
        *self.fault.borrow()
    }

    /// Queue a batch for dispatch, waiting for room in the input queue.
    pub async fn send_batch(&self, batch: Vec<Message>) -> Result<(), WorkerManagerError> {
        self.input
            .send(batch)
            .await
            .map_err(|_| WorkerManagerError::Stopped(self.partition.clone()))
    }

    /// Stop accepting batches, wait for in-flight tasks, and commit.
    ///
    /// The commit happens once no matter how often this is called: later
    /// calls return the outcome of the first stop.
    pub async fn stop(&self) -> Result<StopOutcome, WorkerManagerError> {
        self.stop.send_replace(true);
        self.stopped().await
    }

    /// Wait for the pool to stop, without asking it to.
    pub async fn stopped(&self) -> Result<StopOutcome, WorkerManagerError> {
        let mut done = self.done.clone();
        let outcome = match done.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(WorkerManagerError::Terminated(self.partition.clone())))
    }
}
