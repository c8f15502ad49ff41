use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use consumer_common::coordinator::Coordinator;
use consumer_common::fetch::{FetchError, Fetcher};
use consumer_common::offsets::OffsetStorage;
use consumer_common::types::{Message, TopicAndPartition};
use futures::future::join_all;
use futures::Stream;
use health::{HealthHandle, HealthRegistry};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::assignment::{ConsumerThreadId, PartitionAssigner};
use crate::config::{Config, FetchConfig, OffsetReset, PoolConfig};
use crate::error::{ConsumerError, WorkerManagerError};
use crate::strategy::{ProcessingStrategy, StreamStrategy};
use crate::worker_manager::{
    signalled, FailureAction, FailurePolicy, PoolFault, StopOutcome, WorkerManager,
    WorkerManagerConfig, WorkerManagerHandle,
};

/// How long a partition pool may go without reporting before it counts as stalled.
const POOL_LIVENESS_DEADLINE: time::Duration = time::Duration::seconds(30);

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub consumer_id: String,
    pub pool: PoolConfig,
    pub fetch: FetchConfig,
}

impl From<&Config> for ConsumerConfig {
    fn from(config: &Config) -> Self {
        Self {
            group_id: config.group_id.as_str().to_owned(),
            consumer_id: config.consumer_id.as_str().to_owned(),
            pool: config.pool,
            fetch: config.fetch,
        }
    }
}

/// The messages of every partition assigned to one consumer thread slot, in
/// the order their tasks were picked up by workers.
///
/// A slot with no partition never yields. The stream ends once the consumer
/// is closed.
pub struct MessageStream {
    thread: ConsumerThreadId,
    messages: mpsc::Receiver<Message>,
}

impl MessageStream {
    pub fn thread(&self) -> &ConsumerThreadId {
        &self.thread
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.messages.recv().await
    }
}

impl Stream for MessageStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.poll_recv(cx)
    }
}

/// A topic this consumer reads, and the strategy of each of its thread slots.
struct Subscription {
    assigner: PartitionAssigner,
    strategies: Vec<Arc<dyn ProcessingStrategy>>,
}

/// Everything the background loops of a started consumer share.
struct ConsumerContext {
    config: ConsumerConfig,
    coordinator: Arc<dyn Coordinator>,
    fetcher: Arc<dyn Fetcher>,
    offset_storage: Arc<dyn OffsetStorage>,
    failure_policy: Arc<dyn FailurePolicy>,
    liveness: HealthRegistry,
    shutdown: watch::Receiver<bool>,
    faults: mpsc::UnboundedSender<PoolFault>,
}

/// Consumes the partitions a coordinator assigns to this consumer, each with
/// its own fetch loop feeding its own worker pool.
///
/// Pools of the previous assignment are always stopped, and have committed,
/// before pools of a new assignment start.
pub struct Consumer {
    config: ConsumerConfig,
    coordinator: Arc<dyn Coordinator>,
    fetcher: Arc<dyn Fetcher>,
    offset_storage: Arc<dyn OffsetStorage>,
    failure_policy: Arc<dyn FailurePolicy>,
    liveness: HealthRegistry,
    shutdown: Arc<watch::Sender<bool>>,
    rebalancer: Option<JoinHandle<Result<(), ConsumerError>>>,
    registered: bool,
}

impl Consumer {
    pub fn new(
        config: ConsumerConfig,
        coordinator: Arc<dyn Coordinator>,
        fetcher: Arc<dyn Fetcher>,
        offset_storage: Arc<dyn OffsetStorage>,
        liveness: HealthRegistry,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            failure_policy: Arc::new(config.pool.failure_action),
            config,
            coordinator,
            fetcher,
            offset_storage,
            liveness,
            shutdown: Arc::new(shutdown),
            rebalancer: None,
            registered: false,
        }
    }

    /// Replace the `FAILURE_ACTION` of the configuration with a custom policy.
    pub fn with_failure_policy(mut self, failure_policy: Arc<dyn FailurePolicy>) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Start consuming `topics`, returning exactly as many streams per topic
    /// as threads were asked for.
    pub async fn create_message_streams(
        &mut self,
        topics: &HashMap<String, usize>,
    ) -> Result<HashMap<String, Vec<MessageStream>>, ConsumerError> {
        let mut streams = HashMap::with_capacity(topics.len());
        let mut subscriptions = Vec::with_capacity(topics.len());

        for (topic, threads) in topics {
            let assigner = self.assigner(topic, *threads)?;
            let mut topic_streams = Vec::with_capacity(assigner.threads());
            let mut strategies = Vec::with_capacity(assigner.threads());

            for index in 0..assigner.threads() {
                let (tx, rx) = mpsc::channel(self.config.pool.num_workers.get());
                let strategy: Arc<dyn ProcessingStrategy> = Arc::new(StreamStrategy::new(tx));
                strategies.push(strategy);
                topic_streams.push(MessageStream {
                    thread: ConsumerThreadId {
                        consumer: self.config.consumer_id.clone(),
                        index,
                    },
                    messages: rx,
                });
            }

            subscriptions.push(Subscription {
                assigner,
                strategies,
            });
            streams.insert(topic.clone(), topic_streams);
        }

        self.start(subscriptions).await?;
        Ok(streams)
    }

    /// Start consuming `topics`, processing every message with `strategy`.
    pub async fn start_with_strategy(
        &mut self,
        topics: &HashMap<String, usize>,
        strategy: Arc<dyn ProcessingStrategy>,
    ) -> Result<(), ConsumerError> {
        let mut subscriptions = Vec::with_capacity(topics.len());
        for (topic, threads) in topics {
            let assigner = self.assigner(topic, *threads)?;
            subscriptions.push(Subscription {
                strategies: vec![strategy.clone(); assigner.threads()],
                assigner,
            });
        }

        self.start(subscriptions).await
    }

    /// Resolves once the consumer was asked to shut down, by `close` or by a
    /// failure policy.
    pub async fn wait_for_shutdown(&self) {
        let mut shutdown = self.shutdown.subscribe();
        signalled(&mut shutdown).await;
    }

    /// Stop every partition, deregister from the coordinator, and report the
    /// commits that failed on the way.
    pub async fn close(mut self) -> Result<(), ConsumerError> {
        info!(
            group = self.config.group_id,
            consumer = self.config.consumer_id,
            "closing consumer"
        );
        self.shutdown.send_replace(true);

        let stopped = match self.rebalancer.take() {
            Some(rebalancer) => match rebalancer.await {
                Ok(stopped) => stopped,
                Err(error) => {
                    error!("rebalance loop panicked: {}", error);
                    Err(ConsumerError::Terminated)
                }
            },
            None => Ok(()),
        };

        if self.registered {
            let deregistered = self
                .coordinator
                .deregister_consumer(&self.config.group_id, &self.config.consumer_id)
                .await;
            if let Err(error) = deregistered {
                warn!("failed to deregister consumer: {}", error);
                if stopped.is_ok() {
                    return Err(error.into());
                }
            }
        }

        if let Err(ConsumerError::CommitError(errors)) = &stopped {
            for error in errors {
                error!("{}", error);
            }
        }
        stopped
    }

    fn assigner(&self, topic: &str, threads: usize) -> Result<PartitionAssigner, ConsumerError> {
        let threads =
            NonZeroUsize::new(threads).ok_or_else(|| ConsumerError::NoThreads(topic.to_owned()))?;
        Ok(PartitionAssigner::new(&self.config.consumer_id, topic, threads))
    }

    async fn start(&mut self, subscriptions: Vec<Subscription>) -> Result<(), ConsumerError> {
        if self.registered {
            return Err(ConsumerError::AlreadyStarted);
        }

        let topics: Vec<String> = subscriptions
            .iter()
            .map(|subscription| subscription.assigner.topic().to_owned())
            .collect();
        self.coordinator
            .register_consumer(&self.config.group_id, &self.config.consumer_id, &topics)
            .await?;
        self.registered = true;
        info!(
            group = self.config.group_id,
            consumer = self.config.consumer_id,
            ?topics,
            "registered consumer"
        );

        let mut rebalances = self.coordinator.rebalances(&self.config.group_id);
        let generation = *rebalances.borrow_and_update();

        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let context = Arc::new(ConsumerContext {
            config: self.config.clone(),
            coordinator: self.coordinator.clone(),
            fetcher: self.fetcher.clone(),
            offset_storage: self.offset_storage.clone(),
            failure_policy: self.failure_policy.clone(),
            liveness: self.liveness.clone(),
            shutdown: self.shutdown.subscribe(),
            faults: faults_tx,
        });

        let mut rebalancer = Rebalancer {
            context,
            subscriptions,
            running: Vec::new(),
            errors: Vec::new(),
            shutdown: self.shutdown.clone(),
        };
        if let Err(error) = rebalancer.assign(generation).await {
            rebalancer.stop_all().await;
            return Err(error);
        }

        self.rebalancer = Some(tokio::spawn(rebalancer.run(rebalances, faults_rx)));
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Owns the partition consumers of the current assignment, and replaces them
/// every time the group rebalances.
struct Rebalancer {
    context: Arc<ConsumerContext>,
    subscriptions: Vec<Subscription>,
    running: Vec<PartitionConsumer>,
    errors: Vec<WorkerManagerError>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Rebalancer {
    async fn run(
        mut self,
        mut rebalances: watch::Receiver<u64>,
        mut faults: mpsc::UnboundedReceiver<PoolFault>,
    ) -> Result<(), ConsumerError> {
        let mut shutdown = self.context.shutdown.clone();
        let mut coordinator_alive = true;
        // Set while an assignment failed and must be taken over again.
        let mut retry: Option<(u64, Instant)> = None;

        loop {
            let retry_at = retry.map_or_else(Instant::now, |(_, at)| at);
            tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => break,
                Some(fault) = faults.recv() => self.handle_fault(fault),
                changed = rebalances.changed(), if coordinator_alive => match changed {
                    Ok(()) => {
                        let generation = *rebalances.borrow_and_update();
                        self.stop_all().await;
                        retry = self.reassign(generation).await;
                    }
                    Err(_) => {
                        warn!("coordinator stopped publishing rebalances, keeping the current assignment");
                        coordinator_alive = false;
                    }
                },
                _ = tokio::time::sleep_until(retry_at), if retry.is_some() => {
                    if let Some((generation, _)) = retry {
                        retry = self.reassign(generation).await;
                    }
                }
            }
        }

        self.stop_all().await;
        match self.errors.is_empty() {
            true => Ok(()),
            false => Err(ConsumerError::CommitError(self.errors)),
        }
    }

    /// Take over the assignment of `generation`. On failure the partial
    /// assignment is stopped, and the deadline of the next attempt returned.
    async fn reassign(&mut self, generation: u64) -> Option<(u64, Instant)> {
        let error = match self.assign(generation).await {
            Ok(()) => return None,
            Err(error) => error,
        };

        let backoff = self.context.config.fetch.fetch_backoff.0;
        metrics::counter!("consumer_assign_failures_total").increment(1);
        error!(
            generation,
            retry_in_ms = backoff.as_millis() as u64,
            "failed to take over the new assignment: {}",
            error
        );
        self.stop_all().await;
        Some((generation, Instant::now() + backoff))
    }

    /// Start a partition consumer for every partition this consumer owns now.
    async fn assign(&mut self, generation: u64) -> Result<(), ConsumerError> {
        let context = &self.context;
        for subscription in &self.subscriptions {
            let topic = subscription.assigner.topic();
            let owned = context
                .coordinator
                .owned_partitions(&context.config.group_id, &context.config.consumer_id, topic)
                .await?;
            info!(generation, topic, ?owned, "assigning partitions");

            for assignment in subscription.assigner.assign(&owned) {
                let strategy = &subscription.strategies[assignment.thread.index];
                for partition in assignment.partitions {
                    self.running.push(PartitionConsumer::start(
                        context,
                        partition,
                        &assignment.thread,
                        strategy.clone(),
                    ));
                }
            }
        }

        metrics::gauge!("consumer_assigned_partitions").set(self.running.len() as f64);
        Ok(())
    }

    /// Stop every running partition consumer, and wait until all of them committed.
    async fn stop_all(&mut self) {
        if self.running.is_empty() {
            return;
        }
        info!(partitions = self.running.len(), "stopping partition consumers");

        let stopping = self.running.drain(..).map(PartitionConsumer::stop);
        for stopped in join_all(stopping).await {
            if let Err(error) = stopped {
                self.errors.push(error);
            }
        }
        metrics::gauge!("consumer_assigned_partitions").set(0.0);
    }

    fn handle_fault(&self, fault: PoolFault) {
        match fault.action {
            FailureAction::Continue => {
                debug!(partition = %fault.partition, "pool keeps going after a failure streak")
            }
            FailureAction::StopPool => warn!(
                partition = %fault.partition,
                "pool stopped after a failure streak, partition is idle until the next rebalance"
            ),
            FailureAction::ShutdownConsumer => {
                error!(
                    partition = %fault.partition,
                    "pool failed too often, shutting down the consumer"
                );
                self.shutdown.send_replace(true);
            }
        }
    }
}

/// The fetch loop and worker pool of one assigned partition.
struct PartitionConsumer {
    pool: Arc<WorkerManagerHandle>,
    fetch_stop: watch::Sender<bool>,
    fetch_loop: JoinHandle<()>,
    liveness: HealthHandle,
}

impl PartitionConsumer {
    fn start(
        context: &Arc<ConsumerContext>,
        partition: TopicAndPartition,
        thread: &ConsumerThreadId,
        strategy: Arc<dyn ProcessingStrategy>,
    ) -> Self {
        let id = format!(
            "{}-{}-{}",
            context.config.consumer_id,
            partition.topic(),
            partition.partition()
        );
        let liveness = context.liveness.register(
            format!("pool-{}-{}", partition.topic(), partition.partition()),
            POOL_LIVENESS_DEADLINE,
        );
        info!(thread = %thread, %partition, pool = id, "starting partition consumer");

        let pool = WorkerManager::new(
            &id,
            WorkerManagerConfig {
                pool: context.config.pool,
                strategy,
                offset_storage: context.offset_storage.clone(),
                failure_policy: context.failure_policy.clone(),
                input_queue_batches: context.config.fetch.input_queue_batches,
                faults: Some(context.faults.clone()),
            },
            partition,
            liveness.clone(),
            context.shutdown.clone(),
        );
        let pool = Arc::new(pool.start());

        let (fetch_stop, fetch_stop_rx) = watch::channel(false);
        let fetch_loop = tokio::spawn(fetch_loop(context.clone(), pool.clone(), fetch_stop_rx));

        Self {
            pool,
            fetch_stop,
            fetch_loop,
            liveness,
        }
    }

    /// Stop fetching first, so that the pool commits an offset nothing is
    /// dispatched beyond.
    async fn stop(self) -> Result<StopOutcome, WorkerManagerError> {
        self.fetch_stop.send_replace(true);
        if let Err(error) = self.fetch_loop.await {
            error!(partition = %self.pool.partition(), "fetch loop panicked: {}", error);
        }

        let stopped = self.pool.stop().await;
        self.liveness.deregister();
        stopped
    }
}

/// Read `pool`'s partition from the log and hand it over batch by batch,
/// until told to stop or until the pool stops accepting batches.
async fn fetch_loop(
    context: Arc<ConsumerContext>,
    pool: Arc<WorkerManagerHandle>,
    mut stop: watch::Receiver<bool>,
) {
    let partition = pool.partition().clone();
    let fetch = context.config.fetch;
    let labels = [
        ("topic", partition.topic().to_owned()),
        ("partition", partition.partition().to_string()),
    ];

    let mut offset = loop {
        let found = tokio::select! {
            _ = signalled(&mut stop) => return,
            found = start_offset(&context, &partition) => found,
        };
        match found {
            Ok(offset) => break offset,
            Err(error) => {
                metrics::counter!("consumer_start_offset_failures_total", &labels).increment(1);
                warn!(%partition, "failed to find where to start fetching, retrying: {}", error);
            }
        }
        tokio::select! {
            _ = signalled(&mut stop) => return,
            _ = tokio::time::sleep(fetch.fetch_backoff.0) => {}
        }
    };
    info!(%partition, offset, "starting fetch loop");

    loop {
        let fetched = tokio::select! {
            _ = signalled(&mut stop) => break,
            fetched = context.fetcher.fetch(&partition, offset, fetch.fetch_batch_size.get()) => fetched,
        };

        let backoff = match fetched {
            Ok(batch) if batch.is_empty() => true,
            Ok(batch) => {
                let next = batch.last().map_or(offset, |message| message.offset + 1);
                metrics::counter!("consumer_fetched_messages_total", &labels)
                    .increment(batch.len() as u64);

                tokio::select! {
                    _ = signalled(&mut stop) => break,
                    sent = pool.send_batch(batch) => if sent.is_err() {
                        info!(%partition, "pool stopped accepting batches, ending fetch loop");
                        break;
                    },
                }
                offset = next;
                false
            }
            Err(FetchError::OffsetOutOfRange { .. }) => match reset_offset(&context, &partition).await {
                Ok(reset) => {
                    warn!(%partition, from = offset, to = reset, "offset out of range, resetting");
                    offset = reset;
                    false
                }
                Err(error) => {
                    warn!(%partition, "failed to reset an out of range offset: {}", error);
                    true
                }
            },
            Err(error) => {
                warn!(%partition, offset, "fetch failed: {}", error);
                true
            }
        };

        if backoff {
            tokio::select! {
                _ = signalled(&mut stop) => break,
                _ = tokio::time::sleep(fetch.fetch_backoff.0) => {}
            }
        }
    }

    debug!(%partition, offset, "fetch loop stopped");
}

/// Right after the last committed offset, or wherever the reset policy says
/// when nothing was committed yet.
async fn start_offset(
    context: &ConsumerContext,
    partition: &TopicAndPartition,
) -> Result<i64, ConsumerError> {
    match context.offset_storage.fetch_last(partition).await? {
        Some(committed) => Ok(committed + 1),
        None => reset_offset(context, partition).await,
    }
}

async fn reset_offset(
    context: &ConsumerContext,
    partition: &TopicAndPartition,
) -> Result<i64, ConsumerError> {
    let (low, high) = context.fetcher.watermarks(partition).await?;
    Ok(match context.config.fetch.auto_offset_reset {
        OffsetReset::Smallest => low,
        OffsetReset::Largest => high,
    })
}
