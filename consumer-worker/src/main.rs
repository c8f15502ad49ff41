//! Consume an in-memory log with per-partition worker pools, logging every message.
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use envconfig::Envconfig;
use eyre::Result;
use tracing::{error, info};

use consumer_common::coordinator::InMemoryCoordinator;
use consumer_common::fetch::InMemoryLog;
use consumer_common::metrics::{serve, setup_metrics_recorder, setup_metrics_router};
use consumer_common::offsets::InMemoryOffsetStorage;
use consumer_common::types::Message;
use consumer_worker::config::Config;
use consumer_worker::consumer::{Consumer, ConsumerConfig};
use consumer_worker::strategy::FnStrategy;
use consumer_worker::task::{TaskId, TaskResult};
use consumer_worker::worker::WorkerHandle;
use health::HealthRegistry;

fn log_message(worker: &WorkerHandle, message: &Message, id: TaskId) -> TaskResult {
    info!(
        worker = %worker,
        topic = message.topic.as_str(),
        partition = message.partition,
        offset = message.offset,
        bytes = message.payload.len(),
        "processed message"
    );
    TaskResult::Successful(id)
}

async fn produce_loop(log: Arc<InMemoryLog>, topics: Vec<String>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    let mut sequence: u64 = 0;

    loop {
        interval.tick().await;
        for topic in &topics {
            if let Err(e) = log.produce(topic, format!("message {}", sequence)) {
                error!("failed to produce to {}: {}", topic, e);
            }
        }
        sequence += 1;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env()?;
    let topics = config.topics.to_map();

    let liveness = HealthRegistry::new("liveness");
    let recorder_handle = setup_metrics_recorder()?;
    let status = liveness.clone();
    let router = setup_metrics_router(recorder_handle).route(
        "/_liveness",
        get(move || std::future::ready(status.get_status())),
    );
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics and liveness on {}: {}", bind, e);
        }
    });

    let log = Arc::new(InMemoryLog::new());
    let coordinator = Arc::new(InMemoryCoordinator::new());
    for topic in topics.keys() {
        log.create_topic(topic, config.partitions);
        coordinator.set_partitions(topic, (0..config.partitions).collect());
    }

    let mut consumer = Consumer::new(
        ConsumerConfig::from(&config),
        coordinator,
        log.clone(),
        Arc::new(InMemoryOffsetStorage::new()),
        liveness,
    );
    consumer
        .start_with_strategy(&topics, Arc::new(FnStrategy(log_message)))
        .await?;

    let producer = tokio::spawn(produce_loop(
        log,
        topics.keys().cloned().collect(),
        config.produce_interval.0,
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received ctrl-c, shutting down"),
        _ = consumer.wait_for_shutdown() => info!("consumer is shutting down on its own"),
    }

    producer.abort();
    consumer.close().await?;

    Ok(())
}
