use std::collections::HashMap;
use std::num::{NonZeroU32, NonZeroUsize};
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::worker_manager::FailureAction;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "consumer-group")]
    pub group_id: NonEmptyString,

    #[envconfig(default = "consumer")]
    pub consumer_id: NonEmptyString,

    #[envconfig(default = "events:1")]
    pub topics: TopicThreads,

    /// Partitions of each topic in the in-memory log the binary consumes.
    #[envconfig(default = "3")]
    pub partitions: i32,

    /// How often the binary appends a message to each topic.
    #[envconfig(default = "1000")]
    pub produce_interval: EnvMsDuration,

    #[envconfig(nested = true)]
    pub pool: PoolConfig,

    #[envconfig(nested = true)]
    pub fetch: FetchConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Settings of every partition pool.
#[derive(Envconfig, Clone, Copy, Debug)]
pub struct PoolConfig {
    #[envconfig(default = "10")]
    pub num_workers: NonZeroUsize,

    #[envconfig(default = "60000")]
    pub task_timeout: EnvMsDuration,

    #[envconfig(default = "10")]
    pub failure_threshold: NonZeroU32,

    #[envconfig(default = "60000")]
    pub failure_window: EnvMsDuration,

    #[envconfig(default = "stop_pool")]
    pub failure_action: FailureAction,
}

#[derive(Envconfig, Clone, Copy, Debug)]
pub struct FetchConfig {
    #[envconfig(default = "100")]
    pub fetch_batch_size: NonZeroUsize,

    #[envconfig(default = "100")]
    pub fetch_backoff: EnvMsDuration,

    #[envconfig(default = "2")]
    pub input_queue_batches: NonZeroUsize,

    #[envconfig(default = "smallest")]
    pub auto_offset_reset: OffsetReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Where to start reading a partition nobody committed an offset for yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    /// The oldest message still in the log.
    Smallest,
    /// Only messages appended from now on.
    Largest,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseOffsetResetError(String);

impl FromStr for OffsetReset {
    type Err = ParseOffsetResetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "smallest" => Ok(OffsetReset::Smallest),
            "largest" => Ok(OffsetReset::Largest),
            invalid => Err(ParseOffsetResetError(invalid.to_owned())),
        }
    }
}

/// Consumer threads requested per topic, as `topic:threads[,topic:threads...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicThreads(pub Vec<(String, NonZeroUsize)>);

impl TopicThreads {
    pub fn to_map(&self) -> HashMap<String, usize> {
        self.0
            .iter()
            .map(|(topic, threads)| (topic.clone(), threads.get()))
            .collect()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseTopicThreadsError(String);

impl FromStr for TopicThreads {
    type Err = ParseTopicThreadsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut topics = Vec::new();

        for entry in s.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (topic, threads) = entry
                .split_once(':')
                .ok_or_else(|| ParseTopicThreadsError(entry.to_owned()))?;
            let topic = topic.trim();
            if topic.is_empty() {
                return Err(ParseTopicThreadsError(entry.to_owned()));
            }
            let threads = threads
                .trim()
                .parse::<NonZeroUsize>()
                .map_err(|_| ParseTopicThreadsError(entry.to_owned()))?;
            topics.push((topic.to_owned(), threads));
        }

        if topics.is_empty() {
            return Err(ParseTopicThreadsError(s.to_owned()));
        }

        Ok(TopicThreads(topics))
    }
}
