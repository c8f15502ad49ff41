use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

/// Enumeration of errors returned by a `Coordinator`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("consumer {consumer_id} is not registered in group {group}")]
    NotRegistered { group: String, consumer_id: String },
    #[error("the coordination service is unavailable: {0}")]
    Unavailable(String),
}

/// The coordination service that tracks group membership and decides which
/// partitions each consumer of a group owns.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn register_consumer(
        &self,
        group: &str,
        consumer_id: &str,
        topics: &[String],
    ) -> Result<(), CoordinatorError>;

    async fn deregister_consumer(&self, group: &str, consumer_id: &str)
        -> Result<(), CoordinatorError>;

    /// Partitions of `topic` currently owned by `consumer_id`.
    async fn owned_partitions(
        &self,
        group: &str,
        consumer_id: &str,
        topic: &str,
    ) -> Result<Vec<i32>, CoordinatorError>;

    /// A receiver whose value changes every time the group rebalances.
    fn rebalances(&self, group: &str) -> watch::Receiver<u64>;
}

/// A `Coordinator` for a single consumer that owns whatever partitions it was
/// told to own. Changing the ownership triggers a rebalance.
pub struct InMemoryCoordinator {
    ownership: Mutex<HashMap<String, Vec<i32>>>,
    members: Mutex<HashSet<(String, String)>>,
    generation: watch::Sender<u64>,
    unavailable: AtomicBool,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            ownership: Mutex::new(HashMap::new()),
            members: Mutex::new(HashSet::new()),
            generation,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Own `partitions` of `topic` from now on, and signal a rebalance.
    pub fn set_partitions(&self, topic: &str, partitions: Vec<i32>) {
        info!(topic, ?partitions, "partition ownership changed");
        self.ownership
            .lock()
            .expect("poisoned coordinator mutex")
            .insert(topic.to_owned(), partitions);
        self.generation.send_modify(|generation| *generation += 1);
    }

    /// Make ownership lookups fail until made available again.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn is_registered(&self, group: &str, consumer_id: &str) -> bool {
        self.members
            .lock()
            .expect("poisoned coordinator mutex")
            .contains(&(group.to_owned(), consumer_id.to_owned()))
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn register_consumer(
        &self,
        group: &str,
        consumer_id: &str,
        topics: &[String],
    ) -> Result<(), CoordinatorError> {
        info!(group, consumer_id, ?topics, "registering consumer");
        self.members
            .lock()
            .map_err(|_| CoordinatorError::Unavailable("poisoned coordinator mutex".to_owned()))?
            .insert((group.to_owned(), consumer_id.to_owned()));
        Ok(())
    }

    async fn deregister_consumer(
        &self,
        group: &str,
        consumer_id: &str,
    ) -> Result<(), CoordinatorError> {
        let removed = self
            .members
            .lock()
            .map_err(|_| CoordinatorError::Unavailable("poisoned coordinator mutex".to_owned()))?
            .remove(&(group.to_owned(), consumer_id.to_owned()));

        match removed {
            true => Ok(()),
            false => Err(CoordinatorError::NotRegistered {
                group: group.to_owned(),
                consumer_id: consumer_id.to_owned(),
            }),
        }
    }

    async fn owned_partitions(
        &self,
        group: &str,
        consumer_id: &str,
        topic: &str,
    ) -> Result<Vec<i32>, CoordinatorError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Unavailable(
                "ownership lookups are disabled".to_owned(),
            ));
        }
        if !self.is_registered(group, consumer_id) {
            return Err(CoordinatorError::NotRegistered {
                group: group.to_owned(),
                consumer_id: consumer_id.to_owned(),
            });
        }

        let ownership = self
            .ownership
            .lock()
            .map_err(|_| CoordinatorError::Unavailable("poisoned coordinator mutex".to_owned()))?;
        Ok(ownership.get(topic).cloned().unwrap_or_default())
    }

    fn rebalances(&self, _group: &str) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ownership_requires_registration() {
        let coordinator = InMemoryCoordinator::new();
        coordinator.set_partitions("events", vec![0, 1, 2]);

        let error = coordinator
            .owned_partitions("group", "consumer", "events")
            .await
            .unwrap_err();
        assert!(matches!(error, CoordinatorError::NotRegistered { .. }));

        coordinator
            .register_consumer("group", "consumer", &["events".to_owned()])
            .await
            .unwrap();
        assert_eq!(
            coordinator
                .owned_partitions("group", "consumer", "events")
                .await
                .unwrap(),
            vec![0, 1, 2]
        );
        assert!(coordinator
            .owned_partitions("group", "consumer", "logs")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn ownership_changes_signal_a_rebalance() {
        let coordinator = InMemoryCoordinator::new();
        let mut rebalances = coordinator.rebalances("group");
        assert!(!rebalances.has_changed().unwrap());

        coordinator.set_partitions("events", vec![0]);

        assert!(rebalances.has_changed().unwrap());
        assert_eq!(*rebalances.borrow_and_update(), 1);
        assert_eq!(coordinator.generation(), 1);
    }

    #[tokio::test]
    async fn deregistering_twice_fails() {
        let coordinator = InMemoryCoordinator::new();
        coordinator
            .register_consumer("group", "consumer", &[])
            .await
            .unwrap();

        coordinator
            .deregister_consumer("group", "consumer")
            .await
            .unwrap();
        assert!(coordinator
            .deregister_consumer("group", "consumer")
            .await
            .is_err());
    }
}
