use std::fmt;
use std::num::NonZeroUsize;

use consumer_common::types::TopicAndPartition;

/// One consumer thread slot of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerThreadId {
    pub consumer: String,
    pub index: usize,
}

impl fmt::Display for ConsumerThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.consumer, self.index)
    }
}

/// The partitions a thread slot consumes. May be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadAssignment {
    pub thread: ConsumerThreadId,
    pub partitions: Vec<TopicAndPartition>,
}

/// Spreads the partitions a consumer owns on a topic over a fixed number of
/// thread slots.
///
/// Partitions are sorted and dealt round-robin, so the same input always
/// gives the same assignment. Every slot is present in the output: with more
/// slots than partitions, the surplus slots get nothing.
#[derive(Debug, Clone)]
pub struct PartitionAssigner {
    consumer_id: String,
    topic: String,
    threads: NonZeroUsize,
}

impl PartitionAssigner {
    pub fn new(consumer_id: &str, topic: &str, threads: NonZeroUsize) -> Self {
        Self {
            consumer_id: consumer_id.to_owned(),
            topic: topic.to_owned(),
            threads,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn threads(&self) -> usize {
        self.threads.get()
    }

    pub fn assign(&self, owned: &[i32]) -> Vec<ThreadAssignment> {
        let mut partitions = owned.to_vec();
        partitions.sort_unstable();
        partitions.dedup();

        let mut assignments: Vec<ThreadAssignment> = (0..self.threads.get())
            .map(|index| ThreadAssignment {
                thread: ConsumerThreadId {
                    consumer: self.consumer_id.clone(),
                    index,
                },
                partitions: Vec::new(),
            })
            .collect();

        for (position, partition) in partitions.into_iter().enumerate() {
            assignments[position % self.threads.get()]
                .partitions
                .push(TopicAndPartition::new(&self.topic, partition));
        }

        assignments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn assigner(threads: usize) -> PartitionAssigner {
        PartitionAssigner::new("consumer-1", "events", NonZeroUsize::new(threads).unwrap())
    }

    fn partition_numbers(assignment: &ThreadAssignment) -> Vec<i32> {
        assignment
            .partitions
            .iter()
            .map(TopicAndPartition::partition)
            .collect()
    }

    #[test]
    fn surplus_threads_get_nothing() {
        let assignments = assigner(4).assign(&[0, 1, 2]);

        assert_eq!(assignments.len(), 4);
        let empty = assignments.iter().filter(|a| a.partitions.is_empty()).count();
        assert_eq!(empty, 1);
        assert!(assignments
            .iter()
            .all(|assignment| assignment.partitions.len() <= 1));
    }

    #[test]
    fn every_partition_is_assigned_exactly_once() {
        let assignments = assigner(2).assign(&[2, 0, 1]);

        assert_eq!(assignments.len(), 2);
        assert!(assignments.iter().all(|a| !a.partitions.is_empty()));

        let mut seen = HashSet::new();
        for assignment in &assignments {
            for partition in &assignment.partitions {
                assert!(seen.insert(partition.clone()), "{} assigned twice", partition);
            }
        }
        assert_eq!(seen.len(), 3);

        assert_eq!(partition_numbers(&assignments[0]), vec![0, 2]);
        assert_eq!(partition_numbers(&assignments[1]), vec![1]);
    }

    #[test]
    fn assignment_is_deterministic() {
        let assigner = assigner(3);

        let first = assigner.assign(&[5, 3, 1, 4, 2, 0]);
        let second = assigner.assign(&[0, 1, 2, 3, 4, 5]);
        assert_eq!(first, second);

        // Duplicates from the coordinator are consumed once.
        let duplicated = assigner.assign(&[0, 0, 1, 2, 3, 4, 5, 5]);
        assert_eq!(first, duplicated);
    }

    #[test]
    fn nothing_owned_leaves_every_slot_empty() {
        let assignments = assigner(2).assign(&[]);

        assert_eq!(assignments.len(), 2);
        assert!(assignments.iter().all(|a| a.partitions.is_empty()));
        assert_eq!(assignments[1].thread.to_string(), "consumer-1-1");
    }
}
