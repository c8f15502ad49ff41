use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Answers "has processing failed too often, too recently?".
///
/// Every call to `failed` records one failure at the current instant and
/// checks whether at least `threshold` failures fall inside the `window`
/// ending now. Failures older than the window are pruned on every call, and
/// at most `threshold` timestamps are ever kept, since older ones can no
/// longer change the answer.
///
/// A zero threshold cannot be expressed: configuration rejects it.
pub struct FailureCounter {
    threshold: NonZeroU32,
    window: Duration,
    failures: Mutex<VecDeque<Instant>>,
}

impl FailureCounter {
    pub fn new(threshold: NonZeroU32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            failures: Mutex::new(VecDeque::with_capacity(threshold.get() as usize)),
        }
    }

    /// Record a failure and return whether the threshold is reached.
    pub fn failed(&self) -> bool {
        self.failed_at(Instant::now())
    }

    fn failed_at(&self, now: Instant) -> bool {
        let threshold = self.threshold.get() as usize;
        // Record and evaluate under one lock.
        let mut failures = match self.failures.lock() {
            Ok(failures) => failures,
            Err(poisoned) => poisoned.into_inner(),
        };

        failures.push_back(now);
        while let Some(oldest) = failures.front() {
            let expired = now.saturating_duration_since(*oldest) >= self.window;
            if expired || failures.len() > threshold {
                failures.pop_front();
            } else {
                break;
            }
        }

        failures.len() >= threshold
    }

    pub fn threshold(&self) -> NonZeroU32 {
        self.threshold
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn counter(threshold: u32, window: Duration) -> FailureCounter {
        FailureCounter::new(NonZeroU32::new(threshold).unwrap(), window)
    }

    #[test]
    fn test_trips_when_threshold_is_reached() {
        let counter = counter(5, Duration::from_secs(2));

        for _ in 0..4 {
            assert!(!counter.failed());
        }
        assert!(counter.failed());
        // Still over the threshold while the failures stay in the window.
        assert!(counter.failed());
    }

    #[test]
    fn test_failures_expire_after_the_window() {
        let window = Duration::from_millis(200);
        let counter = counter(5, window);

        let mut failed = false;
        for _ in 0..4 {
            failed = failed || counter.failed();
        }
        std::thread::sleep(window + Duration::from_millis(100));
        failed = failed || counter.failed();

        assert!(!failed);
    }

    #[test]
    fn test_window_rolls_with_each_call() {
        let window = Duration::from_secs(10);
        let counter = counter(3, window);
        let start = Instant::now();

        assert!(!counter.failed_at(start));
        assert!(!counter.failed_at(start + Duration::from_secs(6)));
        // The first failure falls out exactly at the window boundary.
        assert!(!counter.failed_at(start + Duration::from_secs(10)));
        // Three failures within the 10s ending at 12s.
        assert!(counter.failed_at(start + Duration::from_secs(12)));
        assert!(!counter.failed_at(start + Duration::from_secs(30)));
    }

    #[test]
    fn test_keeps_at_most_threshold_timestamps() {
        let counter = counter(2, Duration::from_secs(60));
        for _ in 0..100 {
            counter.failed();
        }

        assert_eq!(counter.failures.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_failures_are_all_counted() {
        let counter = Arc::new(counter(40, Duration::from_secs(60)));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || (0..10).filter(|_| counter.failed()).count())
            })
            .collect();
        let tripped: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        // Exactly the 40th failure reaches the threshold.
        assert_eq!(tripped, 1);
    }
}
