//! Retry tracking and flakiness detection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// Tracks attempts per test and decides which failures get another run.
///
/// Keyed by test identity id, so attempts of the same test accumulate
/// no matter which batch or host ran them.
#[derive(Clone)]
pub struct RetryManager {
    max_attempts: usize,
    /// Per test: (attempts, successes).
    attempts: Arc<Mutex<HashMap<Uuid, (usize, usize)>>>,
}

impl RetryManager {
    /// Creates a retry manager.
    ///
    /// `max_attempts` counts the initial run, so `1` disables retries.
    /// Values below 1 are clamped to 1.
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether the test has attempts left.
    pub fn should_retry(&self, id: Uuid) -> bool {
        let attempts = self.attempts.lock().unwrap();
        let (count, _) = attempts.get(&id).copied().unwrap_or((0, 0));
        count < self.max_attempts
    }

    /// Records one attempt and whether it passed.
    pub fn record_attempt(&self, id: Uuid, success: bool) {
        let mut attempts = self.attempts.lock().unwrap();
        let entry = attempts.entry(id).or_insert((0, 0));
        entry.0 += 1;
        if success {
            entry.1 += 1;
        }
    }

    /// Whether the test both failed and passed across its attempts.
    pub fn is_flaky(&self, id: Uuid) -> bool {
        let attempts = self.attempts.lock().unwrap();
        attempts
            .get(&id)
            .is_some_and(|(count, successes)| is_mixed(*count, *successes))
    }

    /// Ids of every test with mixed outcomes.
    pub fn flaky_tests(&self) -> Vec<Uuid> {
        let attempts = self.attempts.lock().unwrap();
        attempts
            .iter()
            .filter(|(_, (count, successes))| is_mixed(*count, *successes))
            .map(|(id, _)| *id)
            .collect()
    }
}

fn is_mixed(count: usize, successes: usize) -> bool {
    count > 1 && successes > 0 && successes < count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_run_out_at_the_limit() {
        let manager = RetryManager::new(3);
        let id = Uuid::new_v4();

        assert!(manager.should_retry(id));
        manager.record_attempt(id, false);
        assert!(manager.should_retry(id));
        manager.record_attempt(id, false);
        assert!(manager.should_retry(id));
        manager.record_attempt(id, false);
        assert!(!manager.should_retry(id));
    }

    #[test]
    fn single_attempt_budget_disables_retries() {
        let manager = RetryManager::new(1);
        let id = Uuid::new_v4();

        manager.record_attempt(id, false);
        assert!(!manager.should_retry(id));
    }

    #[test]
    fn failed_then_passed_is_flaky() {
        let manager = RetryManager::new(3);
        let id = Uuid::new_v4();

        manager.record_attempt(id, false);
        manager.record_attempt(id, true);

        assert!(manager.is_flaky(id));
    }

    #[test]
    fn always_passing_is_not_flaky() {
        let manager = RetryManager::new(3);
        let id = Uuid::new_v4();

        manager.record_attempt(id, true);
        manager.record_attempt(id, true);

        assert!(!manager.is_flaky(id));
    }

    #[test]
    fn always_failing_is_not_flaky() {
        let manager = RetryManager::new(3);
        let id = Uuid::new_v4();

        manager.record_attempt(id, false);
        manager.record_attempt(id, false);

        assert!(!manager.is_flaky(id));
    }

    #[test]
    fn flaky_listing_only_includes_mixed_outcomes() {
        let manager = RetryManager::new(3);
        let flaky_id = Uuid::new_v4();
        let stable_id = Uuid::new_v4();
        let broken_id = Uuid::new_v4();

        manager.record_attempt(flaky_id, false);
        manager.record_attempt(flaky_id, true);
        manager.record_attempt(stable_id, true);
        manager.record_attempt(broken_id, false);
        manager.record_attempt(broken_id, false);

        assert_eq!(manager.flaky_tests(), vec![flaky_id]);
    }
}
