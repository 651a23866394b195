//! Test scheduling and distribution.
//!
//! The scheduler creates batches of tests that can be executed
//! independently. It knows nothing about the actual hosts, only the
//! configured parallelism level.

use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::framework::TestCase;

/// Distributes tests across parallel hosts.
pub struct Scheduler {
    max_parallel: usize,
}

impl Scheduler {
    /// Creates a scheduler. Values below 1 are clamped to 1.
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }

    /// Schedules tests into batches using round-robin distribution.
    ///
    /// Tests are distributed evenly across up to `max_parallel` batches.
    /// Each batch runs sequentially on one host; empty batches are
    /// removed.
    ///
    /// # Example
    ///
    /// ```
    /// use volley::framework::{TestCase, TestIdentity};
    /// use volley::runner::Scheduler;
    ///
    /// let scheduler = Scheduler::new(2);
    /// let tests: Vec<TestCase> = ["a", "b", "c", "d"]
    ///     .iter()
    ///     .map(|name| TestCase::new(TestIdentity::new(*name, "suite", "executor://volley-shell/v1")))
    ///     .collect();
    ///
    /// let batches = scheduler.schedule(&tests);
    /// assert_eq!(batches.len(), 2);
    /// assert_eq!(batches[0].len(), 2);
    /// ```
    pub fn schedule(&self, tests: &[TestCase]) -> Vec<Vec<TestCase>> {
        if tests.is_empty() {
            return Vec::new();
        }

        let mut batches: Vec<Vec<TestCase>> = (0..self.max_parallel).map(|_| Vec::new()).collect();

        for (i, test) in tests.iter().enumerate() {
            batches[i % self.max_parallel].push(test.clone());
        }

        batches.retain(|b| !b.is_empty());
        batches
    }

    /// Schedules tests with random distribution.
    ///
    /// Shuffles tests before the round-robin split. Slow tests that
    /// cluster in discovery order get spread across hosts instead of
    /// serializing on one.
    pub fn schedule_random(&self, tests: &[TestCase]) -> Vec<Vec<TestCase>> {
        let mut shuffled = tests.to_vec();
        shuffled.shuffle(&mut thread_rng());
        self.schedule(&shuffled)
    }
}
