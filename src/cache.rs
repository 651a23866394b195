//! Run result cache and aggregation engine.
//!
//! The [`TestRunCache`] sits between test execution and result reporting.
//! Worker tasks report "test started" and "test finished" events into it
//! concurrently; the cache tracks the in-progress set, buffers completed
//! results, and keeps cumulative [`RunStatistics`]. When the buffer grows
//! past the configured size, or the flush interval elapses, the cache
//! hands a consistent snapshot to the caller-supplied [`FlushSink`] and
//! clears the completed buffer.
//!
//! ```text
//!  worker tasks                  TestRunCache                 flush sink
//!  ────────────                  ────────────                 ──────────
//!  on_test_started ──┐     ┌─ in-progress identities ─┐
//!  on_new_test_result├────►│  completed result buffer │──────► sink(stats,
//!  on_test_completion┘     └─ run statistics ─────────┘             completed,
//!                                 │    ▲                            in_progress)
//!                                 ▼    │ every max_cache_age
//!                           FlushTimer task
//! ```
//!
//! # Consistency
//!
//! A single mutex guards the in-progress set, the completed buffer, and
//! the statistics, so every flush sees the three as one consistent unit.
//! The snapshot is captured (and the buffer cleared) while the lock is
//! held; the sink itself runs after the lock is released, so slow
//! downstream consumers never block other reporting tasks.
//!
//! # Delivery
//!
//! The buffer is cleared before the sink is invoked. If the sink fails,
//! the error propagates to the caller of the triggering operation and the
//! drained results are not restored: each result is handed downstream at
//! most once.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use volley::cache::TestRunCache;
//! use volley::framework::{TestIdentity, TestOutcome, TestResult};
//!
//! # fn main() -> anyhow::Result<()> {
//! let cache = TestRunCache::new(
//!     10,
//!     Duration::from_secs(5),
//!     Arc::new(|stats, completed, in_progress| {
//!         println!(
//!             "{} done, {} running, {} executed so far",
//!             completed.len(),
//!             in_progress.len(),
//!             stats.executed()
//!         );
//!         Ok(())
//!     }),
//! )?;
//!
//! let test = TestIdentity::new("tests::smoke", "tests/smoke.rs", "executor://volley-cargo/v1");
//! cache.on_test_started(&test)?;
//! cache.on_new_test_result(TestResult::new(test, TestOutcome::Passed))?;
//!
//! let remaining = cache.take_last_chunk();
//! assert_eq!(remaining.len(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::framework::{TestIdentity, TestOutcome, TestResult};

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Callback invoked when the cache flushes.
///
/// Receives a statistics snapshot, the drained completed results, and the
/// identities still in progress. Invoked synchronously outside the cache
/// lock; a returned error propagates to the caller of the operation that
/// triggered the flush.
pub type FlushSink = Arc<
    dyn Fn(RunStatistics, Vec<TestResult>, Vec<TestIdentity>) -> anyhow::Result<()> + Send + Sync,
>;

/// Errors from the run cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A mutating operation was handed an identity with a nil id.
    #[error("test identity has a nil id")]
    NilIdentity,

    /// A construction limit was zero.
    #[error("{0} must be greater than zero")]
    InvalidLimit(&'static str),

    /// The flush sink failed; the error is passed through unmodified.
    #[error(transparent)]
    Sink(#[from] anyhow::Error),
}

/// Cumulative per-outcome counts for one run.
///
/// Every outcome category is always present (zero until first recorded).
/// Counts only ever grow; there is no decrement or reset. The executed
/// total covers terminal outcomes only, so an in-progress notification
/// ([`TestOutcome::None`]) is tallied in the map without advancing it.
#[derive(Debug, Clone)]
pub struct RunStatistics {
    executed: usize,
    outcomes: BTreeMap<TestOutcome, usize>,
}

impl RunStatistics {
    /// Creates an empty accumulator with all categories present.
    pub fn new() -> Self {
        let outcomes = TestOutcome::ALL.iter().map(|o| (*o, 0)).collect();
        Self { executed: 0, outcomes }
    }

    /// Records one result. O(1).
    pub fn record(&mut self, outcome: TestOutcome) {
        *self.outcomes.entry(outcome).or_insert(0) += 1;
        if outcome.is_terminal() {
            self.executed += 1;
        }
    }

    /// Total number of executed (terminal-outcome) results.
    pub fn executed(&self) -> usize {
        self.executed
    }

    /// Count recorded for one outcome category.
    pub fn count(&self, outcome: TestOutcome) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    /// Count of passed results.
    pub fn passed(&self) -> usize {
        self.count(TestOutcome::Passed)
    }

    /// Count of failed results.
    pub fn failed(&self) -> usize {
        self.count(TestOutcome::Failed)
    }

    /// Count of skipped results.
    pub fn skipped(&self) -> usize {
        self.count(TestOutcome::Skipped)
    }

    /// Count of results for tests that never reported back.
    pub fn not_found(&self) -> usize {
        self.count(TestOutcome::NotFound)
    }
}

impl Default for RunStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} executed: {} passed, {} failed, {} skipped, {} not found",
            self.executed,
            self.passed(),
            self.failed(),
            self.skipped(),
            self.not_found()
        )
    }
}

/// State guarded by the cache mutex.
///
/// The three structures mutate together so a flush always sees a
/// consistent combined view.
struct CacheState {
    in_progress: HashMap<Uuid, TestIdentity>,
    completed: Vec<TestResult>,
    stats: RunStatistics,
    flushes: usize,
}

/// Everything one flush delivers, captured under the lock.
struct FlushPayload {
    stats: RunStatistics,
    completed: Vec<TestResult>,
    in_progress: Vec<TestIdentity>,
}

/// Thread-safe cache of in-flight and completed test results.
///
/// Exactly one cache exists per run, shared by every worker task. Cloning
/// is cheap and clones share state.
///
/// See the [module docs](self) for the flush and delivery contract.
#[derive(Clone)]
pub struct TestRunCache {
    max_size: usize,
    max_age: Duration,
    sink: FlushSink,
    state: Arc<Mutex<CacheState>>,
}

impl TestRunCache {
    /// Creates a cache that flushes when the combined in-progress and
    /// completed count reaches `max_size`, and at least every `max_age`
    /// while there is anything to report.
    ///
    /// Both limits must be non-zero.
    pub fn new(max_size: usize, max_age: Duration, sink: FlushSink) -> CacheResult<Self> {
        if max_size == 0 {
            return Err(CacheError::InvalidLimit("max_cache_size"));
        }
        if max_age.is_zero() {
            return Err(CacheError::InvalidLimit("max_cache_age"));
        }

        Ok(Self {
            max_size,
            max_age,
            sink,
            state: Arc::new(Mutex::new(CacheState {
                in_progress: HashMap::new(),
                completed: Vec::new(),
                stats: RunStatistics::new(),
                flushes: 0,
            })),
        })
    }

    /// Registers a test as in progress.
    ///
    /// Keyed by id: re-registering the same logical test (for example via
    /// a cloned identity) overwrites instead of duplicating. Rejects nil
    /// ids before touching any state.
    ///
    /// Triggers a flush if the size threshold is reached; a sink error
    /// propagates to this caller.
    pub fn on_test_started(&self, identity: &TestIdentity) -> CacheResult<()> {
        if identity.is_nil() {
            return Err(CacheError::NilIdentity);
        }

        let flush = {
            let mut state = self.state.lock().unwrap();
            state.in_progress.insert(identity.id, identity.clone());
            self.capture_if_full(&mut state)
        };
        self.deliver(flush)
    }

    /// Records a completed test result.
    ///
    /// Under one lock acquisition: appends the result to the completed
    /// buffer, updates statistics, and removes the identity from the
    /// in-progress set (by id, so a clone of the started identity matches).
    /// A result for a test that was never registered as started records
    /// normally.
    ///
    /// Rejects results whose identity has a nil id before touching any
    /// state. Triggers a flush if the size threshold is reached.
    pub fn on_new_test_result(&self, result: TestResult) -> CacheResult<()> {
        if result.identity.is_nil() {
            return Err(CacheError::NilIdentity);
        }

        let flush = {
            let mut state = self.state.lock().unwrap();
            state.stats.record(result.outcome);
            state.in_progress.remove(&result.identity.id);
            state.completed.push(result);
            self.capture_if_full(&mut state)
        };
        self.deliver(flush)
    }

    /// Marks a test as no longer in progress when only its identity is
    /// known.
    ///
    /// Returns `false` without effect when `identity` is `None`, the
    /// in-progress set is empty, or no entry matches the id. Callers do
    /// not need to pre-check membership; unrelated completions are safe.
    pub fn on_test_completion(&self, identity: Option<&TestIdentity>) -> bool {
        let Some(identity) = identity else {
            return false;
        };

        let mut state = self.state.lock().unwrap();
        if state.in_progress.is_empty() {
            return false;
        }
        state.in_progress.remove(&identity.id).is_some()
    }

    /// Drains the completed buffer for the final chunk at run end.
    ///
    /// Distinct from a flush: no sink call, no statistics change, no flush
    /// counter increment. A second call returns an empty vec.
    pub fn take_last_chunk(&self) -> Vec<TestResult> {
        let mut state = self.state.lock().unwrap();
        std::mem::take(&mut state.completed)
    }

    /// Number of tests currently registered as in progress.
    pub fn in_progress_count(&self) -> usize {
        self.state.lock().unwrap().in_progress.len()
    }

    /// Number of completed results waiting in the buffer.
    pub fn buffered_count(&self) -> usize {
        self.state.lock().unwrap().completed.len()
    }

    /// Number of sink invocations so far (size-triggered and timer).
    pub fn flush_count(&self) -> usize {
        self.state.lock().unwrap().flushes
    }

    /// Snapshot of the current statistics.
    pub fn statistics(&self) -> RunStatistics {
        self.state.lock().unwrap().stats.clone()
    }

    /// Spawns the recurring flush timer for this cache.
    ///
    /// Every `max_age`, if the completed buffer or the in-progress set is
    /// non-empty, the cache flushes exactly as on the size-triggered path.
    /// A sink error on a tick is logged and the schedule continues.
    ///
    /// The returned guard must be [`stop`](FlushTimer::stop)ped at run
    /// end; dropping it cancels the task without waiting.
    pub fn spawn_flush_timer(&self) -> FlushTimer {
        let cache = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = self.max_age;

        let handle = tokio::spawn(async move {
            // interval() fires immediately; start one period out instead.
            let start = tokio::time::Instant::now() + period;
            let mut ticks = tokio::time::interval_at(start, period);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {
                        if let Err(err) = cache.flush_if_pending() {
                            tracing::warn!("periodic flush failed: {err:#}");
                        }
                    }
                }
            }
        });

        FlushTimer { cancel, handle }
    }

    /// Timer-tick flush: snapshot and deliver if there is anything to
    /// report, otherwise skip silently.
    fn flush_if_pending(&self) -> CacheResult<bool> {
        let flush = {
            let mut state = self.state.lock().unwrap();
            if state.completed.is_empty() && state.in_progress.is_empty() {
                return Ok(false);
            }
            Some(self.capture(&mut state))
        };
        self.deliver(flush)?;
        Ok(true)
    }

    /// Captures a flush payload if the size threshold is reached.
    ///
    /// Threshold counts both in-progress and buffered entries, so a run
    /// with many slow tests still reports progress.
    fn capture_if_full(&self, state: &mut CacheState) -> Option<FlushPayload> {
        if state.in_progress.len() + state.completed.len() >= self.max_size {
            Some(self.capture(state))
        } else {
            None
        }
    }

    /// Snapshots statistics and in-progress identities, drains the
    /// completed buffer, and counts the flush. Caller holds the lock.
    fn capture(&self, state: &mut CacheState) -> FlushPayload {
        state.flushes += 1;
        FlushPayload {
            stats: state.stats.clone(),
            completed: std::mem::take(&mut state.completed),
            in_progress: state.in_progress.values().cloned().collect(),
        }
    }

    /// Invokes the sink outside the lock.
    fn deliver(&self, payload: Option<FlushPayload>) -> CacheResult<()> {
        if let Some(p) = payload {
            (self.sink)(p.stats, p.completed, p.in_progress)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TestRunCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("TestRunCache")
            .field("max_size", &self.max_size)
            .field("max_age", &self.max_age)
            .field("in_progress", &state.in_progress.len())
            .field("buffered", &state.completed.len())
            .field("flushes", &state.flushes)
            .finish()
    }
}

/// Guard for the recurring flush timer task.
///
/// [`stop`](Self::stop) cancels the schedule and waits for the task to
/// finish, so no tick can fire after it returns. Dropping the guard
/// cancels without waiting.
pub struct FlushTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl FlushTimer {
    /// Stops the timer and waits for the task to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn identity(name: &str) -> TestIdentity {
        TestIdentity::new(name, "tests/demo.rs", "executor://volley-test/v1")
    }

    fn result(identity: TestIdentity, outcome: TestOutcome) -> TestResult {
        TestResult::new(identity, outcome).with_duration(Duration::from_millis(5))
    }

    fn ok_sink() -> (FlushSink, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sink: FlushSink = Arc::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (sink, calls)
    }

    /// Sink that records every delivered payload.
    type Deliveries = Arc<Mutex<Vec<(RunStatistics, Vec<TestResult>, Vec<TestIdentity>)>>>;

    fn recording_sink() -> (FlushSink, Deliveries) {
        let deliveries: Deliveries = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&deliveries);
        let sink: FlushSink = Arc::new(move |stats, completed, in_progress| {
            log.lock().unwrap().push((stats, completed, in_progress));
            Ok(())
        });
        (sink, deliveries)
    }

    fn failing_sink() -> (FlushSink, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sink: FlushSink = Arc::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("downstream unavailable"))
        });
        (sink, calls)
    }

    fn cache(max_size: usize, sink: FlushSink) -> TestRunCache {
        TestRunCache::new(max_size, Duration::from_secs(60), sink).unwrap()
    }

    #[test]
    fn zero_limits_rejected_at_construction() {
        let (sink, _) = ok_sink();
        assert!(matches!(
            TestRunCache::new(0, Duration::from_secs(1), Arc::clone(&sink)),
            Err(CacheError::InvalidLimit("max_cache_size"))
        ));
        assert!(matches!(
            TestRunCache::new(10, Duration::ZERO, sink),
            Err(CacheError::InvalidLimit("max_cache_age"))
        ));
    }

    #[test]
    fn flush_fires_exactly_at_result_threshold() {
        let (sink, calls) = ok_sink();
        let cache = cache(5, sink);

        for i in 0..4 {
            assert_ok!(cache.on_new_test_result(result(
                identity(&format!("tests::t{i}")),
                TestOutcome::Passed
            )));
            assert_eq!(calls.load(Ordering::SeqCst), 0, "no flush below threshold");
        }

        assert_ok!(
            cache.on_new_test_result(result(identity("tests::t4"), TestOutcome::Passed))
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.buffered_count(), 0, "buffer cleared by the flush");
        assert_eq!(cache.flush_count(), 1);
    }

    #[test]
    fn in_progress_survives_size_flush() {
        let (sink, deliveries) = recording_sink();
        let cache = cache(5, sink);

        for i in 0..5 {
            assert_ok!(cache.on_test_started(&identity(&format!("tests::t{i}"))));
        }

        let log = deliveries.lock().unwrap();
        assert_eq!(log.len(), 1, "fifth start crosses the threshold");
        let (_, completed, in_progress) = &log[0];
        assert!(completed.is_empty());
        assert_eq!(in_progress.len(), 5);
        drop(log);

        assert_eq!(cache.in_progress_count(), 5, "starts are retained after flush");
    }

    #[test]
    fn completion_matches_by_id_not_by_reference() {
        let (sink, _) = ok_sink();
        let cache = cache(100, sink);

        let started = identity("tests::original");
        assert_ok!(cache.on_test_started(&started));

        // A separate object with the same id but different display fields.
        let clone = TestIdentity::with_id(
            started.id,
            "tests::cloned_view",
            "other/source.rs",
            "executor://volley-test/v2",
        );

        assert!(cache.on_test_completion(Some(&clone)));
        assert_eq!(cache.in_progress_count(), 0);
    }

    #[test]
    fn unrelated_completion_is_a_no_op() {
        let (sink, _) = ok_sink();
        let cache = cache(100, sink);

        let a = identity("tests::a");
        assert_ok!(cache.on_test_started(&a));

        let unrelated = identity("tests::b");
        assert!(!cache.on_test_completion(Some(&unrelated)));
        assert_eq!(cache.in_progress_count(), 1);
    }

    #[test]
    fn completion_without_identity_or_starts_returns_false() {
        let (sink, _) = ok_sink();
        let cache = cache(100, sink);

        assert!(!cache.on_test_completion(None));
        // Empty in-progress set short-circuits.
        assert!(!cache.on_test_completion(Some(&identity("tests::a"))));
    }

    #[test]
    fn duplicate_start_keeps_one_entry() {
        let (sink, _) = ok_sink();
        let cache = cache(100, sink);

        let a = identity("tests::a");
        let clone = TestIdentity::with_id(a.id, "tests::a_clone", "s", "e");

        assert_ok!(cache.on_test_started(&a));
        assert_ok!(cache.on_test_started(&clone));
        assert_eq!(cache.in_progress_count(), 1);
    }

    #[test]
    fn result_removes_started_entry() {
        let (sink, _) = ok_sink();
        let cache = cache(100, sink);

        let a = identity("tests::a");
        assert_ok!(cache.on_test_started(&a));
        assert_ok!(cache.on_new_test_result(result(a, TestOutcome::Failed)));

        assert_eq!(cache.in_progress_count(), 0);
        assert_eq!(cache.buffered_count(), 1);
    }

    #[test]
    fn result_without_start_records_normally() {
        let (sink, _) = ok_sink();
        let cache = cache(100, sink);

        assert_ok!(cache.on_new_test_result(result(identity("tests::a"), TestOutcome::Passed)));
        assert_eq!(cache.buffered_count(), 1);
        assert_eq!(cache.statistics().executed(), 1);
    }

    #[test]
    fn statistics_are_cumulative_across_a_boundary_flush() {
        let (sink, calls) = ok_sink();
        let cache = cache(10, sink);

        for i in 0..5 {
            assert_ok!(cache.on_new_test_result(result(
                identity(&format!("tests::pass{i}")),
                TestOutcome::Passed
            )));
        }
        for i in 0..5 {
            assert_ok!(cache.on_new_test_result(result(
                identity(&format!("tests::fail{i}")),
                TestOutcome::Failed
            )));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1, "flush at the tenth result");

        let stats = cache.statistics();
        assert_eq!(stats.executed(), 10);
        assert_eq!(stats.passed(), 5);
        assert_eq!(stats.failed(), 5);
        assert_eq!(stats.skipped(), 0);
        assert_eq!(stats.not_found(), 0);
    }

    #[test]
    fn non_terminal_outcome_does_not_advance_executed() {
        let (sink, _) = ok_sink();
        let cache = cache(100, sink);

        assert_ok!(cache.on_new_test_result(result(identity("tests::a"), TestOutcome::None)));
        assert_ok!(cache.on_new_test_result(result(identity("tests::b"), TestOutcome::Passed)));

        let stats = cache.statistics();
        assert_eq!(stats.executed(), 1);
        assert_eq!(stats.count(TestOutcome::None), 1);
    }

    #[test]
    fn take_last_chunk_drains_without_double_reporting() {
        let (sink, calls) = ok_sink();
        let cache = cache(100, sink);

        assert_ok!(cache.on_new_test_result(result(identity("tests::a"), TestOutcome::Passed)));
        assert_ok!(cache.on_new_test_result(result(identity("tests::b"), TestOutcome::Failed)));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "below threshold, no flush");

        let chunk = cache.take_last_chunk();
        assert_eq!(chunk.len(), 2);

        assert!(cache.take_last_chunk().is_empty(), "second drain is empty");
        assert_eq!(calls.load(Ordering::SeqCst), 0, "draining never calls the sink");
        assert_eq!(cache.flush_count(), 0);
    }

    #[test]
    fn forty_five_results_flush_four_times() {
        let (sink, deliveries) = recording_sink();
        let cache = cache(10, sink);

        for i in 0..45 {
            assert_ok!(cache.on_new_test_result(result(
                identity(&format!("tests::t{i}")),
                TestOutcome::Passed
            )));
        }

        let log = deliveries.lock().unwrap();
        assert_eq!(log.len(), 4, "one flush per ten results");
        for (_, completed, _) in log.iter() {
            assert_eq!(completed.len(), 10);
        }
        drop(log);

        assert_eq!(cache.buffered_count(), 5);
        assert_eq!(cache.statistics().executed(), 45);
        assert_eq!(cache.flush_count(), 4);
    }

    #[test]
    fn nil_identity_rejected_without_state_change() {
        let (sink, calls) = ok_sink();
        let cache = cache(100, sink);

        let nil = TestIdentity::with_id(Uuid::nil(), "tests::nil", "s", "e");

        assert!(matches!(
            cache.on_test_started(&nil),
            Err(CacheError::NilIdentity)
        ));
        assert!(matches!(
            cache.on_new_test_result(result(nil, TestOutcome::Passed)),
            Err(CacheError::NilIdentity)
        ));

        assert_eq!(cache.in_progress_count(), 0);
        assert_eq!(cache.buffered_count(), 0);
        assert_eq!(cache.statistics().executed(), 0);
        assert_eq!(cache.flush_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sink_error_propagates_and_buffer_stays_cleared() {
        let (sink, calls) = failing_sink();
        let cache = cache(2, sink);

        assert_ok!(cache.on_new_test_result(result(identity("tests::a"), TestOutcome::Passed)));
        let err = assert_err!(
            cache.on_new_test_result(result(identity("tests::b"), TestOutcome::Passed))
        );
        assert!(matches!(err, CacheError::Sink(_)));
        assert_eq!(err.to_string(), "downstream unavailable");

        // Results were handed to the sink once; they are not restored.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.buffered_count(), 0);
        assert_eq!(cache.flush_count(), 1);
        assert_eq!(cache.statistics().executed(), 2);
    }

    #[test]
    fn flush_snapshot_is_consistent() {
        let (sink, deliveries) = recording_sink();
        let cache = cache(3, sink);

        let running = identity("tests::slow");
        assert_ok!(cache.on_test_started(&running));
        assert_ok!(cache.on_new_test_result(result(identity("tests::a"), TestOutcome::Passed)));
        assert_ok!(cache.on_new_test_result(result(identity("tests::b"), TestOutcome::Failed)));

        let log = deliveries.lock().unwrap();
        assert_eq!(log.len(), 1);
        let (stats, completed, in_progress) = &log[0];
        assert_eq!(stats.executed(), 2);
        assert_eq!(completed.len(), 2);
        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].id, running.id);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_pending_results() {
        let (sink, deliveries) = recording_sink();
        let cache = TestRunCache::new(100, Duration::from_millis(50), sink).unwrap();

        assert_ok!(cache.on_new_test_result(result(identity("tests::a"), TestOutcome::Passed)));
        assert_eq!(cache.flush_count(), 0);

        let timer = cache.spawn_flush_timer();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(cache.flush_count(), 1);
        assert_eq!(cache.buffered_count(), 0);
        let log = deliveries.lock().unwrap();
        assert_eq!(log[0].1.len(), 1);
        drop(log);

        timer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timer_reports_in_progress_only_runs() {
        let (sink, deliveries) = recording_sink();
        let cache = TestRunCache::new(100, Duration::from_millis(50), sink).unwrap();

        assert_ok!(cache.on_test_started(&identity("tests::slow")));

        let timer = cache.spawn_flush_timer();
        tokio::time::sleep(Duration::from_millis(60)).await;
        timer.stop().await;

        let log = deliveries.lock().unwrap();
        assert_eq!(log.len(), 1);
        let (_, completed, in_progress) = &log[0];
        assert!(completed.is_empty());
        assert_eq!(in_progress.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_skips_ticks_with_nothing_to_report() {
        let (sink, calls) = ok_sink();
        let cache = TestRunCache::new(100, Duration::from_millis(50), sink).unwrap();

        let timer = cache.spawn_flush_timer();
        tokio::time::sleep(Duration::from_millis(175)).await;
        timer.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.flush_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_survives_sink_errors() {
        let (sink, calls) = failing_sink();
        let cache = TestRunCache::new(100, Duration::from_millis(50), sink).unwrap();

        let timer = cache.spawn_flush_timer();

        assert_ok!(cache.on_new_test_result(result(identity("tests::a"), TestOutcome::Passed)));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "first tick delivered and failed");

        assert_ok!(cache.on_new_test_result(result(identity("tests::b"), TestOutcome::Passed)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2, "schedule kept ticking after the error");

        timer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_timer_never_fires_again() {
        let (sink, calls) = ok_sink();
        let cache = TestRunCache::new(100, Duration::from_millis(50), sink).unwrap();

        assert_ok!(cache.on_new_test_result(result(identity("tests::a"), TestOutcome::Passed)));

        let timer = cache.spawn_flush_timer();
        timer.stop().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.buffered_count(), 1, "pending results stay for the final drain");
    }

    #[tokio::test(start_paused = true)]
    async fn size_and_timer_flushes_never_double_report() {
        let (sink, deliveries) = recording_sink();
        let cache = TestRunCache::new(3, Duration::from_millis(50), sink).unwrap();

        let timer = cache.spawn_flush_timer();

        // Size-triggered flush drains the buffer.
        for i in 0..3 {
            assert_ok!(cache.on_new_test_result(result(
                identity(&format!("tests::t{i}")),
                TestOutcome::Passed
            )));
        }
        // Next tick has nothing buffered and nothing in progress.
        tokio::time::sleep(Duration::from_millis(60)).await;
        timer.stop().await;

        let log = deliveries.lock().unwrap();
        let total_delivered: usize = log.iter().map(|(_, completed, _)| completed.len()).sum();
        assert_eq!(total_delivered, 3, "each result delivered exactly once");
    }

    #[tokio::test]
    async fn concurrent_producers_keep_counts_consistent() {
        let (sink, _) = ok_sink();
        let cache = TestRunCache::new(7, Duration::from_secs(60), sink).unwrap();

        let mut handles = Vec::new();
        for worker in 0..4 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    let id = identity(&format!("tests::w{worker}::t{i}"));
                    cache.on_test_started(&id).unwrap();
                    let outcome = if i % 2 == 0 {
                        TestOutcome::Passed
                    } else {
                        TestOutcome::Failed
                    };
                    cache.on_new_test_result(result(id, outcome)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = cache.statistics();
        assert_eq!(stats.executed(), 100);
        assert_eq!(stats.passed() + stats.failed(), 100);
        assert_eq!(cache.in_progress_count(), 0);

        let delivered_late = cache.take_last_chunk().len();
        // Everything not flushed mid-run is still buffered for the drain.
        assert_eq!(cache.buffered_count(), 0);
        assert!(delivered_late <= 100);
    }

    #[test]
    fn statistics_seed_all_categories() {
        let stats = RunStatistics::new();
        for outcome in TestOutcome::ALL {
            assert_eq!(stats.count(outcome), 0);
        }
        assert_eq!(stats.executed(), 0);
    }

    #[test]
    fn statistics_display_summary() {
        let mut stats = RunStatistics::new();
        stats.record(TestOutcome::Passed);
        stats.record(TestOutcome::Passed);
        stats.record(TestOutcome::Failed);
        stats.record(TestOutcome::NotFound);

        assert_eq!(
            stats.to_string(),
            "4 executed: 2 passed, 1 failed, 0 skipped, 1 not found"
        );
    }
}
