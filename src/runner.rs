//! Test run orchestration.
//!
//! The runner coordinates test execution end to end: scheduling batches
//! across hosts, pushing every started test and result through the run
//! cache, retrying failures, and driving reporters.
//!
//! # Architecture
//!
//! ```text
//!   Framework                Scheduler                 Provider
//!       │                        │                         │
//!       │ discover()             │                         │
//!       ▼                        │                         │
//!  Vec<TestCase> ───────────────►│ schedule_random()       │
//!                                ▼                         │
//!                       Vec<Vec<TestCase>> (batches)       │
//!                                │                         │
//!                                │     create_host() ─────►│
//!                                │                         ▼
//!                                │                       Host
//!                                └─────────┬───────────────┘
//!                                          ▼
//!                                  host.exec(cmd)
//!                                          │
//!   Framework ◄── parse_results() ── ExecResult
//!       │
//!       ▼
//!  Vec<TestResult> ──► TestRunCache ──flush──► Reporters
//! ```
//!
//! # Execution flow
//!
//! 1. Reporters learn about the discovered tests.
//! 2. Tests are scheduled into batches, one host per batch.
//! 3. Each started test is registered with the cache; every parsed
//!    result flows back through it. The cache flushes to reporters by
//!    size and by age.
//! 4. Failed tests are rescheduled until their attempt budget runs out.
//! 5. The final partial chunk is drained and reporters see the summary.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use volley::config::{ShellFrameworkConfig, load_config};
//! use volley::framework::TestFramework;
//! use volley::framework::shell::ShellFramework;
//! use volley::host::local::LocalHostProvider;
//! use volley::report::ConsoleReporter;
//! use volley::runner::TestRunner;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("volley.toml"))?;
//!
//!     let framework = ShellFramework::new(ShellFrameworkConfig {
//!         discover_command: "cat tests.txt".into(),
//!         run_command: "./run-tests.sh {tests}".into(),
//!         result_file: None,
//!     });
//!     let tests = framework.discover(&[]).await?;
//!
//!     let runner = TestRunner::new(
//!         config.runner,
//!         LocalHostProvider::new(Default::default()),
//!         framework,
//!         Arc::new(ConsoleReporter::new(false)),
//!     );
//!
//!     let summary = runner.run(&tests).await?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod pool;
pub mod retry;
pub mod scheduler;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{FlushSink, TestRunCache};
use crate::config::RunnerConfig;
use crate::framework::{TestCase, TestFramework, TestOutcome, TestResult};
use crate::host::{Command, ExecResult, ExecutionHost, HostProvider, HostSpec, OutputLine};
use crate::report::Reporter;

pub use pool::HostPool;
pub use retry::RetryManager;
pub use scheduler::Scheduler;

/// Aggregated results of an entire test run.
///
/// # Exit codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every test passed (flaky passes included) |
/// | 1 | Some tests failed or never reported a result |
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use volley::runner::RunSummary;
///
/// let summary = RunSummary {
///     total_tests: 100,
///     executed: 102,
///     passed: 95,
///     failed: 0,
///     skipped: 5,
///     not_found: 0,
///     flaky: 2,
///     duration: Duration::from_secs(60),
///     results: vec![],
/// };
///
/// assert!(summary.success());
/// assert_eq!(summary.exit_code(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Number of tests discovered and scheduled.
    pub total_tests: usize,

    /// Number of executed attempts, retries included.
    pub executed: usize,

    /// Tests whose final outcome is a pass.
    pub passed: usize,

    /// Tests that failed every attempt.
    pub failed: usize,

    /// Tests that were skipped.
    pub skipped: usize,

    /// Tests that ran but never reported a result.
    pub not_found: usize,

    /// Tests that both failed and passed across attempts.
    pub flaky: usize,

    /// Wall-clock duration of the run.
    pub duration: Duration,

    /// Final per-test results, in discovery order.
    pub results: Vec<TestResult>,
}

impl RunSummary {
    /// `true` when no test failed and every test reported a result.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.not_found == 0
    }

    /// Conventional process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Coordinates a full test run.
///
/// Ties together a [`HostProvider`] for execution environments, a
/// [`TestFramework`] for commands and result parsing, and the reporters
/// that observe progress. Results reach reporters through the run
/// cache, so [`Reporter::on_run_changed`] fires on the cache's flush
/// schedule rather than per test.
pub struct TestRunner<P, F> {
    config: RunnerConfig,
    provider: P,
    framework: F,
    reporter: Arc<dyn Reporter>,
}

impl<P: HostProvider, F: TestFramework> TestRunner<P, F> {
    pub fn new(
        config: RunnerConfig,
        provider: P,
        framework: F,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            config,
            provider,
            framework,
            reporter,
        }
    }

    /// Runs the given tests and returns the aggregated summary.
    ///
    /// # Errors
    ///
    /// Returns an error for infrastructure failures that invalidate the
    /// whole run: cache misconfiguration or a reporter rejecting an
    /// update. Per-batch failures do not error; affected tests finish
    /// as [`TestOutcome::NotFound`].
    pub async fn run(&self, tests: &[TestCase]) -> Result<RunSummary> {
        let start = Instant::now();

        if tests.is_empty() {
            warn!("no tests to run");
            return Ok(RunSummary {
                total_tests: 0,
                executed: 0,
                passed: 0,
                failed: 0,
                skipped: 0,
                not_found: 0,
                flaky: 0,
                duration: start.elapsed(),
                results: Vec::new(),
            });
        }

        self.reporter.on_discovery_complete(tests)?;

        let reporter = Arc::clone(&self.reporter);
        let sink: FlushSink = Arc::new(move |stats, results, in_progress| {
            reporter.on_run_changed(&stats, &results, &in_progress)
        });
        let cache = TestRunCache::new(
            self.config.max_cache_size,
            self.config.max_cache_age(),
            sink,
        )?;
        let timer = cache.spawn_flush_timer();

        let scheduler = Scheduler::new(self.config.max_parallel);
        let retry = RetryManager::new(self.config.retry_count + 1);
        let pool: Mutex<HostPool<P::Host>> = Mutex::new(HostPool::new());
        let run_id = Uuid::new_v4();

        let mut final_results: HashMap<Uuid, TestResult> = HashMap::new();
        let mut pending: Vec<TestCase> = tests.to_vec();
        let mut round = 0usize;
        let mut run_error: Option<anyhow::Error> = None;

        while !pending.is_empty() {
            // The first round spreads slow tests randomly; retry rounds
            // are small enough that round-robin is fine.
            let batches = if round == 0 {
                scheduler.schedule_random(&pending)
            } else {
                scheduler.schedule(&pending)
            };
            info!(
                round,
                tests = pending.len(),
                batches = batches.len(),
                "scheduled test batches"
            );

            let errors: std::sync::Mutex<Vec<anyhow::Error>> = std::sync::Mutex::new(Vec::new());
            let round_results: std::sync::Mutex<Vec<TestResult>> =
                std::sync::Mutex::new(Vec::new());

            tokio_scoped::scope(|scope| {
                for (batch_idx, batch) in batches.into_iter().enumerate() {
                    let cache = &cache;
                    let pool = &pool;
                    let errors = &errors;
                    let round_results = &round_results;

                    scope.spawn(async move {
                        match self
                            .run_batch(cache, pool, run_id, round, batch_idx, &batch)
                            .await
                        {
                            Ok(results) => round_results.lock().unwrap().extend(results),
                            Err(e) => errors.lock().unwrap().push(e),
                        }
                    });
                }
            });

            if let Some(e) = errors.into_inner().unwrap().into_iter().next() {
                run_error = Some(e);
                break;
            }

            let mut next_pending = Vec::new();
            for result in round_results.into_inner().unwrap() {
                let id = result.identity.id;
                retry.record_attempt(id, result.outcome.is_success());

                if result.outcome == TestOutcome::Failed
                    && retry.should_retry(id)
                    && let Some(case) = pending.iter().find(|c| c.identity.id == id)
                {
                    next_pending.push(case.clone());
                }

                // A pass on any attempt stands; otherwise the latest
                // attempt does.
                match final_results.get(&id) {
                    Some(existing) if existing.outcome.is_success() => {}
                    _ => {
                        final_results.insert(id, result);
                    }
                }
            }

            pending = next_pending;
            round += 1;
        }

        timer.stop().await;
        pool.lock().await.terminate_all().await;

        if let Some(e) = run_error {
            // The aborted round's tests are not running anymore; clear
            // them so the final drain reports a consistent picture.
            for case in &pending {
                cache.on_test_completion(Some(&case.identity));
            }
            return Err(e);
        }

        // Whatever the last flush window still holds goes out now.
        let last_chunk = cache.take_last_chunk();
        if !last_chunk.is_empty() {
            let stats = cache.statistics();
            self.reporter.on_run_changed(&stats, &last_chunk, &[])?;
        }

        let stats = cache.statistics();
        let results: Vec<TestResult> = tests
            .iter()
            .filter_map(|case| final_results.remove(&case.identity.id))
            .collect();

        let passed = results
            .iter()
            .filter(|r| r.outcome == TestOutcome::Passed)
            .count();
        let failed = results
            .iter()
            .filter(|r| r.outcome == TestOutcome::Failed)
            .count();
        let skipped = results
            .iter()
            .filter(|r| r.outcome == TestOutcome::Skipped)
            .count();
        let not_found = results
            .iter()
            .filter(|r| r.outcome == TestOutcome::NotFound)
            .count()
            + tests.len().saturating_sub(results.len());

        let summary = RunSummary {
            total_tests: tests.len(),
            executed: stats.executed(),
            passed,
            failed,
            skipped,
            not_found,
            flaky: retry.flaky_tests().len(),
            duration: start.elapsed(),
            results,
        };

        self.reporter.on_run_complete(&summary)?;

        info!("{stats}");
        Ok(summary)
    }

    /// Runs one batch on one host, pushing results through the cache.
    ///
    /// Infrastructure failures turn into `NotFound` results for the
    /// whole batch; only cache and reporter errors propagate.
    async fn run_batch(
        &self,
        cache: &TestRunCache,
        pool: &Mutex<HostPool<P::Host>>,
        run_id: Uuid,
        round: usize,
        batch_idx: usize,
        batch: &[TestCase],
    ) -> Result<Vec<TestResult>> {
        let host = match self.checkout_host(pool, run_id, round, batch_idx).await {
            Ok(host) => host,
            Err(e) => {
                error!("failed to create host: {e}");
                return self.record_unrun(cache, batch, &format!("host creation failed: {e}"));
            }
        };

        for case in batch {
            cache.on_test_started(&case.identity)?;
        }

        // One result path per batch; concurrent batches must not share.
        let result_path = self.framework.result_file();
        let cmd = self
            .framework
            .run_command(batch, result_path.as_deref())
            .timeout(self.config.test_timeout_secs);

        debug!(host = host.id(), tests = batch.len(), "running batch");

        let exec_result = if self.config.stream_output {
            self.exec_streaming(&host, &cmd).await
        } else {
            host.exec(&cmd).await.map_err(anyhow::Error::from)
        };

        let exec_result = match exec_result {
            Ok(result) => result,
            Err(e) => {
                error!(host = host.id(), "batch execution failed: {e}");
                let results =
                    self.record_unrun(cache, batch, &format!("batch execution failed: {e}"))?;
                pool.lock().await.add(host);
                return Ok(results);
            }
        };

        debug!(
            host = host.id(),
            exit_code = exec_result.exit_code,
            duration = ?exec_result.duration,
            "batch finished"
        );

        let result_file = match &result_path {
            Some(remote) => self.try_download_results(&host, remote).await,
            None => None,
        };

        let mut results = match self
            .framework
            .parse_results(batch, &exec_result, result_file.as_deref())
        {
            Ok(results) => results,
            Err(e) => {
                error!(host = host.id(), "failed to parse results: {e}");
                Vec::new()
            }
        };

        // Started tests the framework never reported need a terminal
        // outcome, or they would sit in the in-progress set forever.
        let reported: HashSet<Uuid> = results.iter().map(|r| r.identity.id).collect();
        for case in batch {
            if !reported.contains(&case.identity.id) {
                warn!(
                    "no result reported for {}",
                    case.identity.fully_qualified_name
                );
                results.push(
                    TestResult::new(case.identity.clone(), TestOutcome::NotFound)
                        .with_error_message("test ran but never reported a result"),
                );
            }
        }

        for result in &results {
            cache.on_new_test_result(result.clone())?;
        }

        pool.lock().await.add(host);
        Ok(results)
    }

    /// Takes a pooled host or creates a fresh one.
    async fn checkout_host(
        &self,
        pool: &Mutex<HostPool<P::Host>>,
        run_id: Uuid,
        round: usize,
        batch_idx: usize,
    ) -> Result<P::Host> {
        if let Some(host) = pool.lock().await.take_one() {
            return Ok(host);
        }

        let spec = HostSpec {
            id: format!("volley-{run_id}-{round}-{batch_idx}"),
            working_dir: self.config.working_dir.clone(),
            env: Vec::new(),
        };
        Ok(self.provider.create_host(&spec).await?)
    }

    /// Records a `NotFound` result for every test in the batch.
    fn record_unrun(
        &self,
        cache: &TestRunCache,
        batch: &[TestCase],
        reason: &str,
    ) -> Result<Vec<TestResult>> {
        let mut results = Vec::with_capacity(batch.len());
        for case in batch {
            let result = TestResult::new(case.identity.clone(), TestOutcome::NotFound)
                .with_error_message(reason);
            cache.on_new_test_result(result.clone())?;
            results.push(result);
        }
        Ok(results)
    }

    /// Executes a command while echoing its output line by line.
    async fn exec_streaming(&self, host: &P::Host, cmd: &Command) -> Result<ExecResult> {
        let start = Instant::now();
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = -1;

        let mut stream = host.exec_stream(cmd).await?;
        while let Some(line) = stream.next().await {
            match line? {
                OutputLine::Stdout(s) => {
                    println!("[{}] {}", host.id(), s);
                    stdout.push_str(&s);
                    stdout.push('\n');
                }
                OutputLine::Stderr(s) => {
                    eprintln!("[{}] {}", host.id(), s);
                    stderr.push_str(&s);
                    stderr.push('\n');
                }
                OutputLine::ExitCode(code) => exit_code = code,
            }
        }

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }

    /// Downloads the framework's result file from the host, if any.
    async fn try_download_results(&self, host: &P::Host, remote: &str) -> Option<String> {
        let temp = tempfile::NamedTempFile::new().ok()?;

        if let Err(e) = host.download(Path::new(remote), temp.path()).await {
            warn!(host = host.id(), "failed to download {remote}: {e}");
            return None;
        }

        let content = std::fs::read_to_string(temp.path()).ok()?;
        if content.is_empty() {
            debug!(host = host.id(), "result file {remote} is empty");
            return None;
        }
        Some(content)
    }
}
