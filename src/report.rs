//! Test reporting and output generation.
//!
//! Reporters observe a run at three points: after discovery, after each
//! flush of buffered results, and once at the end. The runner forwards
//! cache flushes to [`Reporter::on_run_changed`], so a reporter sees
//! every result exactly once regardless of how the flushes were timed.

pub mod junit;

pub use junit::JUnitReporter;

use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};

use crate::cache::RunStatistics;
use crate::framework::{TestCase, TestIdentity, TestOutcome, TestResult};
use crate::runner::RunSummary;

/// Observer for test run progress.
///
/// Implementations must tolerate `on_run_changed` being called with an
/// empty result slice (a periodic flush that only had in-progress runs
/// to report) and must not assume any particular flush cadence.
pub trait Reporter: Send + Sync {
    /// Called once after discovery, before any test starts.
    fn on_discovery_complete(&self, tests: &[TestCase]) -> anyhow::Result<()>;

    /// Called on every flush with cumulative statistics, the newly
    /// completed results, and the identities still running.
    fn on_run_changed(
        &self,
        stats: &RunStatistics,
        results: &[TestResult],
        in_progress: &[TestIdentity],
    ) -> anyhow::Result<()>;

    /// Called once after the run finishes.
    fn on_run_complete(&self, summary: &RunSummary) -> anyhow::Result<()>;
}

/// Reporter that discards everything.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn on_discovery_complete(&self, _tests: &[TestCase]) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_run_changed(
        &self,
        _stats: &RunStatistics,
        _results: &[TestResult],
        _in_progress: &[TestIdentity],
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_run_complete(&self, _summary: &RunSummary) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fans every callback out to a list of reporters.
///
/// The first reporter error aborts the fan-out and propagates.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl Reporter for MultiReporter {
    fn on_discovery_complete(&self, tests: &[TestCase]) -> anyhow::Result<()> {
        for reporter in &self.reporters {
            reporter.on_discovery_complete(tests)?;
        }
        Ok(())
    }

    fn on_run_changed(
        &self,
        stats: &RunStatistics,
        results: &[TestResult],
        in_progress: &[TestIdentity],
    ) -> anyhow::Result<()> {
        for reporter in &self.reporters {
            reporter.on_run_changed(stats, results, in_progress)?;
        }
        Ok(())
    }

    fn on_run_complete(&self, summary: &RunSummary) -> anyhow::Result<()> {
        for reporter in &self.reporters {
            reporter.on_run_complete(summary)?;
        }
        Ok(())
    }
}

/// Console reporter with a progress bar and a final summary block.
pub struct ConsoleReporter {
    progress: Mutex<Option<ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn println(&self, line: &str) {
        let guard = self.progress.lock().unwrap();
        match guard.as_ref() {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }

    fn outcome_label(outcome: TestOutcome) -> console::StyledObject<&'static str> {
        match outcome {
            TestOutcome::Passed => console::style("PASS").green(),
            TestOutcome::Failed => console::style("FAIL").red().bold(),
            TestOutcome::Skipped => console::style("SKIP").yellow(),
            TestOutcome::NotFound => console::style("LOST").red(),
            TestOutcome::None => console::style("....").dim(),
        }
    }
}

impl Reporter for ConsoleReporter {
    fn on_discovery_complete(&self, tests: &[TestCase]) -> anyhow::Result<()> {
        println!("Discovered {} tests", tests.len());

        let bar = ProgressBar::new(tests.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        *self.progress.lock().unwrap() = Some(bar);

        Ok(())
    }

    fn on_run_changed(
        &self,
        stats: &RunStatistics,
        results: &[TestResult],
        in_progress: &[TestIdentity],
    ) -> anyhow::Result<()> {
        if self.verbose {
            for result in results {
                let label = Self::outcome_label(result.outcome);
                self.println(&format!(
                    "{} {} ({:.2}s)",
                    label,
                    result.identity.fully_qualified_name,
                    result.duration.as_secs_f64()
                ));
            }
        }

        let guard = self.progress.lock().unwrap();
        if let Some(bar) = guard.as_ref() {
            bar.inc(results.len() as u64);
            bar.set_message(format!("{stats}, {} running", in_progress.len()));
        }

        Ok(())
    }

    fn on_run_complete(&self, summary: &RunSummary) -> anyhow::Result<()> {
        if let Some(bar) = self.progress.lock().unwrap().take() {
            bar.finish_and_clear();
        }

        println!();
        println!("Test Results:");
        println!("  Total:     {}", summary.total_tests);
        println!("  Passed:    {}", console::style(summary.passed).green());
        println!("  Failed:    {}", console::style(summary.failed).red());
        println!("  Skipped:   {}", console::style(summary.skipped).yellow());

        if summary.not_found > 0 {
            println!(
                "  Not Found: {}",
                console::style(summary.not_found).red().bold()
            );
        }

        if summary.flaky > 0 {
            println!("  Flaky:     {}", console::style(summary.flaky).yellow());
        }

        println!("  Duration:  {:.2}s", summary.duration.as_secs_f64());

        let failed: Vec<&TestResult> = summary
            .results
            .iter()
            .filter(|r| r.outcome == TestOutcome::Failed)
            .collect();

        if !failed.is_empty() {
            println!();
            println!("{}", console::style("Failures:").red().bold());
            for result in failed {
                println!();
                println!(
                    "  {} {}",
                    console::style("FAIL").red().bold(),
                    result.identity.fully_qualified_name
                );
                if let Some(message) = &result.error_message {
                    println!("    {message}");
                }
                if let Some(trace) = &result.stack_trace {
                    for line in trace.lines() {
                        println!("    {}", console::style(line).dim());
                    }
                }
            }
        }

        println!();
        if summary.success() {
            println!("{}", console::style("All tests passed!").green().bold());
        } else if summary.not_found > 0 && summary.failed == 0 {
            println!(
                "{}",
                console::style("Some tests never reported a result.")
                    .red()
                    .bold()
            );
        } else {
            println!("{}", console::style("Some tests failed.").red().bold());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::framework::TestIdentity;

    struct CountingReporter {
        changed: Arc<AtomicUsize>,
        fail_on_change: bool,
    }

    impl Reporter for CountingReporter {
        fn on_discovery_complete(&self, _tests: &[TestCase]) -> anyhow::Result<()> {
            Ok(())
        }

        fn on_run_changed(
            &self,
            _stats: &RunStatistics,
            _results: &[TestResult],
            _in_progress: &[TestIdentity],
        ) -> anyhow::Result<()> {
            self.changed.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_change {
                anyhow::bail!("reporter rejected the update");
            }
            Ok(())
        }

        fn on_run_complete(&self, _summary: &RunSummary) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn summary() -> RunSummary {
        RunSummary {
            total_tests: 1,
            executed: 1,
            passed: 1,
            failed: 0,
            skipped: 0,
            not_found: 0,
            flaky: 0,
            duration: Duration::from_secs(1),
            results: Vec::new(),
        }
    }

    #[test]
    fn multi_reporter_forwards_to_every_child() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let multi = MultiReporter::new()
            .with_reporter(Box::new(CountingReporter {
                changed: first.clone(),
                fail_on_change: false,
            }))
            .with_reporter(Box::new(CountingReporter {
                changed: second.clone(),
                fail_on_change: false,
            }));

        multi
            .on_run_changed(&RunStatistics::new(), &[], &[])
            .unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn multi_reporter_stops_at_first_error() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let multi = MultiReporter::new()
            .with_reporter(Box::new(CountingReporter {
                changed: first.clone(),
                fail_on_change: true,
            }))
            .with_reporter(Box::new(CountingReporter {
                changed: second.clone(),
                fail_on_change: false,
            }));

        let err = multi
            .on_run_changed(&RunStatistics::new(), &[], &[])
            .unwrap_err();

        assert_eq!(err.to_string(), "reporter rejected the update");
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn null_reporter_accepts_everything() {
        let reporter = NullReporter;
        reporter.on_discovery_complete(&[]).unwrap();
        reporter
            .on_run_changed(&RunStatistics::new(), &[], &[])
            .unwrap();
        reporter.on_run_complete(&summary()).unwrap();
    }
}
