//! Test framework abstraction and the core test data model.
//!
//! A *framework* knows how to discover tests, how to turn a batch of them
//! into an executable command, and how to parse the raw execution output
//! back into structured results. Everything else in the runner (hosts,
//! scheduling, the result cache) is framework-agnostic.
//!
//! ```text
//! ┌───────────────┐  discover   ┌───────────┐  run_command   ┌─────────┐
//! │ TestFramework │ ──────────► │ TestCase  │ ─────────────► │ Command │
//! └───────────────┘             └───────────┘                └─────────┘
//!        ▲                                                        │
//!        │                                                        ▼
//!        └── parse_results ◄──────────────────────────────── ExecResult
//! ```
//!
//! # Identity
//!
//! Every discovered test carries a [`TestIdentity`] with a fresh v4 UUID.
//! Identities compare equal by id alone, so a cloned case object still
//! refers to the same logical test. Result records produced by
//! [`TestFramework::parse_results`] are bound back to the identities of
//! the batch that was executed, which is what lets the run cache reconcile
//! "started" and "completed" events across worker tasks.
//!
//! # Built-in frameworks
//!
//! | Implementation | Discovery | Results |
//! |----------------|-----------|---------|
//! | [`cargo::CargoFramework`] | `cargo nextest list` | JUnit XML or nextest output lines |
//! | [`pytest::PytestFramework`] | `pytest --collect-only -q` | JUnit XML or pytest output lines |
//! | [`shell::ShellFramework`] | user-supplied command | JUnit XML or exit code |

pub mod cargo;
pub mod pytest;
pub mod shell;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::host::{Command, ExecResult};

/// Result type for framework operations.
pub type FrameworkResult<T> = Result<T, FrameworkError>;

/// Errors that can occur during framework operations.
#[derive(Debug, Error)]
pub enum FrameworkError {
    /// Test discovery failed.
    #[error("test discovery failed: {0}")]
    DiscoveryFailed(String),

    /// Failed to parse test output.
    #[error("failed to parse test output: {0}")]
    ParseError(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Uniquely identifies one logical test within a run.
///
/// Two identities are equal iff their ids are equal; the descriptive
/// fields exist for display and reporting only. Executors hand out cloned
/// case objects, and a clone must still match the original when a
/// completion is reconciled against a start.
///
/// # Example
///
/// ```
/// use volley::framework::TestIdentity;
///
/// let a = TestIdentity::new("tests::math::adds", "src/math.rs", "executor://volley-cargo/v1");
/// let b = TestIdentity { fully_qualified_name: "renamed".into(), ..a.clone() };
///
/// assert_eq!(a, b); // same id, equal regardless of other fields
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestIdentity {
    /// Stable unique id for this test within the run.
    pub id: Uuid,
    /// Fully-qualified test name, e.g. `tests/test_math.py::test_add`.
    pub fully_qualified_name: String,
    /// Source locator (file or module path) the test came from.
    pub source: String,
    /// URI of the executor responsible for running this test.
    pub executor_uri: String,
}

impl TestIdentity {
    /// Creates an identity with a fresh v4 UUID.
    pub fn new(
        fully_qualified_name: impl Into<String>,
        source: impl Into<String>,
        executor_uri: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            fully_qualified_name: fully_qualified_name.into(),
            source: source.into(),
            executor_uri: executor_uri.into(),
        }
    }

    /// Creates an identity with an explicit id.
    ///
    /// Used when reconstructing an identity that must compare equal to an
    /// existing one.
    pub fn with_id(
        id: Uuid,
        fully_qualified_name: impl Into<String>,
        source: impl Into<String>,
        executor_uri: impl Into<String>,
    ) -> Self {
        Self {
            id,
            fully_qualified_name: fully_qualified_name.into(),
            source: source.into(),
            executor_uri: executor_uri.into(),
        }
    }

    /// True if the id is the nil UUID.
    ///
    /// Nil ids are rejected by the run cache's mutating operations.
    pub fn is_nil(&self) -> bool {
        self.id.is_nil()
    }

    /// Short display name: the last `::` segment of the qualified name.
    pub fn display_name(&self) -> &str {
        self.fully_qualified_name
            .rsplit("::")
            .next()
            .unwrap_or(&self.fully_qualified_name)
    }
}

impl PartialEq for TestIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TestIdentity {}

impl std::hash::Hash for TestIdentity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fully_qualified_name)
    }
}

/// Outcome of a single test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    /// No outcome recorded; the execution has not finished.
    None,
    /// Test passed.
    Passed,
    /// Test failed.
    Failed,
    /// Test was skipped.
    Skipped,
    /// Test was scheduled but never reported a result.
    NotFound,
}

impl TestOutcome {
    /// Every outcome category, in display order.
    pub const ALL: [TestOutcome; 5] = [
        TestOutcome::None,
        TestOutcome::Passed,
        TestOutcome::Failed,
        TestOutcome::Skipped,
        TestOutcome::NotFound,
    ];

    /// True for outcomes that represent a finished execution.
    ///
    /// `None` is the only non-terminal category.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TestOutcome::None)
    }

    /// True if the outcome counts as a success.
    pub fn is_success(&self) -> bool {
        matches!(self, TestOutcome::Passed | TestOutcome::Skipped)
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestOutcome::None => "none",
            TestOutcome::Passed => "passed",
            TestOutcome::Failed => "failed",
            TestOutcome::Skipped => "skipped",
            TestOutcome::NotFound => "not found",
        };
        write!(f, "{}", s)
    }
}

/// Category of a diagnostic message attached to a test result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageCategory {
    /// Standard output captured during the test.
    StdOut,
    /// Standard error captured during the test.
    StdErr,
    /// Additional information from the executor.
    AdditionalInfo,
    /// Debug or trace output.
    DebugTrace,
}

/// One diagnostic message attached to a test result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMessage {
    pub category: MessageCategory,
    pub text: String,
}

impl TestMessage {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self { category: MessageCategory::StdOut, text: text.into() }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self { category: MessageCategory::StdErr, text: text.into() }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self { category: MessageCategory::AdditionalInfo, text: text.into() }
    }
}

/// Result of one test execution.
///
/// Created by a framework adapter (or synthesized by the runner for tests
/// that never reported back) and pushed into the run cache exactly once
/// per execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    /// Identity of the test this result belongs to.
    pub identity: TestIdentity,
    /// Outcome of the execution.
    pub outcome: TestOutcome,
    /// How long the test took.
    pub duration: Duration,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
    /// When the execution finished.
    pub finished_at: DateTime<Utc>,
    /// Ordered diagnostic messages captured during the run.
    #[serde(default)]
    pub messages: Vec<TestMessage>,
    /// Short error message for failed tests.
    pub error_message: Option<String>,
    /// Stack trace or long-form failure detail.
    pub stack_trace: Option<String>,
}

impl TestResult {
    /// Creates a result with the given identity and outcome.
    ///
    /// Timestamps default to now and duration to zero; use the `with_*`
    /// builders to fill in what the parser knows.
    pub fn new(identity: TestIdentity, outcome: TestOutcome) -> Self {
        let now = Utc::now();
        Self {
            identity,
            outcome,
            duration: Duration::ZERO,
            started_at: now,
            finished_at: now,
            messages: Vec::new(),
            error_message: None,
            stack_trace: None,
        }
    }

    /// Sets the duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Sets start and finish timestamps.
    pub fn with_timestamps(
        mut self,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        self.started_at = started_at;
        self.finished_at = finished_at;
        self
    }

    /// Appends a diagnostic message.
    pub fn with_message(mut self, message: TestMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Sets the error message.
    pub fn with_error_message(mut self, msg: impl Into<String>) -> Self {
        self.error_message = Some(msg.into());
        self
    }

    /// Sets the stack trace.
    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    /// All stdout messages joined with newlines.
    pub fn stdout_text(&self) -> String {
        self.joined_text(MessageCategory::StdOut)
    }

    /// All stderr messages joined with newlines.
    pub fn stderr_text(&self) -> String {
        self.joined_text(MessageCategory::StdErr)
    }

    fn joined_text(&self, category: MessageCategory) -> String {
        self.messages
            .iter()
            .filter(|m| m.category == category)
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A discovered test, ready to be scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    /// Identity assigned at discovery time.
    pub identity: TestIdentity,
    /// Framework markers or attributes, e.g. pytest markers.
    #[serde(default)]
    pub markers: Vec<String>,
}

impl TestCase {
    /// Creates a test case from an identity.
    pub fn new(identity: TestIdentity) -> Self {
        Self { identity, markers: Vec::new() }
    }

    /// Sets markers.
    pub fn with_markers(mut self, markers: Vec<String>) -> Self {
        self.markers = markers;
        self
    }

    /// The fully-qualified name of the test.
    pub fn name(&self) -> &str {
        &self.identity.fully_qualified_name
    }
}

/// A test framework adapter.
///
/// Implementations know how to discover tests, produce a command that runs
/// a batch of them, and parse execution output back into [`TestResult`]s
/// bound to the batch's identities.
#[async_trait]
pub trait TestFramework: Send + Sync {
    /// Framework name for logs and display.
    fn name(&self) -> &'static str;

    /// URI identifying the executor, stamped onto discovered identities.
    fn executor_uri(&self) -> &str;

    /// Discovers tests. `paths` overrides the configured search paths when
    /// non-empty.
    async fn discover(&self, paths: &[PathBuf]) -> FrameworkResult<Vec<TestCase>>;

    /// Builds the command that executes the given batch of tests.
    ///
    /// `result_file` is the path [`result_file`](Self::result_file)
    /// produced for this batch; frameworks that emit a machine-readable
    /// result point their writer at it.
    fn run_command(&self, tests: &[TestCase], result_file: Option<&str>) -> Command;

    /// Path inside the execution host where this framework writes a
    /// machine-readable result file for one batch, if it produces one.
    ///
    /// The runner calls this once per batch and passes the value to both
    /// [`run_command`](Self::run_command) and the download step.
    /// Implementations that pick the path themselves must return a fresh
    /// one on every call: batches run concurrently on the same machine
    /// and must never share a result file.
    fn result_file(&self) -> Option<String> {
        None
    }

    /// Parses execution output into results bound to the batch identities.
    ///
    /// `result_file` holds the content of [`result_file`](Self::result_file)
    /// when the runner managed to retrieve it. Tests in the batch without a
    /// parsed result are not an error here; the runner reconciles them as
    /// [`TestOutcome::NotFound`].
    fn parse_results(
        &self,
        tests: &[TestCase],
        output: &ExecResult,
        result_file: Option<&str>,
    ) -> FrameworkResult<Vec<TestResult>>;
}

/// Finds the batch case a parsed `classname`/`name` pair refers to.
///
/// Tries the exact joined form first, then falls back to matching on the
/// bare test name, since JUnit producers disagree on how much of the path
/// lands in `classname`.
pub(crate) fn match_case<'a>(
    tests: &'a [TestCase],
    classname: &str,
    name: &str,
) -> Option<&'a TestCase> {
    let joined = format!("{}::{}", classname, name);
    tests.iter().find(|t| t.name() == joined).or_else(|| {
        let suffix = format!("::{}", name);
        tests
            .iter()
            .find(|t| t.name() == name || t.name().ends_with(&suffix))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> TestIdentity {
        TestIdentity::new(name, "tests/demo.rs", "executor://volley-test/v1")
    }

    #[test]
    fn identity_equality_is_by_id_only() {
        let a = identity("tests::one");
        let mut b = a.clone();
        b.fully_qualified_name = "tests::renamed".to_string();
        b.source = "elsewhere".to_string();

        assert_eq!(a, b);

        let c = identity("tests::one");
        assert_ne!(a, c, "same name but different id must not compare equal");
    }

    #[test]
    fn identity_hash_follows_id() {
        use std::collections::HashSet;

        let a = identity("tests::one");
        let clone_with_other_name = TestIdentity {
            fully_qualified_name: "other".into(),
            ..a.clone()
        };

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&clone_with_other_name));
    }

    #[test]
    fn nil_identity_detected() {
        let nil = TestIdentity::with_id(Uuid::nil(), "t", "s", "e");
        assert!(nil.is_nil());
        assert!(!identity("t").is_nil());
    }

    #[test]
    fn display_name_is_last_segment() {
        assert_eq!(identity("a::b::c").display_name(), "c");
        assert_eq!(identity("plain").display_name(), "plain");
    }

    #[test]
    fn terminal_outcomes() {
        assert!(!TestOutcome::None.is_terminal());
        for outcome in [
            TestOutcome::Passed,
            TestOutcome::Failed,
            TestOutcome::Skipped,
            TestOutcome::NotFound,
        ] {
            assert!(outcome.is_terminal());
        }
    }

    #[test]
    fn result_builder_collects_messages() {
        let result = TestResult::new(identity("t"), TestOutcome::Failed)
            .with_message(TestMessage::stdout("line one"))
            .with_message(TestMessage::stderr("boom"))
            .with_message(TestMessage::stdout("line two"))
            .with_error_message("assertion failed");

        assert_eq!(result.stdout_text(), "line one\nline two");
        assert_eq!(result.stderr_text(), "boom");
        assert_eq!(result.error_message.as_deref(), Some("assertion failed"));
    }

    #[test]
    fn match_case_prefers_exact_join() {
        let cases = vec![
            TestCase::new(identity("pkg::mod::alpha")),
            TestCase::new(identity("pkg::mod::beta")),
        ];

        let hit = match_case(&cases, "pkg::mod", "beta").unwrap();
        assert_eq!(hit.name(), "pkg::mod::beta");
    }

    #[test]
    fn match_case_falls_back_to_name_suffix() {
        let cases = vec![TestCase::new(identity("tests/test_math.py::test_add"))];

        let hit = match_case(&cases, "tests.test_math", "test_add").unwrap();
        assert_eq!(hit.name(), "tests/test_math.py::test_add");
        assert!(match_case(&cases, "tests.test_math", "test_missing").is_none());
    }
}
