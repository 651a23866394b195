//! pytest framework adapter.
//!
//! Discovery runs `pytest --collect-only -q` and takes every line that
//! looks like a test id (`tests/test_math.py::test_add`). Execution runs
//! pytest with `--junitxml` pointed at a per-batch path under the system
//! temp directory; the runner retrieves that file and hands its content to
//! [`parse_results`](PytestFramework::parse_results). When the XML is
//! missing, results are recovered from the verbose stdout lines instead.
//!
//! ```toml
//! [framework]
//! type = "pytest"
//! paths = ["tests"]
//! markers = "not slow"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use uuid::Uuid;

use super::{
    FrameworkError, FrameworkResult, TestCase, TestFramework, TestIdentity, TestOutcome,
    TestResult, match_case,
};
use crate::config::PytestFrameworkConfig;
use crate::host::{Command, ExecResult};

const EXECUTOR_URI: &str = "executor://volley-pytest/v1";

/// Adapter for Python pytest projects.
pub struct PytestFramework {
    config: PytestFrameworkConfig,
}

impl PytestFramework {
    /// Creates a pytest adapter with the given configuration.
    pub fn new(config: PytestFrameworkConfig) -> Self {
        Self { config }
    }

    /// Parses `pytest --collect-only -q` output into test cases.
    fn parse_collect_output(&self, output: &str) -> Vec<TestCase> {
        let mut tests = Vec::new();

        for line in output.lines() {
            let trimmed = line.trim();
            // Test ids look like tests/test_foo.py::test_bar; summary and
            // warning lines contain spaces or angle brackets.
            if trimmed.contains("::") && !trimmed.starts_with('<') && !trimmed.contains(' ') {
                let source = trimmed.split("::").next().unwrap_or(trimmed);
                tests.push(TestCase::new(TestIdentity::new(trimmed, source, EXECUTOR_URI)));
            }
        }

        tests
    }
}

#[async_trait]
impl TestFramework for PytestFramework {
    fn name(&self) -> &'static str {
        "pytest"
    }

    fn executor_uri(&self) -> &str {
        EXECUTOR_URI
    }

    async fn discover(&self, paths: &[PathBuf]) -> FrameworkResult<Vec<TestCase>> {
        let mut cmd = tokio::process::Command::new(&self.config.python);
        cmd.arg("-m").arg("pytest").arg("--collect-only").arg("-q");

        if let Some(markers) = &self.config.markers {
            cmd.arg("-m").arg(markers);
        }
        for arg in &self.config.extra_args {
            cmd.arg(arg);
        }

        let search_paths = if paths.is_empty() { &self.config.paths } else { paths };
        for path in search_paths {
            cmd.arg(path);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| FrameworkError::DiscoveryFailed(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() && !stdout.contains("::") {
            return Err(FrameworkError::DiscoveryFailed(format!(
                "pytest discovery failed: {}",
                stderr
            )));
        }

        let tests = self.parse_collect_output(&stdout);

        if tests.is_empty() {
            tracing::warn!("no tests discovered. stdout: {stdout}, stderr: {stderr}");
        }

        Ok(tests)
    }

    fn run_command(&self, tests: &[TestCase], result_file: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.config.python)
            .arg("-m")
            .arg("pytest")
            .arg("-v")
            .arg("--tb=short");

        if let Some(path) = result_file {
            cmd = cmd.arg(format!("--junitxml={path}"));
        }

        if let Some(markers) = &self.config.markers {
            cmd = cmd.arg("-m").arg(markers);
        }

        for test in tests {
            cmd = cmd.arg(test.name());
        }

        cmd
    }

    fn result_file(&self) -> Option<String> {
        // Fresh per batch: batches run concurrently on the same machine
        // and must not clobber each other's XML.
        let path = std::env::temp_dir().join(format!("volley-junit-{}.xml", Uuid::new_v4()));
        Some(path.to_string_lossy().into_owned())
    }

    fn parse_results(
        &self,
        tests: &[TestCase],
        output: &ExecResult,
        result_file: Option<&str>,
    ) -> FrameworkResult<Vec<TestResult>> {
        let mut results = Vec::new();

        if let Some(xml) = result_file {
            results = parse_junit_xml(tests, xml)?;
        }

        if results.is_empty() {
            results = parse_pytest_stdout(tests, &output.stdout)?;
        }

        Ok(results)
    }
}

/// Parses JUnit XML content into results bound to the batch identities.
///
/// Attribute extraction is regex-based and order-insensitive, since
/// producers disagree on attribute ordering. Results for tests not in the
/// batch are dropped with a warning.
pub(crate) fn parse_junit_xml(tests: &[TestCase], content: &str) -> FrameworkResult<Vec<TestResult>> {
    let testcase_re = Regex::new(r"<testcase\b[^>]*>").expect("static regex");
    let name_re = Regex::new(r#"\bname="([^"]*)""#).expect("static regex");
    let classname_re = Regex::new(r#"\bclassname="([^"]*)""#).expect("static regex");
    let time_re = Regex::new(r#"\btime="([^"]*)""#).expect("static regex");
    let fail_re = Regex::new(r"<(?:failure|error)\b").expect("static regex");
    let fail_msg_re =
        Regex::new(r#"<(?:failure|error)[^>]*\bmessage="([^"]*)""#).expect("static regex");
    let skipped_re = Regex::new(r"<skipped\b").expect("static regex");

    let mut results = Vec::new();

    for found in testcase_re.find_iter(content) {
        let tag = found.as_str();
        let Some(name) = name_re.captures(tag).map(|c| c[1].to_string()) else {
            continue;
        };
        let classname = classname_re
            .captures(tag)
            .map(|c| c[1].to_string())
            .unwrap_or_default();
        let time: f64 = time_re
            .captures(tag)
            .and_then(|c| c[1].parse().ok())
            .unwrap_or(0.0);

        // Self-closing testcases have no body to inspect.
        let body = if tag.ends_with("/>") {
            ""
        } else {
            let start = found.end();
            let end = content[start..]
                .find("</testcase>")
                .map(|i| start + i)
                .unwrap_or(content.len());
            &content[start..end]
        };

        let (outcome, error_message) = if fail_re.is_match(body) {
            let msg = fail_msg_re.captures(body).map(|c| c[1].to_string());
            (TestOutcome::Failed, msg)
        } else if skipped_re.is_match(body) {
            (TestOutcome::Skipped, None)
        } else {
            (TestOutcome::Passed, None)
        };

        let Some(case) = match_case(tests, &classname, &name) else {
            tracing::warn!("result for unknown test {classname}::{name}, dropping");
            continue;
        };

        let mut result = TestResult::new(case.identity.clone(), outcome)
            .with_duration(Duration::from_secs_f64(time));
        if let Some(msg) = error_message {
            result = result.with_error_message(msg);
        }
        results.push(result);
    }

    Ok(results)
}

/// Recovers results from pytest's verbose stdout.
fn parse_pytest_stdout(tests: &[TestCase], stdout: &str) -> FrameworkResult<Vec<TestResult>> {
    let result_re =
        Regex::new(r"(\S+::\S+)\s+(PASSED|FAILED|SKIPPED|ERROR)").expect("static regex");

    let mut results = Vec::new();

    for cap in result_re.captures_iter(stdout) {
        let test_id = &cap[1];
        let outcome = match &cap[2] {
            "PASSED" => TestOutcome::Passed,
            "FAILED" | "ERROR" => TestOutcome::Failed,
            "SKIPPED" => TestOutcome::Skipped,
            _ => continue,
        };

        let Some(case) = tests.iter().find(|t| t.name() == test_id) else {
            continue;
        };

        results.push(TestResult::new(case.identity.clone(), outcome));
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framework() -> PytestFramework {
        PytestFramework::new(PytestFrameworkConfig::default())
    }

    fn case(name: &str) -> TestCase {
        TestCase::new(TestIdentity::new(name, "tests/test_math.py", EXECUTOR_URI))
    }

    #[test]
    fn collect_output_extracts_test_ids() {
        let output = "\
tests/test_math.py::test_add
tests/test_math.py::test_sub
<Module tests/test_math.py>
2 tests collected in 0.01s
";
        let tests = framework().parse_collect_output(output);
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].name(), "tests/test_math.py::test_add");
        assert_eq!(tests[0].identity.source, "tests/test_math.py");
    }

    #[test]
    fn run_command_carries_junitxml_and_ids() {
        let batch = vec![case("tests/test_math.py::test_add")];
        let cmd = framework().run_command(&batch, Some("/tmp/volley-junit-abc.xml"));
        let rendered = cmd.to_shell_string();

        assert!(rendered.contains("--junitxml=/tmp/volley-junit-abc.xml"));
        assert!(rendered.contains("tests/test_math.py::test_add"));
    }

    #[test]
    fn result_file_is_fresh_per_batch() {
        let fw = framework();
        let first = fw.result_file().unwrap();
        let second = fw.result_file().unwrap();

        // Concurrent batches each get their own XML path.
        assert_ne!(first, second);
        assert!(first.contains("volley-junit-"));
    }

    #[test]
    fn junit_xml_binds_outcomes_to_batch_identities() {
        let batch = vec![
            case("tests/test_math.py::test_add"),
            case("tests/test_math.py::test_sub"),
            case("tests/test_math.py::test_mul"),
        ];

        // classname-first attribute order, as pytest writes it.
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<testsuites>
  <testsuite name="pytest" tests="3">
    <testcase classname="tests.test_math" name="test_add" time="0.101" />
    <testcase classname="tests.test_math" name="test_sub" time="0.050">
      <failure message="assert 2 - 1 == 0">short traceback</failure>
    </testcase>
    <testcase classname="tests.test_math" name="test_mul" time="0.001">
      <skipped/>
    </testcase>
  </testsuite>
</testsuites>
"#;

        let results = parse_junit_xml(&batch, xml).unwrap();
        assert_eq!(results.len(), 3);

        assert_eq!(results[0].identity.id, batch[0].identity.id);
        assert_eq!(results[0].outcome, TestOutcome::Passed);
        assert_eq!(results[0].duration, Duration::from_secs_f64(0.101));

        assert_eq!(results[1].outcome, TestOutcome::Failed);
        assert_eq!(results[1].error_message.as_deref(), Some("assert 2 - 1 == 0"));

        assert_eq!(results[2].outcome, TestOutcome::Skipped);
    }

    #[test]
    fn junit_xml_drops_results_for_unknown_tests() {
        let batch = vec![case("tests/test_math.py::test_add")];
        let xml = r#"<testcase classname="tests.test_other" name="test_stranger" time="0.1" />"#;

        let results = parse_junit_xml(&batch, xml).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn stdout_fallback_parses_verbose_lines() {
        let batch = vec![
            case("tests/test_math.py::test_add"),
            case("tests/test_math.py::test_sub"),
        ];
        let stdout = "\
tests/test_math.py::test_add PASSED [ 50%]
tests/test_math.py::test_sub FAILED [100%]
";

        let results = parse_pytest_stdout(&batch, stdout).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].outcome, TestOutcome::Passed);
        assert_eq!(results[1].outcome, TestOutcome::Failed);
        assert_eq!(results[1].identity.id, batch[1].identity.id);
    }
}
