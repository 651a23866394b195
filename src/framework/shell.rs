//! Shell framework adapter for arbitrary test suites.
//!
//! The user supplies two commands: one that lists test ids and one that
//! runs a batch. The run command gets the batch's ids substituted for a
//! `{tests}` placeholder (shell-quoted), or appended when no placeholder
//! is present. Results come from a JUnit XML file when configured, and
//! fall back to the run command's exit code otherwise.
//!
//! ```toml
//! [framework]
//! type = "shell"
//! discover_command = "cat tests.txt"
//! run_command = "./run-tests.sh {tests}"
//! result_file = "/tmp/results.xml"
//! ```

use std::path::PathBuf;

use async_trait::async_trait;

use super::pytest::parse_junit_xml;
use super::{
    FrameworkError, FrameworkResult, TestCase, TestFramework, TestIdentity, TestOutcome,
    TestResult,
};
use crate::config::ShellFrameworkConfig;
use crate::host::{Command, ExecResult};

const EXECUTOR_URI: &str = "executor://volley-shell/v1";

/// Placeholder in the run command replaced by the quoted batch ids.
const TESTS_PLACEHOLDER: &str = "{tests}";

/// Adapter driven by user-supplied shell commands.
pub struct ShellFramework {
    config: ShellFrameworkConfig,
}

impl ShellFramework {
    /// Creates a shell adapter with the given configuration.
    pub fn new(config: ShellFrameworkConfig) -> Self {
        Self { config }
    }

    /// Parses discovery output: one test id per line, `#` comments and
    /// blank lines ignored.
    fn parse_discover_output(&self, output: &str) -> Vec<TestCase> {
        let mut tests = Vec::new();

        for line in output.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let source = trimmed.split("::").next().unwrap_or(trimmed);
            tests.push(TestCase::new(TestIdentity::new(trimmed, source, EXECUTOR_URI)));
        }

        tests
    }

    /// Substitutes the batch ids into the run command.
    fn substitute_tests(&self, tests: &[TestCase]) -> String {
        let quoted: String = tests
            .iter()
            .map(|t| shell_words::quote(t.name()).into_owned())
            .collect::<Vec<_>>()
            .join(" ");

        if self.config.run_command.contains(TESTS_PLACEHOLDER) {
            self.config.run_command.replace(TESTS_PLACEHOLDER, &quoted)
        } else {
            format!("{} {}", self.config.run_command, quoted)
        }
    }
}

#[async_trait]
impl TestFramework for ShellFramework {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn executor_uri(&self) -> &str {
        EXECUTOR_URI
    }

    async fn discover(&self, _paths: &[PathBuf]) -> FrameworkResult<Vec<TestCase>> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.config.discover_command)
            .output()
            .await
            .map_err(|e| FrameworkError::DiscoveryFailed(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(FrameworkError::DiscoveryFailed(format!(
                "discover command failed: {}",
                stderr
            )));
        }

        let tests = self.parse_discover_output(&stdout);

        if tests.is_empty() {
            tracing::warn!("discover command produced no tests. stdout: {stdout}");
        }

        Ok(tests)
    }

    fn run_command(&self, tests: &[TestCase], _result_file: Option<&str>) -> Command {
        Command::new("sh").arg("-c").arg(self.substitute_tests(tests))
    }

    fn result_file(&self) -> Option<String> {
        // The user's run command controls where it writes, so the path
        // comes from the config verbatim.
        self.config.result_file.clone()
    }

    fn parse_results(
        &self,
        tests: &[TestCase],
        output: &ExecResult,
        result_file: Option<&str>,
    ) -> FrameworkResult<Vec<TestResult>> {
        if let Some(xml) = result_file {
            let results = parse_junit_xml(tests, xml)?;
            if !results.is_empty() {
                return Ok(results);
            }
            tracing::warn!("result file held no matching testcases, falling back to exit code");
        }

        // Without structured results the exit code is all we know; it
        // applies to every test in the batch.
        let outcome = if output.success() {
            TestOutcome::Passed
        } else {
            TestOutcome::Failed
        };

        let per_test = output
            .duration
            .checked_div(tests.len().max(1) as u32)
            .unwrap_or_default();

        Ok(tests
            .iter()
            .map(|case| {
                let mut result = TestResult::new(case.identity.clone(), outcome)
                    .with_duration(per_test);
                if !output.success() {
                    result = result.with_error_message(format!(
                        "run command exited with {}",
                        output.exit_code
                    ));
                    let tail: String = output
                        .stderr
                        .lines()
                        .rev()
                        .take(10)
                        .collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .collect::<Vec<_>>()
                        .join("\n");
                    if !tail.is_empty() {
                        result = result.with_stack_trace(tail);
                    }
                }
                result
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn framework(run_command: &str) -> ShellFramework {
        ShellFramework::new(ShellFrameworkConfig {
            discover_command: "cat tests.txt".to_string(),
            run_command: run_command.to_string(),
            result_file: None,
        })
    }

    fn exec_result(exit_code: i32) -> ExecResult {
        ExecResult {
            exit_code,
            stdout: String::new(),
            stderr: "line one\nline two".to_string(),
            duration: Duration::from_secs(4),
        }
    }

    #[test]
    fn discover_output_skips_comments_and_blanks() {
        let output = "\
# suite manifest
suite::alpha

suite::beta
";
        let tests = framework("./run.sh {tests}").parse_discover_output(output);
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].name(), "suite::alpha");
        assert_eq!(tests[0].identity.source, "suite");
    }

    #[test]
    fn placeholder_is_replaced_with_quoted_ids() {
        let fw = framework("./run.sh --filter {tests} --junit");
        let batch = vec![
            TestCase::new(TestIdentity::new("suite::alpha", "suite", EXECUTOR_URI)),
            TestCase::new(TestIdentity::new("needs quoting", "suite", EXECUTOR_URI)),
        ];

        let cmd = fw.run_command(&batch, None);
        assert_eq!(cmd.program, "sh");
        assert_eq!(
            cmd.args[1],
            "./run.sh --filter suite::alpha 'needs quoting' --junit"
        );
    }

    #[test]
    fn ids_are_appended_without_placeholder() {
        let fw = framework("./run.sh");
        let batch = vec![TestCase::new(TestIdentity::new("suite::alpha", "suite", EXECUTOR_URI))];

        let cmd = fw.run_command(&batch, None);
        assert_eq!(cmd.args[1], "./run.sh suite::alpha");
    }

    #[test]
    fn zero_exit_code_passes_the_whole_batch() {
        let fw = framework("./run.sh");
        let batch = vec![
            TestCase::new(TestIdentity::new("suite::alpha", "suite", EXECUTOR_URI)),
            TestCase::new(TestIdentity::new("suite::beta", "suite", EXECUTOR_URI)),
        ];

        let results = fw.parse_results(&batch, &exec_result(0), None).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.outcome == TestOutcome::Passed));
        assert_eq!(results[0].duration, Duration::from_secs(2));
    }

    #[test]
    fn nonzero_exit_code_fails_the_whole_batch() {
        let fw = framework("./run.sh");
        let batch = vec![TestCase::new(TestIdentity::new("suite::alpha", "suite", EXECUTOR_URI))];

        let results = fw.parse_results(&batch, &exec_result(3), None).unwrap();
        assert_eq!(results[0].outcome, TestOutcome::Failed);
        assert_eq!(
            results[0].error_message.as_deref(),
            Some("run command exited with 3")
        );
        assert_eq!(results[0].stack_trace.as_deref(), Some("line one\nline two"));
    }

    #[test]
    fn junit_result_file_wins_over_exit_code() {
        let fw = ShellFramework::new(ShellFrameworkConfig {
            discover_command: "cat tests.txt".to_string(),
            run_command: "./run.sh".to_string(),
            result_file: Some("/tmp/results.xml".to_string()),
        });
        let batch = vec![TestCase::new(TestIdentity::new("suite::alpha", "suite", EXECUTOR_URI))];

        let xml = r#"<testcase classname="suite" name="alpha" time="0.2"><failure message="boom"/></testcase>"#;
        let results = fw.parse_results(&batch, &exec_result(0), Some(xml)).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, TestOutcome::Failed);
        assert_eq!(results[0].error_message.as_deref(), Some("boom"));
    }
}
