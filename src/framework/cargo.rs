//! Cargo framework adapter, backed by `cargo nextest`.
//!
//! Discovery runs `cargo nextest list` and keeps every listed test path.
//! Execution filters a batch with nextest's expression language
//! (`test(=path) | test(=path)`), so one process runs exactly the batch.
//! Results come from nextest's status lines, or from JUnit XML when the
//! runner retrieved one (nextest writes it when `.config/nextest.toml`
//! asks for it).
//!
//! ```toml
//! [framework]
//! type = "cargo"
//! package = "my-crate"
//! features = ["test-utils"]
//! ```

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::pytest::parse_junit_xml;
use super::{
    FrameworkError, FrameworkResult, TestCase, TestFramework, TestIdentity, TestOutcome,
    TestResult,
};
use crate::config::CargoFrameworkConfig;
use crate::host::{Command, ExecResult};

const EXECUTOR_URI: &str = "executor://volley-cargo/v1";

/// Adapter for Rust projects using `cargo nextest`.
pub struct CargoFramework {
    config: CargoFrameworkConfig,
}

impl CargoFramework {
    /// Creates a cargo adapter with the given configuration.
    pub fn new(config: CargoFrameworkConfig) -> Self {
        Self { config }
    }

    /// Parses `cargo nextest list` output into test cases.
    ///
    /// Listing lines carry the test path as the whitespace-separated part
    /// containing `::`; build chatter is skipped.
    fn parse_list_output(&self, output: &str) -> Vec<TestCase> {
        let mut tests = Vec::new();

        for line in output.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty()
                || trimmed.starts_with("Compiling")
                || trimmed.starts_with("Finished")
            {
                continue;
            }

            if let Some(test_path) = trimmed.split_whitespace().find(|s| s.contains("::")) {
                let source = test_path
                    .rsplit_once("::")
                    .map(|(module, _)| module)
                    .unwrap_or(test_path);
                tests.push(TestCase::new(TestIdentity::new(
                    test_path,
                    source,
                    EXECUTOR_URI,
                )));
            }
        }

        tests
    }

    fn common_args(&self, mut cmd: Command) -> Command {
        if let Some(package) = &self.config.package {
            cmd = cmd.arg("-p").arg(package);
        }
        if !self.config.features.is_empty() {
            cmd = cmd.arg("--features").arg(self.config.features.join(","));
        }
        if let Some(bin) = &self.config.bin {
            cmd = cmd.arg("--bin").arg(bin);
        }
        if self.config.include_ignored {
            cmd = cmd.arg("--run-ignored").arg("only");
        }
        cmd
    }
}

#[async_trait]
impl TestFramework for CargoFramework {
    fn name(&self) -> &'static str {
        "cargo"
    }

    fn executor_uri(&self) -> &str {
        EXECUTOR_URI
    }

    async fn discover(&self, _paths: &[PathBuf]) -> FrameworkResult<Vec<TestCase>> {
        let list_cmd = self.common_args(Command::new("cargo").arg("nextest").arg("list"));

        let output = tokio::process::Command::new(&list_cmd.program)
            .args(&list_cmd.args)
            .output()
            .await
            .map_err(|e| FrameworkError::DiscoveryFailed(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(FrameworkError::DiscoveryFailed(format!(
                "cargo nextest list failed: {}",
                stderr
            )));
        }

        let tests = self.parse_list_output(&stdout);

        if tests.is_empty() {
            tracing::warn!("no tests discovered. stdout: {stdout}, stderr: {stderr}");
        }

        Ok(tests)
    }

    fn run_command(&self, tests: &[TestCase], _result_file: Option<&str>) -> Command {
        let cmd = self.common_args(
            Command::new("cargo")
                .arg("nextest")
                .arg("run")
                .arg("--no-fail-fast"),
        );

        let filter_expr: String = tests
            .iter()
            .map(|t| format!("test(={})", t.name()))
            .collect::<Vec<_>>()
            .join(" | ");

        cmd.arg("-E").arg(filter_expr)
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
        }

        parse_nextest_output(tests, &output.stdout, &output.stderr)
    }
}

/// Parses nextest's per-test status lines.
///
/// Lines look like `PASS [   0.004s] my-crate tests::math::adds`; nextest
/// writes them to stderr, so both streams are scanned.
fn parse_nextest_output(
    tests: &[TestCase],
    stdout: &str,
    stderr: &str,
) -> FrameworkResult<Vec<TestResult>> {
    let status_re = Regex::new(
        r"(?m)^\s*(PASS|FAIL|SKIP|TIMEOUT)\s+\[\s*([0-9.]+)s\]\s+\S+\s+(\S+)\s*$",
    )
    .expect("static regex");

    let mut results = Vec::new();

    for source in [stdout, stderr] {
        for cap in status_re.captures_iter(source) {
            let outcome = match &cap[1] {
                "PASS" => TestOutcome::Passed,
                "FAIL" | "TIMEOUT" => TestOutcome::Failed,
                "SKIP" => TestOutcome::Skipped,
                _ => continue,
            };
            let duration = cap[2].parse().map(Duration::from_secs_f64).unwrap_or_default();
            let path = &cap[3];

            let Some(case) = tests
                .iter()
                .find(|t| t.name() == path || t.name().ends_with(path))
            else {
                continue;
            };

            // The same test can appear in both streams; keep the first.
            if results
                .iter()
                .any(|r: &TestResult| r.identity.id == case.identity.id)
            {
                continue;
            }

            results.push(
                TestResult::new(case.identity.clone(), outcome).with_duration(duration),
            );
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framework() -> CargoFramework {
        CargoFramework::new(CargoFrameworkConfig::default())
    }

    fn case(name: &str) -> TestCase {
        TestCase::new(TestIdentity::new(name, "tests", EXECUTOR_URI))
    }

    #[test]
    fn list_output_extracts_test_paths() {
        let output = "\
   Compiling my-crate v0.1.0
    Finished test [unoptimized + debuginfo] target(s)
my-crate tests::math::adds
my-crate tests::math::subtracts
";
        let tests = framework().parse_list_output(output);
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].name(), "tests::math::adds");
        assert_eq!(tests[0].identity.source, "tests::math");
    }

    #[test]
    fn run_command_builds_filter_expression() {
        let batch = vec![case("tests::math::adds"), case("tests::math::subtracts")];
        let cmd = framework().run_command(&batch, None);

        let expr_pos = cmd.args.iter().position(|a| a == "-E").unwrap();
        assert_eq!(
            cmd.args[expr_pos + 1],
            "test(=tests::math::adds) | test(=tests::math::subtracts)"
        );
    }

    #[test]
    fn run_command_carries_package_options() {
        let framework = CargoFramework::new(CargoFrameworkConfig {
            package: Some("my-crate".into()),
            features: vec!["extra".into()],
            ..Default::default()
        });
        let cmd = framework.run_command(&[case("t::a")], None);
        let rendered = cmd.to_shell_string();

        assert!(rendered.contains("-p my-crate"));
        assert!(rendered.contains("--features extra"));
        assert!(rendered.contains("--no-fail-fast"));
    }

    #[test]
    fn nextest_status_lines_bind_to_batch() {
        let batch = vec![case("tests::math::adds"), case("tests::math::subtracts")];
        let stderr = "\
        PASS [   0.004s] my-crate tests::math::adds
        FAIL [   0.102s] my-crate tests::math::subtracts
";

        let results = parse_nextest_output(&batch, "", stderr).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].outcome, TestOutcome::Passed);
        assert_eq!(results[0].duration, Duration::from_secs_f64(0.004));
        assert_eq!(results[1].outcome, TestOutcome::Failed);
        assert_eq!(results[1].identity.id, batch[1].identity.id);
    }

    #[test]
    fn duplicate_status_lines_keep_first_result() {
        let batch = vec![case("tests::math::adds")];
        let text = "PASS [   0.004s] my-crate tests::math::adds\n";

        let results = parse_nextest_output(&batch, text, text).unwrap();
        assert_eq!(results.len(), 1);
    }
}
