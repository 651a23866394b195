//! JUnit XML report generation.
//!
//! Accumulates results across flushes and writes a single JUnit XML
//! file when the run completes. The output follows the common schema
//! consumed by CI systems: a `testsuites` root, one `testsuite` with
//! aggregate counts, and a `testcase` per result.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::cache::RunStatistics;
use crate::framework::{TestCase, TestIdentity, TestOutcome, TestResult};
use crate::report::Reporter;
use crate::runner::RunSummary;

/// Reporter that renders the run as a JUnit XML file.
pub struct JUnitReporter {
    output_path: PathBuf,
    testsuite_name: String,
    results: Mutex<Vec<TestResult>>,
}

impl JUnitReporter {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            testsuite_name: "volley".to_string(),
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn with_testsuite_name(mut self, name: impl Into<String>) -> Self {
        self.testsuite_name = name.into();
        self
    }

    fn generate_xml(&self, results: &[TestResult], duration: Duration) -> anyhow::Result<String> {
        let failures = results
            .iter()
            .filter(|r| r.outcome == TestOutcome::Failed)
            .count();
        let errors = results
            .iter()
            .filter(|r| r.outcome == TestOutcome::NotFound)
            .count();
        let skipped = results
            .iter()
            .filter(|r| r.outcome == TestOutcome::Skipped)
            .count();

        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::Start(BytesStart::new("testsuites")))?;

        let mut suite = BytesStart::new("testsuite");
        suite.push_attribute(("name", self.testsuite_name.as_str()));
        suite.push_attribute(("tests", results.len().to_string().as_str()));
        suite.push_attribute(("failures", failures.to_string().as_str()));
        suite.push_attribute(("errors", errors.to_string().as_str()));
        suite.push_attribute(("skipped", skipped.to_string().as_str()));
        suite.push_attribute(("time", format!("{:.3}", duration.as_secs_f64()).as_str()));
        writer.write_event(Event::Start(suite))?;

        for result in results {
            let (classname, name) = parse_test_id(&result.identity.fully_qualified_name);
            let mut case = BytesStart::new("testcase");
            case.push_attribute(("classname", classname.as_str()));
            case.push_attribute(("name", name.as_str()));
            case.push_attribute((
                "time",
                format!("{:.3}", result.duration.as_secs_f64()).as_str(),
            ));

            match result.outcome {
                TestOutcome::Failed => {
                    writer.write_event(Event::Start(case))?;

                    let mut failure = BytesStart::new("failure");
                    if let Some(message) = &result.error_message {
                        failure.push_attribute(("message", message.as_str()));
                    }

                    let body = result
                        .stack_trace
                        .clone()
                        .unwrap_or_else(|| result.stderr_text());
                    if body.is_empty() {
                        writer.write_event(Event::Empty(failure))?;
                    } else {
                        writer.write_event(Event::Start(failure))?;
                        writer.write_event(Event::Text(BytesText::new(&body)))?;
                        writer.write_event(Event::End(BytesEnd::new("failure")))?;
                    }

                    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
                }
                TestOutcome::NotFound => {
                    writer.write_event(Event::Start(case))?;

                    let mut error = BytesStart::new("error");
                    let message = result
                        .error_message
                        .as_deref()
                        .unwrap_or("test never reported a result");
                    error.push_attribute(("message", message));
                    writer.write_event(Event::Empty(error))?;

                    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
                }
                TestOutcome::Skipped => {
                    writer.write_event(Event::Start(case))?;
                    writer.write_event(Event::Empty(BytesStart::new("skipped")))?;
                    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
                }
                TestOutcome::Passed | TestOutcome::None => {
                    writer.write_event(Event::Empty(case))?;
                }
            }
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }
}

impl Reporter for JUnitReporter {
    fn on_discovery_complete(&self, _tests: &[TestCase]) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_run_changed(
        &self,
        _stats: &RunStatistics,
        results: &[TestResult],
        _in_progress: &[TestIdentity],
    ) -> anyhow::Result<()> {
        self.results.lock().unwrap().extend_from_slice(results);
        Ok(())
    }

    fn on_run_complete(&self, summary: &RunSummary) -> anyhow::Result<()> {
        let results = self.results.lock().unwrap();
        let xml = self.generate_xml(&results, summary.duration)?;

        if let Some(parent) = self.output_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create report directory: {}", parent.display())
            })?;
        }
        fs::write(&self.output_path, xml).with_context(|| {
            format!(
                "failed to write JUnit report: {}",
                self.output_path.display()
            )
        })?;

        tracing::info!("wrote JUnit report to {}", self.output_path.display());
        Ok(())
    }
}

/// Splits a fully qualified test name at its last `::` separator into
/// JUnit's `classname`/`name` pair.
fn parse_test_id(fully_qualified_name: &str) -> (String, String) {
    match fully_qualified_name.rsplit_once("::") {
        Some((classname, name)) => (classname.to_string(), name.to_string()),
        None => (String::new(), fully_qualified_name.to_string()),
    }
}
