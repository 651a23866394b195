//! Configuration schema definitions.
//!
//! All types here deserialize from the TOML configuration file. Host and
//! framework selection use internally tagged enums; every numeric knob
//! has a serde default so a minimal file stays minimal.
//!
//! # Schema overview
//!
//! ```text
//! Config (root)
//! ├── RunnerConfig        - parallelism, timeouts, retries, cache tuning
//! ├── HostConfig          - tagged enum selecting the execution host
//! │   ├── local           - child processes in the project directory
//! │   └── process         - isolated scratch directory per host
//! ├── FrameworkConfig     - tagged enum selecting the test framework
//! │   ├── cargo           - cargo nextest
//! │   ├── pytest          - pytest
//! │   └── shell           - user-supplied discover/run commands
//! └── ReportConfig        - output directory and JUnit settings
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Root configuration.
///
/// # TOML structure
///
/// ```toml
/// [runner]
/// max_parallel = 4
/// retry_count = 1
/// max_cache_size = 10
/// max_cache_age_secs = 5
///
/// [host]
/// type = "local"
///
/// [framework]
/// type = "pytest"
/// paths = ["tests"]
///
/// [report]
/// output_dir = "test-results"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Runner settings.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Execution host selection and settings.
    pub host: HostConfig,

    /// Test framework selection and settings.
    pub framework: FrameworkConfig,

    /// Report output settings.
    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    /// Rejects invalid settings before a run starts.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.runner.max_parallel == 0 {
            bail!("runner.max_parallel must be greater than zero");
        }
        if self.runner.test_timeout_secs == 0 {
            bail!("runner.test_timeout_secs must be greater than zero");
        }
        if self.runner.max_cache_size == 0 {
            bail!("runner.max_cache_size must be greater than zero");
        }
        if self.runner.max_cache_age_secs == 0 {
            bail!("runner.max_cache_age_secs must be greater than zero");
        }

        if let FrameworkConfig::Shell(shell) = &self.framework {
            if shell.discover_command.trim().is_empty() {
                bail!("framework.discover_command must not be empty");
            }
            if shell.run_command.trim().is_empty() {
                bail!("framework.run_command must not be empty");
            }
        }

        Ok(())
    }
}

/// Core runner settings.
///
/// The cache knobs control the run result cache: `max_cache_size` is the
/// combined in-progress plus buffered count that triggers a flush, and
/// `max_cache_age_secs` is the interval of the periodic flush timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum number of test batches executing at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Timeout for one batch execution, in seconds.
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,

    /// How many times a failed test is retried.
    #[serde(default)]
    pub retry_count: usize,

    /// Result cache flush threshold (in-progress + completed).
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    /// Result cache flush interval, in seconds.
    #[serde(default = "default_max_cache_age_secs")]
    pub max_cache_age_secs: u64,

    /// Stream test output through the log as it is produced.
    #[serde(default)]
    pub stream_output: bool,

    /// Working directory for the run.
    pub working_dir: Option<PathBuf>,
}

impl RunnerConfig {
    /// The cache flush interval as a [`Duration`].
    pub fn max_cache_age(&self) -> Duration {
        Duration::from_secs(self.max_cache_age_secs)
    }

    /// The batch timeout as a [`Duration`].
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            test_timeout_secs: default_test_timeout_secs(),
            retry_count: 0,
            max_cache_size: default_max_cache_size(),
            max_cache_age_secs: default_max_cache_age_secs(),
            stream_output: false,
            working_dir: None,
        }
    }
}

fn default_max_parallel() -> usize {
    4
}

fn default_test_timeout_secs() -> u64 {
    900
}

fn default_max_cache_size() -> usize {
    10
}

fn default_max_cache_age_secs() -> u64 {
    5
}

/// Execution host selection.
///
/// ```toml
/// [host]
/// type = "local"        # or "process"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HostConfig {
    /// Run commands directly on this machine.
    Local(LocalHostConfig),
    /// Run commands in per-host scratch directories.
    Process(ProcessHostConfig),
}

/// Settings for the local host.
///
/// ```toml
/// [host]
/// type = "local"
/// working_dir = "~/projects/my-app"
/// shell = "/bin/bash"
///
/// [host.env]
/// RUST_BACKTRACE = "1"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalHostConfig {
    /// Working directory for commands. `~` is expanded. Defaults to the
    /// current directory.
    pub working_dir: Option<PathBuf>,

    /// Environment variables set for every command.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Shell used to run commands.
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for LocalHostConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            env: HashMap::new(),
            shell: default_shell(),
        }
    }
}

/// Settings for the process host.
///
/// ```toml
/// [host]
/// type = "process"
/// root_dir = "/tmp/volley-work"
/// setup_command = "cp -r /srv/project/. ."
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessHostConfig {
    /// Directory under which scratch directories are created. Defaults to
    /// the system temp directory.
    pub root_dir: Option<PathBuf>,

    /// Shell used to run commands.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Environment variables set for every command.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Command run once inside the fresh scratch directory to prepare it.
    pub setup_command: Option<String>,
}

impl Default for ProcessHostConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            shell: default_shell(),
            env: HashMap::new(),
            setup_command: None,
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Test framework selection.
///
/// ```toml
/// [framework]
/// type = "pytest"       # or "cargo", "shell"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FrameworkConfig {
    /// Rust tests via cargo nextest.
    Cargo(CargoFrameworkConfig),
    /// Python tests via pytest.
    Pytest(PytestFrameworkConfig),
    /// Custom shell commands.
    Shell(ShellFrameworkConfig),
}

/// Settings for the cargo framework.
///
/// ```toml
/// [framework]
/// type = "cargo"
/// package = "my-crate"
/// features = ["test-utils"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CargoFrameworkConfig {
    /// Package to test, for workspaces.
    pub package: Option<String>,

    /// Cargo features to enable.
    #[serde(default)]
    pub features: Vec<String>,

    /// Binary target to test.
    pub bin: Option<String>,

    /// Also run `#[ignore]` tests.
    #[serde(default)]
    pub include_ignored: bool,
}

/// Settings for the pytest framework.
///
/// ```toml
/// [framework]
/// type = "pytest"
/// paths = ["tests"]
/// markers = "not slow and not integration"
/// python = "python3"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PytestFrameworkConfig {
    /// Directories searched during discovery.
    #[serde(default = "default_pytest_paths")]
    pub paths: Vec<PathBuf>,

    /// Marker filter expression.
    pub markers: Option<String>,

    /// Extra arguments passed to pytest.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Python interpreter.
    #[serde(default = "default_python")]
    pub python: String,
}

impl Default for PytestFrameworkConfig {
    fn default() -> Self {
        Self {
            paths: default_pytest_paths(),
            markers: None,
            extra_args: Vec::new(),
            python: default_python(),
        }
    }
}

fn default_pytest_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("tests")]
}

fn default_python() -> String {
    "python".to_string()
}

/// Settings for the shell framework.
///
/// `discover_command` prints one test id per line; `run_command` runs a
/// batch, with `{tests}` replaced by the quoted test ids.
///
/// ```toml
/// [framework]
/// type = "shell"
/// discover_command = "cat tests.txt"
/// run_command = "./run-tests.sh {tests}"
/// result_file = "/tmp/results.xml"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShellFrameworkConfig {
    /// Command that lists test ids, one per line. Lines starting with `#`
    /// are ignored.
    pub discover_command: String,

    /// Command that runs a batch of tests.
    pub run_command: String,

    /// Where the run command writes JUnit XML, if it does.
    pub result_file: Option<String>,
}

/// Report output settings.
///
/// ```toml
/// [report]
/// output_dir = "test-results"
/// junit = true
/// junit_file = "junit.xml"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Directory for generated reports.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Write a JUnit XML report.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// File name of the JUnit report inside `output_dir`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl ReportConfig {
    /// Full path of the JUnit report.
    pub fn junit_path(&self) -> PathBuf {
        self.output_dir.join(&self.junit_file)
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            junit: true,
            junit_file: default_junit_file(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}
