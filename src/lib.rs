//! volley: a parallel test runner with buffered result reporting.
//!
//! This crate runs test suites in parallel across execution hosts and
//! aggregates their results through a bounded, concurrently-mutated run
//! cache that flushes to reporters by size and by age.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Cache**: the run result cache and statistics accumulator at the
//!   center of the pipeline ([`cache::TestRunCache`])
//! - **Frameworks**: discover tests and parse their output (cargo
//!   nextest, pytest, shell)
//! - **Hosts**: where test commands execute (local, isolated process)
//! - **Runner**: schedules batches, feeds the cache, retries failures
//! - **Report**: consumes cache flushes (console, JUnit XML)
//!
//! # Example
//!
//! ```no_run
//! use volley::config::load_config;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = load_config(std::path::Path::new("volley.toml"))?;
//! config.validate()?;
//! // ... construct a host provider, framework, and reporter,
//! //     then hand them to runner::TestRunner ...
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod framework;
pub mod host;
pub mod report;
pub mod runner;

// Re-export commonly used types
pub use cache::{RunStatistics, TestRunCache};
pub use config::{Config, load_config};
pub use framework::{TestCase, TestFramework, TestIdentity, TestOutcome, TestResult};
pub use host::{ExecutionHost, HostProvider};
pub use report::Reporter;
pub use runner::{RunSummary, TestRunner};
