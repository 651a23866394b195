//! volley CLI - parallel test runner with buffered result reporting.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use volley::config::{self, FrameworkConfig, HostConfig};
use volley::framework::{
    TestFramework, cargo::CargoFramework, pytest::PytestFramework, shell::ShellFramework,
};
use volley::host::{HostProvider, local::LocalHostProvider, process::ProcessHostProvider};
use volley::report::{ConsoleReporter, JUnitReporter, MultiReporter};
use volley::runner::TestRunner;

#[derive(Parser)]
#[command(name = "volley")]
#[command(about = "Parallel test runner with buffered result reporting", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "volley.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        /// Override maximum parallel hosts
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Only discover tests, don't run them
        #[arg(long)]
        collect_only: bool,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Discover tests without running them
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Host type (local, process)
        #[arg(long, default_value = "local")]
        host: String,

        /// Test framework (cargo, pytest, shell)
        #[arg(short, long, default_value = "cargo")]
        framework: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    match dispatch(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(2);
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run {
            parallel,
            collect_only,
            junit,
        } => run_tests(&cli.config, parallel, collect_only, junit, cli.verbose).await,
        Commands::List { format } => list_tests(&cli.config, &format).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { host, framework } => init_config(&host, &framework),
    }
}

async fn run_tests(
    config_path: &Path,
    parallel_override: Option<usize>,
    collect_only: bool,
    junit_path: Option<PathBuf>,
    verbose: bool,
) -> Result<i32> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    if let Some(parallel) = parallel_override {
        config.runner.max_parallel = parallel;
    }
    config.validate()?;

    info!("loaded configuration from {}", config_path.display());

    // Dispatch to concrete host and framework types.
    match (&config.host, &config.framework) {
        (HostConfig::Local(h), FrameworkConfig::Cargo(f)) => {
            let provider = LocalHostProvider::new(h.clone());
            let framework = CargoFramework::new(f.clone());
            run_with(config, provider, framework, collect_only, junit_path, verbose).await
        }
        (HostConfig::Local(h), FrameworkConfig::Pytest(f)) => {
            let provider = LocalHostProvider::new(h.clone());
            let framework = PytestFramework::new(f.clone());
            run_with(config, provider, framework, collect_only, junit_path, verbose).await
        }
        (HostConfig::Local(h), FrameworkConfig::Shell(f)) => {
            let provider = LocalHostProvider::new(h.clone());
            let framework = ShellFramework::new(f.clone());
            run_with(config, provider, framework, collect_only, junit_path, verbose).await
        }
        (HostConfig::Process(h), FrameworkConfig::Cargo(f)) => {
            let provider = ProcessHostProvider::new(h.clone());
            let framework = CargoFramework::new(f.clone());
            run_with(config, provider, framework, collect_only, junit_path, verbose).await
        }
        (HostConfig::Process(h), FrameworkConfig::Pytest(f)) => {
            let provider = ProcessHostProvider::new(h.clone());
            let framework = PytestFramework::new(f.clone());
            run_with(config, provider, framework, collect_only, junit_path, verbose).await
        }
        (HostConfig::Process(h), FrameworkConfig::Shell(f)) => {
            let provider = ProcessHostProvider::new(h.clone());
            let framework = ShellFramework::new(f.clone());
            run_with(config, provider, framework, collect_only, junit_path, verbose).await
        }
    }
}

async fn run_with<P, F>(
    config: config::Config,
    provider: P,
    framework: F,
    collect_only: bool,
    junit_path: Option<PathBuf>,
    verbose: bool,
) -> Result<i32>
where
    P: HostProvider + 'static,
    F: TestFramework + 'static,
{
    info!("using host provider: {}", provider.name());
    info!("using framework: {}", framework.name());

    let tests = framework.discover(&[]).await?;

    if collect_only {
        println!("Discovered {} tests:", tests.len());
        for test in &tests {
            println!("  {}", test.name());
        }
        return Ok(0);
    }

    let reporter = create_reporter(&config, junit_path, verbose);
    let runner = TestRunner::new(config.runner, provider, framework, Arc::new(reporter));

    let summary = runner.run(&tests).await?;
    Ok(summary.exit_code())
}

async fn list_tests(config_path: &Path, format: &str) -> Result<i32> {
    let config = config::load_config(config_path)?;
    config.validate()?;

    let tests = match &config.framework {
        FrameworkConfig::Cargo(f) => CargoFramework::new(f.clone()).discover(&[]).await?,
        FrameworkConfig::Pytest(f) => PytestFramework::new(f.clone()).discover(&[]).await?,
        FrameworkConfig::Shell(f) => ShellFramework::new(f.clone()).discover(&[]).await?,
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&tests)?);
        }
        _ => {
            println!("Discovered {} tests:", tests.len());
            for test in &tests {
                let markers = if test.markers.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", test.markers.join(", "))
                };
                println!("  {}{}", test.name(), markers);
            }
        }
    }

    Ok(0)
}

fn validate_config(config_path: &Path) -> Result<i32> {
    let config = config::load_config(config_path)?;
    config.validate()?;

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Max parallel:  {}", config.runner.max_parallel);
    println!("  Test timeout:  {}s", config.runner.test_timeout_secs);
    println!("  Retry count:   {}", config.runner.retry_count);
    println!("  Cache size:    {}", config.runner.max_cache_size);
    println!("  Cache age:     {}s", config.runner.max_cache_age_secs);

    let host_name = match &config.host {
        HostConfig::Local(_) => "local",
        HostConfig::Process(_) => "process",
    };
    println!("  Host:          {}", host_name);

    let framework_name = match &config.framework {
        FrameworkConfig::Cargo(_) => "cargo",
        FrameworkConfig::Pytest(_) => "pytest",
        FrameworkConfig::Shell(_) => "shell",
    };
    println!("  Framework:     {}", framework_name);

    Ok(0)
}

fn init_config(host: &str, framework: &str) -> Result<i32> {
    let host_config = match host {
        "local" => {
            r#"[host]
type = "local"
working_dir = "."
shell = "/bin/sh""#
        }
        "process" => {
            r#"[host]
type = "process"
root_dir = "/tmp/volley"
shell = "/bin/sh"
# Optional command that prepares each scratch directory
# setup_command = "cp -r ./fixtures .""#
        }
        _ => bail!("unknown host type: {host}. Use: local, process"),
    };

    let framework_config = match framework {
        "cargo" => {
            r#"[framework]
type = "cargo""#
        }
        "pytest" => {
            r#"[framework]
type = "pytest"
paths = ["tests"]
python = "python""#
        }
        "shell" => {
            r#"[framework]
type = "shell"
discover_command = "cat tests.txt"
run_command = "./run-tests.sh {tests}""#
        }
        _ => bail!("unknown framework: {framework}. Use: cargo, pytest, shell"),
    };

    let config = format!(
        r#"# volley configuration file

[runner]
max_parallel = 4
test_timeout_secs = 900
retry_count = 0
max_cache_size = 10
max_cache_age_secs = 5

{}

{}

[report]
output_dir = "test-results"
junit = true
junit_file = "junit.xml"
"#,
        host_config, framework_config
    );

    let path = PathBuf::from("volley.toml");
    if path.exists() {
        bail!("volley.toml already exists. Remove it first or edit manually.");
    }

    std::fs::write(&path, config)?;
    println!("Created volley.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  volley run");

    Ok(0)
}

fn create_reporter(
    config: &config::Config,
    junit_override: Option<PathBuf>,
    verbose: bool,
) -> MultiReporter {
    let mut multi = MultiReporter::new().with_reporter(Box::new(ConsoleReporter::new(verbose)));

    if config.report.junit {
        let junit_path = junit_override.unwrap_or_else(|| config.report.junit_path());
        multi = multi.with_reporter(Box::new(JUnitReporter::new(junit_path)));
    }

    multi
}
