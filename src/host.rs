//! Execution host abstraction.
//!
//! An *execution host* is the environment a test command runs in. Hosts
//! are created by a [`HostProvider`] and expose command execution, output
//! streaming, and file transfer. The runner acquires hosts from a pool,
//! executes framework-generated commands on them, and returns them for
//! reuse.
//!
//! # Built-in hosts
//!
//! | Implementation | Isolation |
//! |----------------|-----------|
//! | [`local`](crate::host::local) | none; commands run in the project directory |
//! | [`process`](crate::host::process) | scratch working directory per host |

pub mod local;
pub mod process;

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use thiserror::Error;

/// Result type for host operations.
pub type HostResult<T> = Result<T, HostError>;

/// Errors that can occur during host operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// Host creation failed.
    #[error("failed to create host: {0}")]
    CreateFailed(String),

    /// Command execution failed.
    #[error("command execution failed: {0}")]
    ExecFailed(String),

    /// File upload failed.
    #[error("file upload failed: {0}")]
    UploadFailed(String),

    /// File download failed.
    #[error("file download failed: {0}")]
    DownloadFailed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A command to execute on a host.
///
/// Built with a fluent API and rendered to a shell string by the host:
///
/// ```
/// use volley::host::Command;
///
/// let cmd = Command::new("pytest")
///     .arg("-v")
///     .arg("tests/test_math.py")
///     .env("PYTHONDONTWRITEBYTECODE", "1")
///     .timeout(300);
///
/// assert_eq!(cmd.to_shell_string(), "pytest -v tests/test_math.py");
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    /// Program to execute.
    pub program: String,
    /// Arguments to pass.
    pub args: Vec<String>,
    /// Working directory override.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Timeout in seconds.
    pub timeout_secs: Option<u64>,
}

impl Command {
    /// Creates a command for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout_secs: None,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the timeout in seconds.
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// The timeout as a [`Duration`], if set.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Renders the command as a shell string with escaped arguments.
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_escape(&self.program)];
        parts.extend(self.args.iter().map(|a| shell_escape(a)));
        parts.join(" ")
    }
}

/// Quotes a shell argument when it contains characters that need it.
fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    let needs_quoting = arg
        .chars()
        .any(|c| !(c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ',')));

    if needs_quoting {
        format!("'{}'", arg.replace('\'', r"'\''"))
    } else {
        arg.to_string()
    }
}

/// Result of executing a command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Process exit code (-1 if terminated by a signal).
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock execution time.
    pub duration: Duration,
}

impl ExecResult {
    /// True if the command exited with code zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One line of streamed command output.
///
/// Streams end with a single `ExitCode` item once both pipes close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
    ExitCode(i32),
}

/// Stream of output lines from a running command.
///
/// Each item is an `Ok` line, or an `Err` when the command's timeout
/// expires; the stream ends after yielding an error.
pub type OutputStream = Pin<Box<dyn Stream<Item = HostResult<OutputLine>> + Send>>;

/// Ends `inner` with a [`HostError::Timeout`] item if it has not
/// finished within `limit`.
///
/// The inner stream is dropped once the deadline fires; hosts spawn
/// streamed children with `kill_on_drop`, so expiry also stops the
/// child process.
pub(crate) fn deadline_stream(
    inner: OutputStream,
    limit: Duration,
) -> impl Stream<Item = HostResult<OutputLine>> + Send {
    let deadline = tokio::time::Instant::now() + limit;
    futures::stream::unfold(Some(inner), move |state| async move {
        let mut inner = state?;
        match tokio::time::timeout_at(deadline, inner.next()).await {
            Ok(Some(item)) => Some((item, Some(inner))),
            Ok(None) => None,
            Err(_) => Some((
                Err(HostError::Timeout(format!(
                    "command timed out after {}s",
                    limit.as_secs()
                ))),
                None,
            )),
        }
    })
}

/// Runtime parameters for creating one host.
///
/// Providers merge this with their own configuration; the spec wins where
/// both set a value.
#[derive(Debug, Clone, Default)]
pub struct HostSpec {
    /// Unique id for the host, used in logs and scratch paths.
    pub id: String,
    /// Working directory override.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

/// An environment that executes test commands.
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    /// Unique id of this host.
    fn id(&self) -> &str;

    /// Executes a command to completion, capturing output.
    async fn exec(&self, cmd: &Command) -> HostResult<ExecResult>;

    /// Executes a command, streaming output lines as they appear.
    async fn exec_stream(&self, cmd: &Command) -> HostResult<OutputStream>;

    /// Copies a local file or directory into the host.
    async fn upload(&self, local: &Path, remote: &Path) -> HostResult<()>;

    /// Copies a file or directory out of the host.
    async fn download(&self, remote: &Path, local: &Path) -> HostResult<()>;

    /// Releases the host's resources.
    async fn terminate(&self) -> HostResult<()>;
}

/// Creates execution hosts.
#[async_trait]
pub trait HostProvider: Send + Sync {
    /// The host type this provider creates.
    type Host: ExecutionHost;

    /// Creates a host for the given spec.
    async fn create_host(&self, spec: &HostSpec) -> HostResult<Self::Host>;

    /// Provider name for logs and display.
    fn name(&self) -> &'static str;
}
