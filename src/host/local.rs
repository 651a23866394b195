//! Local execution host.
//!
//! Runs test commands as child processes in the project's working
//! directory, with no isolation. This is the fastest host and the right
//! default for development machines and simple CI jobs.
//!
//! # Example configuration
//!
//! ```toml
//! [host]
//! type = "local"
//! working_dir = "~/projects/my-app"
//! shell = "/bin/bash"
//!
//! [host.env]
//! PYTHONPATH = "src"
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{
    Command, ExecResult, ExecutionHost, HostError, HostProvider, HostResult, HostSpec, OutputLine,
    OutputStream,
};
use crate::config::LocalHostConfig;

/// Provider that creates [`LocalHost`]s.
///
/// Each host is just a logical grouping sharing the provider's working
/// directory and environment; commands run as children of the runner
/// process itself.
pub struct LocalHostProvider {
    config: LocalHostConfig,
}

impl LocalHostProvider {
    /// Creates a provider with the given configuration.
    pub fn new(config: LocalHostConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl HostProvider for LocalHostProvider {
    type Host = LocalHost;

    async fn create_host(&self, spec: &HostSpec) -> HostResult<LocalHost> {
        let working_dir = spec
            .working_dir
            .clone()
            .or_else(|| {
                self.config
                    .working_dir
                    .as_ref()
                    .map(|dir| expand_path(dir))
            })
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(spec.env.iter().cloned());

        Ok(LocalHost {
            id: spec.id.clone(),
            working_dir,
            env,
            shell: self.config.shell.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Expands `~` in a configured path.
fn expand_path(dir: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&dir.to_string_lossy()).into_owned())
}

/// A host that runs commands as local child processes.
///
/// Commands go through the configured shell (default `/bin/sh`), so the
/// framework adapters can rely on shell semantics. Upload and download
/// are plain filesystem copies relative to the working directory.
/// Termination is a no-op since processes are transient.
pub struct LocalHost {
    id: String,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    shell: String,
}

impl LocalHost {
    fn build_process(&self, cmd: &Command) -> tokio::process::Command {
        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-c").arg(cmd.to_shell_string());
        process.current_dir(&self.working_dir);

        for (key, value) in &self.env {
            process.env(key, value);
        }
        for (key, value) in &cmd.env {
            process.env(key, value);
        }

        if let Some(dir) = &cmd.working_dir {
            process.current_dir(dir);
        }

        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process
    }
}

#[async_trait]
impl ExecutionHost for LocalHost {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(&self, cmd: &Command) -> HostResult<ExecResult> {
        let start = Instant::now();
        let mut process = self.build_process(cmd);

        let output = if let Some(timeout) = cmd.timeout_duration() {
            tokio::time::timeout(timeout, process.output())
                .await
                .map_err(|_| {
                    HostError::Timeout(format!(
                        "command timed out after {}s",
                        timeout.as_secs()
                    ))
                })?
                .map_err(|e| HostError::ExecFailed(e.to_string()))?
        } else {
            process
                .output()
                .await
                .map_err(|e| HostError::ExecFailed(e.to_string()))?
        };

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        })
    }

    async fn exec_stream(&self, cmd: &Command) -> HostResult<OutputStream> {
        let mut process = self.build_process(cmd);
        // Dropping the stream must not leave the child running; the
        // deadline below relies on this to stop hung commands.
        process.kill_on_drop(true);

        let mut child = process
            .spawn()
            .map_err(|e| HostError::ExecFailed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::ExecFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HostError::ExecFailed("stderr not captured".to_string()))?;

        let stdout_stream = tokio_stream::wrappers::LinesStream::new(
            BufReader::new(stdout).lines(),
        )
        .map(|line: Result<String, std::io::Error>| match line {
            Ok(text) => Ok(OutputLine::Stdout(text)),
            Err(e) => {
                tracing::warn!("error reading stdout line: {e}");
                Ok(OutputLine::Stdout(String::new()))
            }
        });
        let stderr_stream = tokio_stream::wrappers::LinesStream::new(
            BufReader::new(stderr).lines(),
        )
        .map(|line: Result<String, std::io::Error>| match line {
            Ok(text) => Ok(OutputLine::Stderr(text)),
            Err(e) => {
                tracing::warn!("error reading stderr line: {e}");
                Ok(OutputLine::Stderr(String::new()))
            }
        });

        // Both pipes reach EOF before wait() resolves, so the exit code
        // is always the final item.
        let exit = stream::once(async move {
            let code = child
                .wait()
                .await
                .map(|status| status.code().unwrap_or(-1))
                .unwrap_or(-1);
            Ok(OutputLine::ExitCode(code))
        });

        let full: OutputStream =
            Box::pin(stream::select(stdout_stream, stderr_stream).chain(exit));

        match cmd.timeout_duration() {
            Some(limit) => Ok(Box::pin(super::deadline_stream(full, limit))),
            None => Ok(full),
        }
    }

    async fn upload(&self, local: &Path, remote: &Path) -> HostResult<()> {
        let dest = self.working_dir.join(remote);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HostError::UploadFailed(e.to_string()))?;
        }

        if local.is_dir() {
            copy_dir_all(local, &dest)
                .await
                .map_err(|e| HostError::UploadFailed(e.to_string()))?;
        } else {
            tokio::fs::copy(local, &dest)
                .await
                .map_err(|e| HostError::UploadFailed(e.to_string()))?;
        }

        Ok(())
    }

    async fn download(&self, remote: &Path, local: &Path) -> HostResult<()> {
        // Absolute remote paths (e.g. the per-batch JUnit XML under the
        // temp dir) are taken as is; relative ones resolve against the
        // working directory.
        let src = if remote.is_absolute() {
            remote.to_path_buf()
        } else {
            self.working_dir.join(remote)
        };

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HostError::DownloadFailed(e.to_string()))?;
        }

        if src.is_dir() {
            copy_dir_all(&src, local)
                .await
                .map_err(|e| HostError::DownloadFailed(e.to_string()))?;
        } else {
            tokio::fs::copy(&src, local)
                .await
                .map_err(|e| HostError::DownloadFailed(e.to_string()))?;
        }

        Ok(())
    }

    async fn terminate(&self) -> HostResult<()> {
        Ok(())
    }
}

/// Recursively copy a directory.
pub(crate) async fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dst).await?;

    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let ty = entry.file_type().await?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if ty.is_dir() {
            Box::pin(copy_dir_all(&src_path, &dst_path)).await?;
        } else {
            tokio::fs::copy(&src_path, &dst_path).await?;
        }
    }

    Ok(())
}
