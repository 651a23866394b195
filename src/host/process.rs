//! Process execution host with per-host scratch directories.
//!
//! Unlike the [`local`](super::local) host, each process host gets its own
//! working directory under a configurable root, created at host creation
//! and removed at termination. An optional setup command populates the
//! directory (checking out sources, creating a virtualenv, and so on).
//! Tests running on different hosts cannot trample each other's files.
//!
//! # Example configuration
//!
//! ```toml
//! [host]
//! type = "process"
//! root_dir = "/tmp/volley-work"
//! setup_command = "cp -r /srv/project/. ."
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::local::copy_dir_all;
use super::{
    Command, ExecResult, ExecutionHost, HostError, HostProvider, HostResult, HostSpec, OutputLine,
    OutputStream,
};
use crate::config::ProcessHostConfig;

/// Provider that creates [`ProcessHost`]s with isolated scratch
/// directories.
pub struct ProcessHostProvider {
    config: ProcessHostConfig,
}

impl ProcessHostProvider {
    /// Creates a provider with the given configuration.
    pub fn new(config: ProcessHostConfig) -> Self {
        Self { config }
    }

    fn root_dir(&self) -> PathBuf {
        self.config
            .root_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[async_trait]
impl HostProvider for ProcessHostProvider {
    type Host = ProcessHost;

    async fn create_host(&self, spec: &HostSpec) -> HostResult<ProcessHost> {
        let working_dir = spec
            .working_dir
            .clone()
            .unwrap_or_else(|| self.root_dir().join(&spec.id));

        tokio::fs::create_dir_all(&working_dir)
            .await
            .map_err(|e| HostError::CreateFailed(e.to_string()))?;

        let mut env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(spec.env.iter().cloned());

        let host = ProcessHost {
            id: spec.id.clone(),
            working_dir,
            env,
            shell: self.config.shell.clone(),
        };

        if let Some(setup) = &self.config.setup_command {
            tracing::debug!(host = %host.id, "running host setup command");
            let result = host
                .exec(&Command::new("sh").arg("-c").arg(setup))
                .await?;
            if !result.success() {
                return Err(HostError::CreateFailed(format!(
                    "setup command exited with {}: {}",
                    result.exit_code,
                    result.stderr.trim()
                )));
            }
        }

        Ok(host)
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

/// A host whose commands run inside a private scratch directory.
///
/// Termination removes the directory, so anything a test wants to keep
/// must be downloaded first.
#[derive(Debug)]
pub struct ProcessHost {
    id: String,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    shell: String,
}

impl ProcessHost {
    /// The scratch directory this host runs in.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

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
impl ExecutionHost for ProcessHost {
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
        match tokio::fs::remove_dir_all(&self.working_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HostError::Io(e)),
        }
    }
}
