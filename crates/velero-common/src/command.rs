//! Velero binary invocation
//!
//! Every invocation runs with a timeout and captures both output streams.
//! Non-zero exit, spawn failure and timeout all map to [`Error::Cli`] with
//! whatever output was captured.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info};

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::Error;

/// Default timeout for a single velero invocation
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Captured output of a successful invocation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Output with the given stdout and empty stderr
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Trait abstracting execution of the velero binary
///
/// Arguments exclude the binary itself.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the binary and return its output, or [`Error::Cli`] on failure
    async fn run(&self, args: Vec<String>) -> Result<CommandOutput, Error>;
}

/// Runs a velero binary at a fixed path
#[derive(Clone, Debug)]
pub struct VeleroCli {
    binary_path: PathBuf,
    timeout: Duration,
}

impl VeleroCli {
    /// Create a runner for the binary at `binary_path`
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Override the per-invocation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn describe(&self, args: &[String]) -> String {
        std::iter::once(self.binary_path.display().to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl CommandRunner for VeleroCli {
    async fn run(&self, args: Vec<String>) -> Result<CommandOutput, Error> {
        let description = self.describe(&args);
        info!(command = %description, "running velero");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary_path)
                .args(&args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            error!(command = %description, timeout = ?self.timeout, "velero timed out");
            Error::cli(
                &description,
                None,
                "",
                format!("timed out after {:?}", self.timeout),
            )
        })?
        .map_err(|e| {
            error!(command = %description, error = %e, "failed to execute velero");
            Error::cli(&description, None, "", format!("failed to execute: {}", e))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            debug!(command = %description, "velero succeeded");
            Ok(CommandOutput { stdout, stderr })
        } else {
            error!(
                command = %description,
                exit_code = ?output.status.code(),
                stderr = %stderr,
                "velero failed"
            );
            Err(Error::cli(description, output.status.code(), stdout, stderr))
        }
    }
}
