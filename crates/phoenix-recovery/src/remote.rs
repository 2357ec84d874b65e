//! Remote command execution on control-plane hosts
//!
//! [`RemoteExecutor::run`] owns its retry: callers get either the output of a
//! successful (exit 0) run or the last failure once the attempts are used up,
//! and never retry on top of it.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{debug, warn};

use phoenix_common::{retry, Error, RetryConfig};

use crate::config::SshConfig;

/// Captured output of a successful remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Output with only stdout set
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// First line of stdout, trimmed
    pub fn first_line(&self) -> &str {
        self.stdout.lines().next().unwrap_or_default().trim()
    }
}

/// Runs shell commands on named hosts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` on `host`, retrying internally until it exits 0 or the
    /// attempts are exhausted
    async fn run(&self, host: &str, command: &str) -> Result<CommandOutput, Error>;
}

/// [`RemoteExecutor`] shelling out to the OpenSSH client
#[derive(Clone, Debug)]
pub struct SshExecutor {
    config: SshConfig,
}

impl SshExecutor {
    /// Create an executor
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn ssh_args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
        ];
        if let Some(identity) = &self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        if let Some(bastion) = &self.config.bastion {
            args.push("-J".to_string());
            args.push(bastion.clone());
        }
        args.push(format!("{}@{}", self.config.user, host));
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }

    async fn run_once(&self, host: &str, command: &str) -> Result<CommandOutput, Error> {
        let timeout = Duration::from_secs(self.config.command_timeout_secs);
        let output = tokio::time::timeout(
            timeout,
            Command::new("ssh")
                .args(self.ssh_args(host, command))
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::remote(host, command, format!("timed out after {:?}", timeout)))?
        .map_err(|e| Error::remote(host, command, format!("failed to execute ssh: {}", e)))?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if output.status.success() {
            Ok(result)
        } else {
            Err(Error::remote(
                host,
                command,
                format!(
                    "exit status {}: {}",
                    output
                        .status
                        .code()
                        .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                    result.stderr.trim()
                ),
            ))
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, host: &str, command: &str) -> Result<CommandOutput, Error> {
        debug!(host = %host, command = %command, "running remote command");
        let policy: RetryConfig = self.config.retry();
        retry(&policy, &format!("ssh {}", host), || {
            self.run_once(host, command)
        })
        .await
        .inspect_err(|e| warn!(host = %host, error = %e, "remote command gave up"))
    }
}

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:@,".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
