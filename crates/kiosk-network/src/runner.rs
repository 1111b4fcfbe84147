//! Running host commands.

use std::process::Stdio;

use async_trait::async_trait;
use command_group::AsyncCommandGroup;

use crate::NetworkError;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub const fn success() -> Self {
        Self {
            status: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    #[must_use]
    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            status: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, Some(0))
    }

    /// Short description of a failure for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        let stderr = self.stderr.trim();
        match self.status {
            Some(code) if stderr.is_empty() => format!("exit status {code}"),
            Some(code) => format!("exit status {code}: {stderr}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Runs host tools (`ip`, `iptables`, `nmcli`, service daemons).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output.
    ///
    /// # Errors
    /// Returns error only if the command could not be started. A non-zero
    /// exit is reported through [`CommandOutput::status`].
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, NetworkError>;

    /// Start a long-running daemon in its own process group. Returns its pid.
    ///
    /// # Errors
    /// Returns error if the executable is missing or fails to spawn.
    async fn spawn(&self, program: &str, args: &[String]) -> Result<u32, NetworkError>;
}

/// Runs commands on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, NetworkError> {
        tracing::debug!(program, ?args, "Running");
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn spawn(&self, program: &str, args: &[String]) -> Result<u32, NetworkError> {
        let executable = which::which(program)
            .map_err(|_| NetworkError::ExecutableNotFound(program.to_string()))?;

        let mut child = tokio::process::Command::new(&executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .group_spawn()?;
        let pid = child.id().unwrap_or_default();
        tracing::info!(program = %executable.display(), pid, "Started daemon");

        let name = program.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(program = %name, %status, "Daemon exited"),
                Err(e) => tracing::warn!(program = %name, error = %e, "Daemon wait failed"),
            }
        });
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        assert_eq!(
            CommandOutput::failure(" no such device \n").describe(),
            "exit status 1: no such device"
        );
        assert_eq!(CommandOutput::failure("").describe(), "exit status 1");
        assert!(CommandOutput::success().is_success());
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let script = "echo out; echo err >&2; exit 3".to_string();
        let output = SystemRunner
            .run("sh", &["-c".to_string(), script])
            .await
            .unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_missing_daemon() {
        let result = SystemRunner.spawn("definitely-not-a-daemon-binary", &[]).await;
        assert!(matches!(result, Err(NetworkError::ExecutableNotFound(_))));
    }
}
