//! Process table backed by `/proc`.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use command_group::AsyncCommandGroup;
use kiosk_core::{ProcessError, ProcessTable};
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};

/// A process seen in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    /// Short name from `comm`.
    pub name: String,
    pub cmdline: Vec<String>,
}

impl ProcessInfo {
    fn name_contains(&self, pattern: &str) -> bool {
        self.name.to_lowercase().contains(&pattern.to_lowercase())
    }

    fn cmdline_contains(&self, pattern: &str) -> bool {
        self.cmdline
            .join(" ")
            .to_lowercase()
            .contains(&pattern.to_lowercase())
    }
}

/// Reads processes from procfs and launches detached process groups.
#[derive(Debug, Clone)]
pub struct SystemProcessTable {
    proc_root: PathBuf,
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProcessTable {
    #[must_use]
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read processes from an alternative procfs mount.
    #[must_use]
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// Snapshot of every readable process. Processes that exit mid-scan are
    /// skipped.
    ///
    /// # Errors
    /// Returns error if the procfs root cannot be listed.
    pub fn scan(&self) -> Result<Vec<ProcessInfo>, ProcessError> {
        let mut processes = Vec::new();
        for entry in std::fs::read_dir(&self.proc_root)? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            else {
                continue;
            };
            if let Some(info) = read_process(&entry.path(), pid) {
                processes.push(info);
            }
        }
        Ok(processes)
    }

    async fn scan_async(&self) -> Result<Vec<ProcessInfo>, ProcessError> {
        let table = self.clone();
        tokio::task::spawn_blocking(move || table.scan())
            .await
            .map_err(|e| ProcessError::Io(std::io::Error::other(e)))?
    }
}

fn read_process(dir: &Path, pid: i32) -> Option<ProcessInfo> {
    let name = std::fs::read_to_string(dir.join("comm")).ok()?;
    let cmdline = std::fs::read(dir.join("cmdline")).unwrap_or_default();
    let cmdline = cmdline
        .split(|&b| b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect();
    Some(ProcessInfo {
        pid,
        name: name.trim().to_string(),
        cmdline,
    })
}

#[async_trait]
impl ProcessTable for SystemProcessTable {
    async fn find_process(
        &self,
        name_pattern: &str,
        arg_patterns: &[String],
    ) -> Result<bool, ProcessError> {
        let found = self.scan_async().await?.iter().any(|p| {
            p.name_contains(name_pattern)
                && (arg_patterns.is_empty() || arg_patterns.iter().any(|a| p.cmdline_contains(a)))
        });
        Ok(found)
    }

    async fn launch(&self, program: &str, args: &[String]) -> Result<(), ProcessError> {
        let executable = which::which(program)
            .map_err(|_| ProcessError::ExecutableNotFound(program.to_string()))?;

        let mut child = tokio::process::Command::new(&executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .group_spawn()
            .map_err(|e| {
                ProcessError::SpawnFailed(format!("{}: {e}", executable.display()))
            })?;

        tracing::info!(
            program = %executable.display(),
            pid = ?child.id(),
            "Launched process group"
        );

        // Reap the leader so it does not linger as a zombie.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!(%status, "Launched process exited"),
                Err(e) => tracing::warn!(error = %e, "Failed to wait for launched process"),
            }
        });
        Ok(())
    }

    async fn terminate(&self, name_pattern: &str) -> Result<usize, ProcessError> {
        let own_pid = i32::try_from(std::process::id()).unwrap_or(i32::MAX);
        let mut signalled = 0;
        for process in self.scan_async().await? {
            if process.pid == own_pid
                || !(process.name_contains(name_pattern) || process.cmdline_contains(name_pattern))
            {
                continue;
            }
            match kill(Pid::from_raw(process.pid), Signal::SIGTERM) {
                Ok(()) => {
                    tracing::info!(pid = process.pid, name = %process.name, "Sent SIGTERM");
                    signalled += 1;
                }
                Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(ProcessError::Signal {
                        pid: process.pid,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(signalled)
    }
}
