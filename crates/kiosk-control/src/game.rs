//! Game client toggle.

use std::sync::Arc;

use kiosk_core::{ProcessError, ProcessTable};
use serde::{Deserialize, Serialize};

/// How the game client is found and started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Substring of the process name, matched case-insensitively.
    pub process_name: String,
    /// A running client has at least one of these in its command line.
    pub marker_args: Vec<String>,
    /// Launch command line, shell-quoted. The URL is appended.
    pub command: String,
    pub url: String,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            process_name: "brave".to_string(),
            marker_args: vec!["--start-fullscreen".to_string(), "--new-window".to_string()],
            command: "brave-browser --incognito -new-window --start-fullscreen \
                      --ignore-certificate-errors --allow-insecure-localhost --test-type \
                      --disable-features=OutdatedBuildDetector"
                .to_string(),
            url: "http://192.168.4.1:8080/".to_string(),
        }
    }
}

/// What a toggle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameAction {
    Started,
    /// Number of processes signalled.
    Stopped(usize),
}

/// Starts the game client, or stops it if it is already running.
pub struct GameLauncher {
    processes: Arc<dyn ProcessTable>,
    config: GameConfig,
}

impl GameLauncher {
    #[must_use]
    pub fn new(processes: Arc<dyn ProcessTable>, config: GameConfig) -> Self {
        Self { processes, config }
    }

    /// Whether a game client is running.
    ///
    /// # Errors
    /// Returns error if the process table cannot be read.
    pub async fn is_running(&self) -> Result<bool, ProcessError> {
        self.processes
            .find_process(&self.config.process_name, &self.config.marker_args)
            .await
    }

    /// Toggle the client.
    ///
    /// # Errors
    /// Returns error if the process table fails or the command line is
    /// unusable.
    pub async fn toggle(&self) -> Result<GameAction, ProcessError> {
        if self.is_running().await? {
            let count = self.processes.terminate(&self.config.process_name).await?;
            tracing::info!(count, "Stopped game client");
            return Ok(GameAction::Stopped(count));
        }

        let (program, args) = self.launch_command()?;
        self.processes.launch(&program, &args).await?;
        tracing::info!(program = %program, url = %self.config.url, "Started game client");
        Ok(GameAction::Started)
    }

    fn launch_command(&self) -> Result<(String, Vec<String>), ProcessError> {
        let mut parts = shlex::split(&self.config.command).ok_or_else(|| {
            ProcessError::SpawnFailed(format!("invalid command line: {}", self.config.command))
        })?;
        if parts.is_empty() {
            return Err(ProcessError::SpawnFailed("empty command line".to_string()));
        }
        let program = parts.remove(0);
        parts.push(self.config.url.clone());
        Ok((program, parts))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct FakeTable {
        running: Mutex<bool>,
        launched: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl ProcessTable for FakeTable {
        async fn find_process(&self, _: &str, _: &[String]) -> Result<bool, ProcessError> {
            Ok(*self.running.lock().unwrap())
        }

        async fn launch(&self, program: &str, args: &[String]) -> Result<(), ProcessError> {
            self.launched
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            *self.running.lock().unwrap() = true;
            Ok(())
        }

        async fn terminate(&self, _: &str) -> Result<usize, ProcessError> {
            *self.running.lock().unwrap() = false;
            Ok(3)
        }
    }

    #[tokio::test]
    async fn test_toggle_starts_then_stops() {
        let table = Arc::new(FakeTable::default());
        let launcher = GameLauncher::new(table.clone(), GameConfig::default());

        assert_eq!(launcher.toggle().await.unwrap(), GameAction::Started);
        let launched = table.launched.lock().unwrap().clone();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].0, "brave-browser");
        assert!(launched[0].1.contains(&"--start-fullscreen".to_string()));
        assert_eq!(launched[0].1.last().unwrap(), "http://192.168.4.1:8080/");

        assert_eq!(launcher.toggle().await.unwrap(), GameAction::Stopped(3));
        assert!(!launcher.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn test_bad_command_line() {
        let config = GameConfig {
            command: "brave \"unterminated".to_string(),
            ..GameConfig::default()
        };
        let launcher = GameLauncher::new(Arc::new(FakeTable::default()), config);
        assert!(matches!(launcher.toggle().await, Err(ProcessError::SpawnFailed(_))));
    }
}
