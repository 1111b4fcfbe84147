//! Collaborator traits: ledger, display and process table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Money, Notification};

/// Ledger error.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid ledger state: {0}")]
    InvalidState(String),
    #[error("Ledger error: {0}")]
    Internal(String),
}

/// Result of a credit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CreditOutcome {
    /// Amount moved from the pool to the account.
    Credited { balance: Money },
    /// The pool could not cover the amount; nothing changed.
    InsufficientPool { available: Money },
}

/// External balance / earnings store.
///
/// `credit` must check pool capacity and move the money as one atomic
/// step; callers do not hold any lock across the check and the update.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current account balance.
    async fn balance(&self) -> Result<Money, LedgerError>;

    /// Remaining funding pool.
    async fn pool_balance(&self) -> Result<Money, LedgerError>;

    /// Move `amount` from the pool to the account and record an audit entry.
    async fn credit(&self, amount: Money) -> Result<CreditOutcome, LedgerError>;

    /// Zero the account and return its balance to the pool.
    ///
    /// Returns the amount that was returned.
    async fn clear(&self) -> Result<Money, LedgerError>;

    /// Aggregate money in minus money out.
    async fn net_earnings(&self) -> Result<Money, LedgerError>;
}

/// On-screen notification renderer.
pub trait Notifier: Send + Sync {
    /// Show a notification. Rendering failures are the renderer's concern.
    fn notify(&self, notification: &Notification);
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) {
        tracing::info!(
            placement = ?notification.placement,
            text = %notification.text,
            "Notification"
        );
    }
}

/// Process table error.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Signal delivery failed for pid {pid}: {reason}")]
    Signal { pid: i32, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Query and control external processes.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Whether a process whose name contains `name_pattern` and whose
    /// command line contains any of `arg_patterns` is running.
    async fn find_process(
        &self,
        name_pattern: &str,
        arg_patterns: &[String],
    ) -> Result<bool, ProcessError>;

    /// Launch a detached process.
    async fn launch(&self, program: &str, args: &[String]) -> Result<(), ProcessError>;

    /// Gracefully terminate every process whose name contains `name_pattern`.
    ///
    /// Returns the number of processes signalled.
    async fn terminate(&self, name_pattern: &str) -> Result<usize, ProcessError>;
}
