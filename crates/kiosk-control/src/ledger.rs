//! In-memory ledger.

use std::{
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use kiosk_core::{CreditOutcome, Ledger, LedgerError, Money};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of audited ledger movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Pool to account.
    Load,
    /// Account back to pool.
    Clear,
}

/// One audited movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub kind: AuditKind,
    pub amount: Money,
    /// Unix epoch seconds.
    pub timestamp: i64,
}

#[derive(Debug, Default)]
struct LedgerState {
    balance: Money,
    pool: Money,
    money_in: Money,
    money_out: Money,
    audit: Vec<AuditRecord>,
    offline: bool,
}

impl LedgerState {
    fn check_online(&self) -> Result<(), LedgerError> {
        if self.offline {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        Ok(())
    }

    fn record(&mut self, kind: AuditKind, amount: Money) {
        self.audit.push(AuditRecord {
            id: Uuid::new_v4(),
            kind,
            amount,
            timestamp: now(),
        });
    }
}

/// Ledger kept in process memory.
///
/// Every operation takes a single lock, so the pool check and the transfer
/// in [`Ledger::credit`] are atomic. Data is lost on restart.
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    /// Create a ledger with an empty account and the given pool.
    #[must_use]
    pub fn new(pool: Money) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                pool,
                ..LedgerState::default()
            }),
        }
    }

    /// Set the starting account balance.
    #[must_use]
    pub fn with_balance(self, balance: Money) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.balance = balance;
        }
        self
    }

    /// Debit the account from outside the dispatcher, the way a running
    /// game session spends credit. Not audited.
    ///
    /// # Errors
    /// Returns error if the account does not hold `amount`.
    pub fn consume(&self, amount: Money) -> Result<Money, LedgerError> {
        let mut state = self.lock()?;
        state.check_online()?;
        let balance = state
            .balance
            .checked_sub(amount)
            .filter(|b| !b.minor().is_negative())
            .ok_or_else(|| {
                LedgerError::InvalidState(format!("cannot consume {amount} from {}", state.balance))
            })?;
        state.balance = balance;
        Ok(balance)
    }

    /// Simulate a storage outage. While offline every operation fails with
    /// `LedgerError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.offline = offline;
        }
    }

    /// Audited movements, oldest first.
    ///
    /// # Errors
    /// Returns error if the ledger lock is poisoned.
    pub fn audit_log(&self) -> Result<Vec<AuditRecord>, LedgerError> {
        Ok(self.lock()?.audit.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>, LedgerError> {
        self.state
            .lock()
            .map_err(|e| LedgerError::Internal(e.to_string()))
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn balance(&self) -> Result<Money, LedgerError> {
        let state = self.lock()?;
        state.check_online()?;
        Ok(state.balance)
    }

    async fn pool_balance(&self) -> Result<Money, LedgerError> {
        let state = self.lock()?;
        state.check_online()?;
        Ok(state.pool)
    }

    async fn credit(&self, amount: Money) -> Result<CreditOutcome, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidState(format!(
                "credit amount must be positive, got {amount}"
            )));
        }
        let mut state = self.lock()?;
        state.check_online()?;
        if state.pool < amount {
            return Ok(CreditOutcome::InsufficientPool {
                available: state.pool,
            });
        }
        state.pool = state.pool - amount;
        state.balance = state.balance + amount;
        state.money_in = state.money_in + amount;
        state.record(AuditKind::Load, amount);
        Ok(CreditOutcome::Credited {
            balance: state.balance,
        })
    }

    async fn clear(&self) -> Result<Money, LedgerError> {
        let mut state = self.lock()?;
        state.check_online()?;
        let returned = state.balance;
        if returned.minor().is_negative() {
            return Err(LedgerError::InvalidState(format!(
                "account balance is negative: {returned}"
            )));
        }
        state.balance = Money::ZERO;
        state.pool = state.pool + returned;
        state.money_out = state.money_out + returned;
        state.record(AuditKind::Clear, returned);
        Ok(returned)
    }

    async fn net_earnings(&self) -> Result<Money, LedgerError> {
        let state = self.lock()?;
        state.check_online()?;
        Ok(state.money_in - state.money_out)
    }
}
