//! Balance watchdog.
//!
//! The account can be debited by a process outside this one (a game
//! session). The watchdog polls the balance and tells the device when that
//! happens. A drop to exactly zero is an explicit clear and is not signalled.

use std::{sync::Arc, time::Duration};

use kiosk_core::{
    BalanceTransition, KioskContext, KioskEvent, Ledger, LedgerError, Money, Notification,
    Notifier,
};
use kiosk_serial::{LinkHandle, TransportError};

/// Text shown at the top of the screen when a spend is detected.
pub const TEXT_SPENT: &str = "Enjoy your game!";

/// Line sink for the device side.
pub trait DeviceSink: Send + Sync {
    /// Send one line.
    ///
    /// # Errors
    /// Returns `TransportError::NotConnected` if the line was dropped.
    fn send_line(&self, line: &str) -> Result<(), TransportError>;
}

impl DeviceSink for LinkHandle {
    fn send_line(&self, line: &str) -> Result<(), TransportError> {
        Self::send_line(self, line)
    }
}

/// Watchdog timing and signal code.
#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub interval: Duration,
    /// Used instead of `interval` after a failed read.
    pub retry_interval: Duration,
    /// Line sent to the device on an unexplained spend.
    pub spend_signal: String,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(3),
            spend_signal: "111111".to_string(),
        }
    }
}

/// Polls the ledger balance and classifies each change.
pub struct BalanceWatchdog {
    ledger: Arc<dyn Ledger>,
    device: Arc<dyn DeviceSink>,
    notifier: Arc<dyn Notifier>,
    settings: WatchdogSettings,
    last_known: Option<Money>,
}

impl BalanceWatchdog {
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        device: Arc<dyn DeviceSink>,
        notifier: Arc<dyn Notifier>,
        settings: WatchdogSettings,
    ) -> Self {
        Self {
            ledger,
            device,
            notifier,
            settings,
            last_known: None,
        }
    }

    /// Last successfully read balance.
    #[must_use]
    pub const fn last_known(&self) -> Option<Money> {
        self.last_known
    }

    /// Read the balance once and act on the change.
    ///
    /// # Errors
    /// Returns the ledger error; `last_known` is left untouched.
    pub async fn tick(&mut self) -> Result<BalanceTransition, LedgerError> {
        let current = self.ledger.balance().await?;
        let transition = classify(self.last_known, current);

        match transition {
            BalanceTransition::Unchanged => {}
            BalanceTransition::Initial => {
                tracing::info!(balance = %current, "Initial balance");
            }
            BalanceTransition::Increase => {
                tracing::info!(
                    previous = ?self.last_known,
                    current = %current,
                    "Balance increased"
                );
            }
            BalanceTransition::Cleared => {
                tracing::info!(previous = ?self.last_known, "Balance cleared, not signalling");
            }
            BalanceTransition::Spent => {
                tracing::info!(previous = ?self.last_known, current = %current, "Spend detected");
                self.notifier.notify(&Notification::top(TEXT_SPENT));
                self.send_spend_signal().await;
            }
        }

        self.last_known = Some(current);
        Ok(transition)
    }

    /// Serial writes block, so the signal goes out on the blocking pool.
    async fn send_spend_signal(&self) {
        let device = Arc::clone(&self.device);
        let signal = self.settings.spend_signal.clone();
        match tokio::task::spawn_blocking(move || device.send_line(&signal)).await {
            Ok(Ok(())) => tracing::debug!("Spend signal sent"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Spend signal dropped"),
            Err(e) => tracing::error!(error = %e, "Spend signal task failed"),
        }
    }

    /// Poll until the context is cancelled.
    pub async fn run(mut self, ctx: KioskContext) {
        let token = ctx.token().clone();
        tracing::info!(
            interval_ms = self.settings.interval.as_millis(),
            "Balance watchdog started"
        );
        loop {
            let previous = self.last_known;
            let delay = match self.tick().await {
                Ok(transition) => {
                    if transition != BalanceTransition::Unchanged {
                        if let Some(current) = self.last_known {
                            ctx.events().push(KioskEvent::Balance {
                                previous,
                                current,
                                transition,
                            });
                        }
                    }
                    self.settings.interval
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Balance read failed, retrying");
                    self.settings.retry_interval
                }
            };
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!("Balance watchdog stopped");
    }
}

/// Classify a balance change.
#[must_use]
pub fn classify(last_known: Option<Money>, current: Money) -> BalanceTransition {
    match last_known {
        None => BalanceTransition::Initial,
        Some(last) if current == last => BalanceTransition::Unchanged,
        Some(last) if current > last => BalanceTransition::Increase,
        Some(_) if current.is_zero() => BalanceTransition::Cleared,
        Some(_) => BalanceTransition::Spent,
    }
}
