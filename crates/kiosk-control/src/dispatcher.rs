//! Command dispatch.

use std::sync::Arc;

use kiosk_core::{
    Command, CreditOutcome, EventLog, Ledger, LedgerError, Money, Notification, Notifier, Outcome,
};

use crate::{GameAction, GameLauncher};

pub const TEXT_CLEARED: &str = "CLEARED";
pub const TEXT_LIMIT_EXCEEDED: &str = "LIMIT EXCEEDED. RAISE THE LIMIT.";
pub const TEXT_GAME_STARTING: &str = "HAVE FUN...";
pub const TEXT_GAME_CLOSING: &str = "CLOSING GAME...";
pub const TEXT_FAILED: &str = "OPERATION FAILED";

const REASON_LEDGER: &str = "ledger error";
const REASON_LIMIT: &str = "limit exceeded";

/// Maps decoded commands to ledger and display actions.
///
/// Never fails: collaborator errors are logged and become
/// [`Outcome::Rejected`].
pub struct Dispatcher {
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    game: GameLauncher,
    events: Arc<EventLog>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn Notifier>,
        game: GameLauncher,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            ledger,
            notifier,
            game,
            events,
        }
    }

    /// Run a command and record the outcome in the event log.
    pub async fn dispatch(&self, command: &Command) -> Outcome {
        let outcome = match command {
            Command::Clear => self.clear().await,
            Command::LoadAmount(amount) => self.load(*amount).await,
            Command::ToggleGame => self.toggle_game().await,
            Command::ShowEarnings => self.show_earnings().await,
            Command::Unknown(raw) => {
                tracing::warn!(code = %raw, "Unknown command");
                Outcome::rejected("unknown command")
            }
        };
        match &outcome {
            Outcome::Applied => tracing::info!(%command, "Command applied"),
            Outcome::Rejected { reason } => tracing::info!(%command, %reason, "Command rejected"),
        }
        self.events.push_dispatched(command.clone(), outcome.clone());
        outcome
    }

    fn notify(&self, notification: Notification) {
        self.notifier.notify(&notification);
        self.events.push_notification(notification);
    }

    fn ledger_failed(&self, action: &str, error: &LedgerError) -> Outcome {
        tracing::error!(action, error = %error, "Ledger operation failed");
        self.notify(Notification::center(TEXT_FAILED));
        Outcome::rejected(REASON_LEDGER)
    }

    async fn clear(&self) -> Outcome {
        match self.ledger.clear().await {
            Ok(returned) => {
                tracing::info!(%returned, "Account cleared");
                self.notify(Notification::center(TEXT_CLEARED));
                Outcome::Applied
            }
            Err(e) => self.ledger_failed("clear", &e),
        }
    }

    async fn load(&self, amount: i64) -> Outcome {
        if amount <= 0 {
            return Outcome::rejected(format!("invalid amount {amount}"));
        }
        let money = Money::from_major(amount);

        match self.ledger.pool_balance().await {
            Ok(pool) if pool < money => return self.limit_exceeded(money, pool),
            Ok(_) => {}
            Err(e) => return self.ledger_failed("pool_balance", &e),
        }

        match self.ledger.credit(money).await {
            Ok(CreditOutcome::Credited { balance }) => {
                tracing::info!(amount = %money, %balance, "Account credited");
                self.notify(Notification::center(format!("{amount} LOADED")));
                Outcome::Applied
            }
            Ok(CreditOutcome::InsufficientPool { available }) => {
                self.limit_exceeded(money, available)
            }
            Err(e) => self.ledger_failed("credit", &e),
        }
    }

    fn limit_exceeded(&self, requested: Money, available: Money) -> Outcome {
        tracing::warn!(%requested, %available, "Funding pool exhausted");
        self.notify(Notification::center(TEXT_LIMIT_EXCEEDED));
        Outcome::rejected(REASON_LIMIT)
    }

    async fn toggle_game(&self) -> Outcome {
        match self.game.toggle().await {
            Ok(GameAction::Started) => {
                self.notify(Notification::center(TEXT_GAME_STARTING));
                Outcome::Applied
            }
            Ok(GameAction::Stopped(_)) => {
                self.notify(Notification::center(TEXT_GAME_CLOSING));
                Outcome::Applied
            }
            Err(e) => {
                tracing::error!(error = %e, "Game toggle failed");
                Outcome::rejected(e.to_string())
            }
        }
    }

    async fn show_earnings(&self) -> Outcome {
        let net = match self.ledger.net_earnings().await {
            Ok(net) => net,
            Err(e) => return self.ledger_failed("net_earnings", &e),
        };
        let pool = match self.ledger.pool_balance().await {
            Ok(pool) => pool,
            Err(e) => return self.ledger_failed("pool_balance", &e),
        };
        self.notify(Notification::panel(earnings_text(pool, net)));
        Outcome::Applied
    }
}

/// Two-line earnings panel text.
#[must_use]
pub fn earnings_text(pool: Money, net: Money) -> String {
    format!(
        "Remaining limit: {}\nNet earnings: {}",
        pool.localized(),
        net.localized()
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use kiosk_core::{KioskEvent, Placement, ProcessError, ProcessTable};

    use super::*;
    use crate::{GameConfig, MemoryLedger};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Notification>>);

    impl Notifier for Recorder {
        fn notify(&self, notification: &Notification) {
            self.0.lock().unwrap().push(notification.clone());
        }
    }

    impl Recorder {
        fn texts(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(|n| n.text.clone()).collect()
        }
    }

    struct NoGame;

    #[async_trait]
    impl ProcessTable for NoGame {
        async fn find_process(&self, _: &str, _: &[String]) -> Result<bool, ProcessError> {
            Ok(false)
        }

        async fn launch(&self, program: &str, _: &[String]) -> Result<(), ProcessError> {
            Err(ProcessError::ExecutableNotFound(program.to_string()))
        }

        async fn terminate(&self, _: &str) -> Result<usize, ProcessError> {
            Ok(0)
        }
    }

    fn setup(ledger: Arc<MemoryLedger>) -> (Dispatcher, Arc<Recorder>, Arc<EventLog>) {
        let notifier = Arc::new(Recorder::default());
        let events = Arc::new(EventLog::new());
        let game = GameLauncher::new(Arc::new(NoGame), GameConfig::default());
        let dispatcher = Dispatcher::new(ledger, notifier.clone(), game, events.clone());
        (dispatcher, notifier, events)
    }

    #[tokio::test]
    async fn test_load_credits_and_notifies() {
        let ledger = Arc::new(MemoryLedger::new(Money::from_major(100)));
        let (dispatcher, notifier, events) = setup(ledger.clone());

        let outcome = dispatcher.dispatch(&Command::LoadAmount(10)).await;
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(ledger.balance().await.unwrap(), Money::from_major(10));
        assert_eq!(notifier.texts(), ["10 LOADED"]);
        assert_eq!(ledger.audit_log().unwrap().len(), 1);
        assert!(events.history().iter().any(|e| matches!(
            e,
            KioskEvent::Dispatched {
                command: Command::LoadAmount(10),
                outcome: Outcome::Applied,
            }
        )));
    }

    #[tokio::test]
    async fn test_load_over_limit_rejected() {
        let ledger = Arc::new(MemoryLedger::new(Money::from_major(5)));
        let (dispatcher, notifier, _) = setup(ledger.clone());

        let outcome = dispatcher.dispatch(&Command::LoadAmount(10)).await;
        assert_eq!(outcome, Outcome::rejected("limit exceeded"));
        assert_eq!(notifier.texts(), [TEXT_LIMIT_EXCEEDED]);
        assert_eq!(ledger.balance().await.unwrap(), Money::ZERO);
        assert!(ledger.audit_log().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_positive_load_rejected() {
        let ledger = Arc::new(MemoryLedger::new(Money::from_major(100)));
        let (dispatcher, notifier, _) = setup(ledger);

        for amount in [0, -5] {
            let outcome = dispatcher.dispatch(&Command::LoadAmount(amount)).await;
            assert!(!outcome.is_applied());
        }
        assert!(notifier.texts().is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let ledger = MemoryLedger::new(Money::ZERO).with_balance(Money::from_major(7));
        let ledger = Arc::new(ledger);
        let (dispatcher, notifier, _) = setup(ledger.clone());

        assert!(dispatcher.dispatch(&Command::Clear).await.is_applied());
        assert_eq!(ledger.balance().await.unwrap(), Money::ZERO);
        assert_eq!(ledger.pool_balance().await.unwrap(), Money::from_major(7));
        assert_eq!(notifier.texts(), [TEXT_CLEARED]);
    }

    #[tokio::test]
    async fn test_ledger_error_becomes_rejection() {
        let ledger = Arc::new(MemoryLedger::new(Money::from_major(100)));
        ledger.set_offline(true);
        let (dispatcher, notifier, _) = setup(ledger);

        assert_eq!(
            dispatcher.dispatch(&Command::Clear).await,
            Outcome::rejected("ledger error")
        );
        assert_eq!(
            dispatcher.dispatch(&Command::LoadAmount(10)).await,
            Outcome::rejected("ledger error")
        );
        let outcome = dispatcher.dispatch(&Command::ShowEarnings).await;
        assert!(!outcome.is_applied());
        assert_eq!(notifier.texts(), [TEXT_FAILED, TEXT_FAILED, TEXT_FAILED]);
    }

    #[tokio::test]
    async fn test_show_earnings_panel() {
        let ledger = Arc::new(MemoryLedger::new(Money::from_major(2000)));
        let (dispatcher, notifier, _) = setup(ledger.clone());
        dispatcher.dispatch(&Command::LoadAmount(500)).await;
        ledger.clear().await.unwrap();
        ledger.credit(Money::from_major(250)).await.unwrap();
        notifier.0.lock().unwrap().clear();

        let outcome = dispatcher.dispatch(&Command::ShowEarnings).await;
        assert!(outcome.is_applied());
        let shown = notifier.0.lock().unwrap().clone();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].placement, Placement::Panel);
        assert_eq!(
            shown[0].text,
            "Remaining limit: 1.750,00\nNet earnings: 250,00"
        );
    }

    #[tokio::test]
    async fn test_game_failure_rejected() {
        let ledger = Arc::new(MemoryLedger::new(Money::ZERO));
        let (dispatcher, notifier, _) = setup(ledger);
        let outcome = dispatcher.dispatch(&Command::ToggleGame).await;
        assert!(!outcome.is_applied());
        assert!(notifier.texts().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_rejected() {
        let ledger = Arc::new(MemoryLedger::new(Money::ZERO));
        let (dispatcher, _, _) = setup(ledger);
        assert!(
            !dispatcher
                .dispatch(&Command::Unknown("9999".into()))
                .await
                .is_applied()
        );
    }
}
