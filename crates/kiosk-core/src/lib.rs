//! Core abstractions for the kiosk terminal controller.
//!
//! This crate provides the fundamental building blocks:
//! - `Command` / `Outcome` - What the device asks for and what happened
//! - `Money` - Fixed-point currency amounts
//! - `EventLog` - Broadcast + history of operator-visible events
//! - `KioskContext` - Shutdown token and event log shared by every task
//! - Ledger, notifier and process-table traits

pub mod command;
pub mod context;
pub mod event;
pub mod event_log;
pub mod money;
pub mod traits;

pub use command::{Command, Outcome};
pub use context::KioskContext;
pub use event::{BalanceTransition, KioskEvent, Notification, Placement};
pub use event_log::EventLog;
pub use money::Money;
pub use traits::{
    CreditOutcome, Ledger, LedgerError, LogNotifier, Notifier, ProcessError, ProcessTable,
};
