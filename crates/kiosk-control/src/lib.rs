//! Kiosk control plane.
//!
//! Provides:
//! - `Dispatcher` - Maps decoded commands to ledger and UI actions
//! - `BalanceWatchdog` - Classifies balance changes and signals spends
//! - `MemoryLedger` - In-process ledger with an audit log
//! - `SystemProcessTable` / `GameLauncher` - Game client control
//! - `Controller` - Wires supervisor, decoder, dispatcher and watchdog

pub mod controller;
pub mod dispatcher;
pub mod game;
pub mod ledger;
pub mod process;
pub mod watchdog;

pub use controller::{Controller, ControllerHandle};
pub use dispatcher::Dispatcher;
pub use game::{GameAction, GameConfig, GameLauncher};
pub use ledger::{AuditKind, AuditRecord, MemoryLedger};
pub use process::SystemProcessTable;
pub use watchdog::{BalanceWatchdog, DeviceSink, WatchdogSettings};
