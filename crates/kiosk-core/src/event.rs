//! Operator-visible events.

use serde::{Deserialize, Serialize};

use crate::{Command, Money, Outcome};

/// Where a notification is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Centered banner.
    Center,
    /// Thin banner at the top of the screen.
    Top,
    /// Multi-line panel (earnings report).
    Panel,
}

/// A short on-screen message for the display collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub text: String,
    pub placement: Placement,
}

impl Notification {
    #[must_use]
    pub fn center(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            placement: Placement::Center,
        }
    }

    #[must_use]
    pub fn top(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            placement: Placement::Top,
        }
    }

    #[must_use]
    pub fn panel(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            placement: Placement::Panel,
        }
    }
}

/// Classification of a balance change seen by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceTransition {
    /// First successful read.
    Initial,
    Unchanged,
    /// Balance went up (a load).
    Increase,
    /// Balance dropped to zero (an explicit clear).
    Cleared,
    /// Balance dropped but not to zero (consumed elsewhere).
    Spent,
}

/// Typed event pushed to the [`EventLog`](crate::EventLog).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KioskEvent {
    /// A link was attached and its read loop started.
    LinkAttached { path: String, generation: u64 },
    /// The current link failed and was dropped.
    LinkLost { path: String, reason: String },
    /// Authentication state changed.
    AuthChanged { authenticated: bool },
    /// A line was dropped without producing a command.
    LineRejected { reason: String },
    /// A command was dispatched.
    Dispatched { command: Command, outcome: Outcome },
    /// A notification was shown.
    Notification(Notification),
    /// The watchdog classified a balance change.
    Balance {
        previous: Option<Money>,
        current: Money,
        transition: BalanceTransition,
    },
}
