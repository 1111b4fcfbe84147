//! Decoded device commands and their dispatch outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A command decoded from a short authenticated line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Command {
    /// Zero the account and return its balance to the pool.
    Clear,
    /// Credit the account with the given whole amount.
    LoadAmount(i64),
    /// Start the game client, or stop it if running.
    ToggleGame,
    /// Show pool balance and net earnings.
    ShowEarnings,
    /// Anything the decoder does not recognise.
    Unknown(String),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clear => f.write_str("clear"),
            Self::LoadAmount(amount) => write!(f, "load({amount})"),
            Self::ToggleGame => f.write_str("toggle_game"),
            Self::ShowEarnings => f.write_str("show_earnings"),
            Self::Unknown(raw) => write!(f, "unknown({raw})"),
        }
    }
}

/// Result of dispatching a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Rejected { reason: String },
}

impl Outcome {
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}
