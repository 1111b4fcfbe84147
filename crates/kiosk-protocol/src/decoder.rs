//! Per-line authentication and decoding.

use kiosk_core::Command;

use crate::{AuthSession, DecodeError, ExpectedToken, decode_command};

/// Why an inbound line produced no command.
#[derive(Debug)]
pub enum DropReason {
    /// Short line received before a valid token.
    AuthRequired,
    /// No expected token is configured on this host.
    NotProvisioned,
    /// Line was read from a link that has since been replaced.
    StaleLink,
    /// Malformed command code.
    Decode(DecodeError),
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthRequired => write!(f, "authentication required"),
            Self::NotProvisioned => write!(f, "device not provisioned"),
            Self::StaleLink => write!(f, "line from superseded link"),
            Self::Decode(e) => write!(f, "{e}"),
        }
    }
}

/// What a single inbound line did.
#[derive(Debug)]
pub enum LineEffect {
    Authenticated,
    AuthRejected,
    Command(Command),
    Dropped(DropReason),
}

/// Applies the auth state machine and the code table to inbound lines.
///
/// Tracks the link generation so that a new link starts unauthenticated and
/// lines still queued from an old link are discarded.
#[derive(Debug)]
pub struct LineDecoder {
    session: Option<AuthSession>,
    generation: u64,
}

impl LineDecoder {
    #[must_use]
    pub const fn new(expected: ExpectedToken) -> Self {
        Self {
            session: Some(AuthSession::new(expected)),
            generation: 0,
        }
    }

    /// Decoder that drops every line.
    #[must_use]
    pub const fn unprovisioned() -> Self {
        Self {
            session: None,
            generation: 0,
        }
    }

    #[must_use]
    pub const fn is_provisioned(&self) -> bool {
        self.session.is_some()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(AuthSession::is_authenticated)
    }

    /// Generation of the link whose lines are currently accepted.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// A new link was attached. Resets authentication.
    pub fn link_changed(&mut self, generation: u64) {
        if generation == self.generation {
            return;
        }
        tracing::debug!(
            from = self.generation,
            to = generation,
            "Link changed, resetting authentication"
        );
        self.generation = generation;
        if let Some(session) = self.session.as_mut() {
            session.reset();
        }
    }

    /// Process one stripped line received on link `generation`.
    pub fn accept(&mut self, generation: u64, line: &str) -> LineEffect {
        if generation < self.generation {
            tracing::debug!(generation, current = self.generation, "Dropping stale line");
            return LineEffect::Dropped(DropReason::StaleLink);
        }
        if generation > self.generation {
            self.link_changed(generation);
        }

        let Some(session) = self.session.as_mut() else {
            tracing::warn!(line, "Device not provisioned, dropping line");
            return LineEffect::Dropped(DropReason::NotProvisioned);
        };

        if AuthSession::is_token_line(line) {
            return match session.present(line) {
                Ok(()) => {
                    tracing::info!("Device authenticated");
                    LineEffect::Authenticated
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Authentication failed");
                    LineEffect::AuthRejected
                }
            };
        }

        if !session.is_authenticated() {
            tracing::warn!(line, "Authentication required");
            return LineEffect::Dropped(DropReason::AuthRequired);
        }

        match decode_command(line) {
            Ok(command) => LineEffect::Command(command),
            Err(e) => {
                tracing::warn!(line, error = %e, "Failed to decode command");
                LineEffect::Dropped(DropReason::Decode(e))
            }
        }
    }
}
