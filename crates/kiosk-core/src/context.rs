//! Shared context handed to every long-lived task.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::EventLog;

/// Context owned by the root controller and cloned into each loop.
///
/// Replaces process-wide mutable state: every task gets the event log and
/// its own cancellation token derived from the root one.
#[derive(Clone)]
pub struct KioskContext {
    shutdown: CancellationToken,
    events: Arc<EventLog>,
}

impl Default for KioskContext {
    fn default() -> Self {
        Self::new()
    }
}

impl KioskContext {
    /// Create a root context with a fresh event log.
    #[must_use]
    pub fn new() -> Self {
        Self::with_events(Arc::new(EventLog::new()))
    }

    /// Create a root context around an existing event log.
    #[must_use]
    pub fn with_events(events: Arc<EventLog>) -> Self {
        Self {
            shutdown: CancellationToken::new(),
            events,
        }
    }

    /// Derive a context whose token is cancelled with this one, but can
    /// also be cancelled on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            shutdown: self.shutdown.child_token(),
            events: Arc::clone(&self.events),
        }
    }

    /// The event log.
    #[must_use]
    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Cancellation token for this task.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Whether loops should keep running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Request shutdown of this context and its children.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_follows_parent() {
        let root = KioskContext::new();
        let child = root.child();
        assert!(child.is_running());

        root.cancel();
        assert!(!child.is_running());
    }

    #[test]
    fn test_child_cancel_is_local() {
        let root = KioskContext::new();
        let child = root.child();
        child.cancel();

        assert!(root.is_running());
        assert!(!child.is_running());
    }
}
