//! Broadcast + history event log for the UI collaborator.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{Command, KioskEvent, Notification, Outcome};

/// Default number of events kept for late subscribers.
const HISTORY_LIMIT: usize = 1024;

/// Event log with broadcast and history support.
///
/// A display process attaching late receives the history first and then
/// switches to live updates.
pub struct EventLog {
    history: RwLock<VecDeque<KioskEvent>>,
    limit: usize,
    sender: broadcast::Sender<KioskEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// Create a new event log.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(HISTORY_LIMIT)
    }

    /// Create an event log keeping at most `limit` past events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            history: RwLock::new(VecDeque::with_capacity(32)),
            limit: limit.max(1),
            sender,
        }
    }

    /// Push an event to both live listeners and history.
    pub fn push(&self, event: KioskEvent) {
        let _ = self.sender.send(event.clone()); // live listeners

        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.limit {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Push a dispatch result.
    pub fn push_dispatched(&self, command: Command, outcome: Outcome) {
        self.push(KioskEvent::Dispatched { command, outcome });
    }

    /// Push a notification.
    pub fn push_notification(&self, notification: Notification) {
        self.push(KioskEvent::Notification(notification));
    }

    /// Push a dropped-line reason.
    pub fn push_rejected<S: Into<String>>(&self, reason: S) {
        self.push(KioskEvent::LineRejected {
            reason: reason.into(),
        });
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<KioskEvent> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<KioskEvent> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Stream that yields history first, then live updates.
    ///
    /// Events dropped because a slow consumer lagged are skipped.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, KioskEvent> {
        let (history, rx) = (self.history(), self.subscribe());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}
