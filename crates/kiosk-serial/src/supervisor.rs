//! Link supervision: attach, read lines, reattach on failure.

use std::{
    io::{ErrorKind, Read, Write},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use kiosk_core::{KioskContext, KioskEvent};
use serialport::SerialPort;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Link, Transport, TransportError};

/// Default supervision interval.
pub const SUPERVISE_INTERVAL: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 256;

/// One stripped line read from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundLine {
    /// Generation of the link that produced the line.
    pub generation: u64,
    pub text: String,
}

type SharedWriter = Arc<Mutex<Box<dyn SerialPort>>>;

struct ActiveLink {
    link: Link,
    generation: u64,
    writer: SharedWriter,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct LinkSlot {
    current: Mutex<Option<ActiveLink>>,
    generation: AtomicU64,
}

impl LinkSlot {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ActiveLink>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle for writing to whatever link is current.
#[derive(Clone)]
pub struct LinkHandle {
    slot: Arc<LinkSlot>,
}

impl LinkHandle {
    /// Write `text` followed by a newline.
    ///
    /// The message is dropped if there is no live link. A write failure
    /// marks the link dead so the supervisor replaces it.
    ///
    /// Blocks for the duration of the write; async callers should run it on
    /// the blocking pool. The link slot is not held while writing.
    ///
    /// # Errors
    /// Returns `TransportError::NotConnected` if no live link is attached, or
    /// the write error.
    pub fn send_line(&self, text: &str) -> Result<(), TransportError> {
        let (writer, alive, path) = {
            let guard = self.slot.lock();
            match guard.as_ref() {
                Some(active) if active.alive.load(Ordering::Acquire) => (
                    Arc::clone(&active.writer),
                    Arc::clone(&active.alive),
                    active.link.path.clone(),
                ),
                _ => return Err(TransportError::NotConnected),
            }
        };

        let mut port = writer.lock().unwrap_or_else(PoisonError::into_inner);
        let result = port
            .write_all(format!("{text}\n").as_bytes())
            .and_then(|()| port.flush());
        if let Err(e) = result {
            tracing::warn!(path = %path, error = %e, "Write failed, marking link dead");
            alive.store(false, Ordering::Release);
            return Err(e.into());
        }
        tracing::debug!(path = %path, text, "Sent line");
        Ok(())
    }

    /// Whether a live link is attached.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .is_some_and(|active| active.alive.load(Ordering::Acquire))
    }

    /// The current link, if any.
    #[must_use]
    pub fn current(&self) -> Option<Link> {
        self.slot.lock().as_ref().map(|active| active.link.clone())
    }

    /// Generation of the most recently attached link. Zero before the first.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.slot.generation.load(Ordering::Acquire)
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    slot: Arc<LinkSlot>,
    lines: mpsc::UnboundedSender<InboundLine>,
    ctx: KioskContext,
}

impl Shared {
    fn attach(&self) -> Result<Link, TransportError> {
        let link = self.transport.discover()?;
        let port = self.transport.open(&link)?;
        let reader = port.try_clone().map_err(|source| TransportError::Open {
            path: link.path.clone(),
            source,
        })?;

        let generation = self.slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let alive = Arc::new(AtomicBool::new(true));

        let read_loop = ReadLoop {
            reader: Box::new(reader),
            generation,
            path: link.path.clone(),
            alive: Arc::clone(&alive),
            lines: self.lines.clone(),
            token: self.ctx.token().clone(),
        };
        thread::Builder::new()
            .name(format!("kiosk-link-{generation}"))
            .spawn(move || read_loop.run())?;

        let previous = self.slot.lock().replace(ActiveLink {
            link: link.clone(),
            generation,
            writer: Arc::new(Mutex::new(port)),
            alive,
        });
        if let Some(previous) = previous {
            previous.alive.store(false, Ordering::Release);
        }

        tracing::info!(link = %link, generation, "Attached link");
        self.ctx.events().push(KioskEvent::LinkAttached {
            path: link.path.clone(),
            generation,
        });
        Ok(link)
    }

    fn is_alive(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .is_some_and(|active| active.alive.load(Ordering::Acquire))
    }

    /// Drop a dead link so the next attach starts clean.
    fn reap(&self) {
        let mut guard = self.slot.lock();
        let dead = guard
            .as_ref()
            .is_some_and(|active| !active.alive.load(Ordering::Acquire));
        if !dead {
            return;
        }
        if let Some(active) = guard.take() {
            tracing::warn!(path = %active.link.path, generation = active.generation, "Link lost");
            self.ctx.events().push(KioskEvent::LinkLost {
                path: active.link.path,
                reason: "I/O failure".to_string(),
            });
        }
    }
}

/// Keeps one link attached and feeds its lines into a FIFO.
///
/// Every tick: if the current link is dead it is dropped and discovery runs
/// again. Discovery failure is logged and retried on the next tick, forever.
pub struct LinkSupervisor {
    shared: Arc<Shared>,
    interval: Duration,
}

impl LinkSupervisor {
    /// Create a supervisor and the receiving end of its line FIFO.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        ctx: KioskContext,
        interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<InboundLine>) {
        let (lines, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            transport,
            slot: Arc::new(LinkSlot::default()),
            lines,
            ctx,
        });
        (Self { shared, interval }, rx)
    }

    /// Handle for sending on the current link.
    #[must_use]
    pub fn handle(&self) -> LinkHandle {
        LinkHandle {
            slot: Arc::clone(&self.shared.slot),
        }
    }

    /// Discover and open a link, then start its read loop.
    ///
    /// Replaces any current link. Blocking; call from a blocking context.
    ///
    /// # Errors
    /// Returns `TransportError::NotFound` if discovery finds nothing, or the
    /// open error.
    pub fn attach(&self) -> Result<Link, TransportError> {
        self.shared.attach()
    }

    /// Whether the current link is live.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Supervision loop. Returns when the context is cancelled.
    pub async fn run(self) {
        let token = self.shared.ctx.token().clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            transport = %self.shared.transport.describe(),
            interval_ms = self.interval.as_millis(),
            "Link supervisor started"
        );

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.shared.is_alive() {
                continue;
            }
            self.shared.reap();

            let shared = Arc::clone(&self.shared);
            match tokio::task::spawn_blocking(move || shared.attach()).await {
                Ok(Ok(_)) => {}
                Ok(Err(TransportError::NotFound)) => {
                    tracing::debug!("No device found, retrying");
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "Attach failed, retrying"),
                Err(e) => tracing::error!(error = %e, "Attach task panicked"),
            }
        }

        // Dropping the writer closes the port once the read loop exits too.
        self.shared.slot.lock().take();
        tracing::info!("Link supervisor stopped");
    }
}

/// Blocking read loop for one link generation.
struct ReadLoop {
    reader: Box<dyn Read + Send>,
    generation: u64,
    path: String,
    alive: Arc<AtomicBool>,
    lines: mpsc::UnboundedSender<InboundLine>,
    token: CancellationToken,
}

impl ReadLoop {
    fn run(mut self) {
        let mut pending = Vec::new();
        let mut buf = [0u8; READ_CHUNK];

        while !self.token.is_cancelled() && self.alive.load(Ordering::Acquire) {
            match self.reader.read(&mut buf) {
                Ok(0) => {
                    tracing::warn!(
                        path = %self.path,
                        generation = self.generation,
                        "Device hung up"
                    );
                    self.alive.store(false, Ordering::Release);
                    break;
                }
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    if !self.drain_lines(&mut pending) {
                        break;
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock
                    ) => {}
                Err(e) => {
                    tracing::warn!(
                        path = %self.path,
                        generation = self.generation,
                        error = %e,
                        "Read failed"
                    );
                    self.alive.store(false, Ordering::Release);
                    break;
                }
            }
        }
        tracing::debug!(path = %self.path, generation = self.generation, "Read loop exited");
    }

    /// Push every complete line in `pending`. Returns false if the consumer
    /// is gone.
    fn drain_lines(&self, pending: &mut Vec<u8>) -> bool {
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let text = match String::from_utf8(raw) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(path = %self.path, error = %e, "Dropping non UTF-8 line");
                    continue;
                }
            };
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            tracing::trace!(generation = self.generation, line = text, "Received line");
            let line = InboundLine {
                generation: self.generation,
                text: text.to_string(),
            };
            if self.lines.send(line).is_err() {
                return false;
            }
        }
        true
    }
}
