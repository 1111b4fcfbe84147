//! Root controller: owns the context and wires the loops together.

use std::{sync::Arc, time::Duration};

use kiosk_core::{Command, KioskContext, KioskEvent, Ledger, Notifier};
use kiosk_protocol::{LineDecoder, LineEffect};
use kiosk_serial::{InboundLine, LinkHandle, LinkSupervisor, Transport};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{BalanceWatchdog, Dispatcher, WatchdogSettings};

/// Builds and starts the control loops.
///
/// ```text
/// LinkSupervisor --lines--> decoder loop --Command--> Dispatcher
/// BalanceWatchdog --spend signal--> LinkHandle
/// ```
pub struct Controller {
    ctx: KioskContext,
    transport: Arc<dyn Transport>,
    supervise_interval: Duration,
    decoder: LineDecoder,
    dispatcher: Dispatcher,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    watchdog: Option<WatchdogSettings>,
}

impl Controller {
    #[must_use]
    pub fn new(
        ctx: KioskContext,
        transport: Arc<dyn Transport>,
        decoder: LineDecoder,
        dispatcher: Dispatcher,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            ctx,
            transport,
            supervise_interval: kiosk_serial::supervisor::SUPERVISE_INTERVAL,
            decoder,
            dispatcher,
            ledger,
            notifier,
            watchdog: Some(WatchdogSettings::default()),
        }
    }

    #[must_use]
    pub const fn supervise_interval(mut self, interval: Duration) -> Self {
        self.supervise_interval = interval;
        self
    }

    /// Watchdog settings, or `None` to run without a watchdog.
    #[must_use]
    pub fn watchdog(mut self, settings: Option<WatchdogSettings>) -> Self {
        self.watchdog = settings;
        self
    }

    /// Spawn the supervisor, decoder and watchdog tasks.
    #[must_use]
    pub fn spawn(self) -> ControllerHandle {
        let (supervisor, lines) = LinkSupervisor::new(
            Arc::clone(&self.transport),
            self.ctx.child(),
            self.supervise_interval,
        );
        let link = supervisor.handle();

        let mut tasks = vec![tokio::spawn(supervisor.run())];
        tasks.push(tokio::spawn(decode_loop(
            self.ctx.child(),
            lines,
            link.clone(),
            self.decoder,
            self.dispatcher,
        )));
        if let Some(settings) = self.watchdog {
            let watchdog = BalanceWatchdog::new(
                self.ledger,
                Arc::new(link.clone()),
                self.notifier,
                settings,
            );
            tasks.push(tokio::spawn(watchdog.run(self.ctx.child())));
        }

        ControllerHandle {
            ctx: self.ctx,
            link,
            tasks,
        }
    }
}

/// Running controller.
pub struct ControllerHandle {
    ctx: KioskContext,
    link: LinkHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl ControllerHandle {
    /// Handle to the current device link.
    #[must_use]
    pub const fn link(&self) -> &LinkHandle {
        &self.link
    }

    #[must_use]
    pub const fn context(&self) -> &KioskContext {
        &self.ctx
    }

    /// Cancel every loop and wait for them to finish.
    pub async fn shutdown(self) {
        self.ctx.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Controller task failed");
            }
        }
    }
}

/// Drain the line FIFO in arrival order.
///
/// The decoder follows the supervisor's link generation before every line,
/// so lines still queued from a replaced link are dropped and the new link
/// has to authenticate again.
async fn decode_loop(
    ctx: KioskContext,
    mut lines: mpsc::UnboundedReceiver<InboundLine>,
    link: LinkHandle,
    mut decoder: LineDecoder,
    dispatcher: Dispatcher,
) {
    let token = ctx.token().clone();
    loop {
        let line = tokio::select! {
            () = token.cancelled() => break,
            line = lines.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let was_authenticated = decoder.is_authenticated();
        decoder.link_changed(link.generation());
        let authenticated = decoder.is_authenticated();
        if was_authenticated && !authenticated {
            ctx.events().push(KioskEvent::AuthChanged {
                authenticated: false,
            });
        }

        match decoder.accept(line.generation, &line.text) {
            LineEffect::Authenticated => {
                ctx.events().push(KioskEvent::AuthChanged {
                    authenticated: true,
                });
            }
            LineEffect::AuthRejected => {
                if authenticated {
                    ctx.events().push(KioskEvent::AuthChanged {
                        authenticated: false,
                    });
                }
                ctx.events().push_rejected("authentication failed");
            }
            LineEffect::Dropped(reason) => {
                ctx.events().push_rejected(reason.to_string());
            }
            LineEffect::Command(Command::Unknown(raw)) => {
                tracing::warn!(code = %raw, "Unknown command, ignoring");
                ctx.events().push_rejected(format!("unknown command {raw}"));
            }
            LineEffect::Command(command) => {
                dispatcher.dispatch(&command).await;
            }
        }
    }
    tracing::info!("Decoder stopped");
}
