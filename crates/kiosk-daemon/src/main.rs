//! kioskd: drives the kiosk terminal from its serial device.
//!
//! Startup: load config, bring up the captive portal network (optional),
//! reclaim the portal port, then run the controller until SIGTERM/SIGINT.
//! Network state is torn down exactly once on the way out.

mod config;

use std::{io::Write as _, path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt as _;
use kiosk_control::{Controller, Dispatcher, GameLauncher, MemoryLedger, SystemProcessTable};
use kiosk_core::{KioskContext, LogNotifier};
use kiosk_network::{NetworkManager, SystemPortControl, SystemRunner, reclaim_port};
use kiosk_protocol::LineDecoder;
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "kioskd", version, about = "Kiosk terminal controller")]
struct Args {
    /// Config file (TOML).
    #[arg(short, long, env = "KIOSK_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print every kiosk event as a JSON line on stdout.
    #[arg(long)]
    events_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    // Registered before any network change so a signal during startup still
    // reaches teardown.
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT")?;

    let config = Config::load(args.config.as_deref()).context("loading configuration")?;
    let transport = config.transport().context("configuring device transport")?;
    let decoder = match config.expected_token().context("establishing device token")? {
        Some(token) => LineDecoder::new(token),
        None => LineDecoder::unprovisioned(),
    };

    let network = if config.network.enabled {
        Some(start_network(&config).await?)
    } else {
        tracing::info!("Network setup disabled");
        None
    };

    let ctx = KioskContext::new();
    if args.events_json {
        tokio::spawn(print_events(ctx.clone()));
    }

    let ledger = MemoryLedger::new(config.initial_pool()).with_balance(config.initial_balance());
    let ledger = Arc::new(ledger);
    let notifier = Arc::new(LogNotifier);
    let game = GameLauncher::new(Arc::new(SystemProcessTable::new()), config.game.clone());
    let dispatcher = Dispatcher::new(
        ledger.clone(),
        notifier.clone(),
        game,
        Arc::clone(ctx.events()),
    );

    tracing::info!(
        transport = %transport.describe(),
        provisioned = decoder.is_provisioned(),
        "Starting controller"
    );
    let controller = Controller::new(ctx, transport, decoder, dispatcher, ledger, notifier)
        .supervise_interval(config.supervise_interval())
        .watchdog(config.watchdog_settings())
        .spawn();

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }

    controller.shutdown().await;
    if let Some(network) = network {
        network.teardown().await;
    }
    tracing::info!("Kiosk stopped");
    Ok(())
}

/// Apply the portal network and free its port. Either failure is fatal and
/// rolls back whatever is left, including leftovers of an earlier run.
async fn start_network(config: &Config) -> anyhow::Result<Arc<NetworkManager>> {
    let manager = Arc::new(NetworkManager::new(Arc::new(SystemRunner)));
    let service = &config.network.service;

    let report = match manager.apply(service).await {
        Ok(report) => report,
        Err(e) => {
            manager.teardown().await;
            return Err(e)
                .with_context(|| format!("bringing up network on {}", service.interface));
        }
    };
    for (step, cause) in &report.warnings {
        tracing::warn!(%step, %cause, "Network step incomplete");
    }

    let reclaimed = reclaim_port(
        &SystemPortControl::new(),
        service.portal_port,
        &config.reclaim_settings(),
    )
    .await;
    if let Err(e) = reclaimed {
        manager.teardown().await;
        return Err(e).context("reclaiming portal port");
    }
    Ok(manager)
}

async fn print_events(ctx: KioskContext) {
    let mut events = ctx.events().history_plus_stream();
    let token = ctx.token().clone();
    loop {
        let event = tokio::select! {
            () = token.cancelled() => break,
            event = events.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match serde_json::to_string(&event) {
            Ok(line) => {
                let mut stdout = std::io::stdout().lock();
                if writeln!(stdout, "{line}").and_then(|()| stdout.flush()).is_err() {
                    break;
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize event"),
        }
    }
}
