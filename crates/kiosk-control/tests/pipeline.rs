//! End-to-end tests through a virtual serial pair.

use std::{
    io::{BufRead, BufReader, ErrorKind, Write},
    sync::Arc,
    time::Duration,
};

use kiosk_control::{
    Controller, ControllerHandle, Dispatcher, GameConfig, GameLauncher, MemoryLedger,
    SystemProcessTable, WatchdogSettings,
};
use kiosk_core::{
    BalanceTransition, Command, KioskContext, KioskEvent, Ledger, LogNotifier, Money, Outcome,
};
use kiosk_protocol::{ExpectedToken, LineDecoder};
use kiosk_serial::{FixedPathTransport, VirtualSerialPair};
use tokio::sync::broadcast;

const TOKEN: &str = "sometoken13chars+";
const WAIT: Duration = Duration::from_secs(5);

struct Rig {
    _dir: tempfile::TempDir,
    pair: VirtualSerialPair,
    ledger: Arc<MemoryLedger>,
    controller: ControllerHandle,
    events: broadcast::Receiver<KioskEvent>,
}

async fn start(ledger: MemoryLedger, watchdog: Option<WatchdogSettings>) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let pair = VirtualSerialPair::create(
        dir.path().join("ttyVirtual0"),
        dir.path().join("ttyVirtual1"),
    )
    .unwrap();

    let ctx = KioskContext::new();
    let events = ctx.events().subscribe();
    let ledger = Arc::new(ledger);
    let notifier = Arc::new(LogNotifier);
    let dispatcher = Dispatcher::new(
        ledger.clone(),
        notifier.clone(),
        GameLauncher::new(Arc::new(SystemProcessTable::new()), GameConfig::default()),
        Arc::clone(ctx.events()),
    );
    let transport = FixedPathTransport::new(pair.host_path().to_string_lossy(), 9600);
    let decoder = LineDecoder::new(ExpectedToken::new(TOKEN).unwrap());

    let controller = Controller::new(
        ctx,
        Arc::new(transport),
        decoder,
        dispatcher,
        ledger.clone(),
        notifier,
    )
    .supervise_interval(Duration::from_millis(20))
    .watchdog(watchdog)
    .spawn();

    let deadline = tokio::time::Instant::now() + WAIT;
    while !controller.link().is_connected() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "link never attached"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Rig {
        _dir: dir,
        pair,
        ledger,
        controller,
        events,
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<KioskEvent>,
    mut predicate: impl FnMut(&KioskEvent) -> bool,
) -> KioskEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not seen in time")
}

fn send(device: &mut impl Write, lines: &[&str]) {
    for line in lines {
        device.write_all(format!("{line}\n").as_bytes()).unwrap();
    }
    device.flush().unwrap();
}

fn is_dispatched(event: &KioskEvent) -> bool {
    matches!(event, KioskEvent::Dispatched { .. })
}

fn is_rejected(event: &KioskEvent) -> bool {
    matches!(event, KioskEvent::LineRejected { .. })
}

fn dispatched(history: &[KioskEvent]) -> Vec<Command> {
    history
        .iter()
        .filter_map(|e| match e {
            KioskEvent::Dispatched { command, .. } => Some(command.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn token_then_clear_dispatches_one_clear() {
    let mut rig = start(
        MemoryLedger::new(Money::ZERO).with_balance(Money::from_major(10)),
        None,
    )
    .await;
    let mut device = rig.pair.open_device(9600).unwrap();

    send(&mut device, &[TOKEN, "3217"]);
    wait_for(&mut rig.events, is_dispatched).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let history = rig.controller.context().events().history();
    assert_eq!(dispatched(&history), vec![Command::Clear]);
    assert!(history.contains(&KioskEvent::AuthChanged {
        authenticated: true,
    }));
    assert_eq!(rig.ledger.balance().await.unwrap(), Money::ZERO);

    rig.controller.shutdown().await;
}

#[tokio::test]
async fn load_code_credits_account() {
    let mut rig = start(MemoryLedger::new(Money::from_major(100)), None).await;
    let mut device = rig.pair.open_device(9600).unwrap();

    send(&mut device, &[TOKEN, "3127"]);
    let event = wait_for(&mut rig.events, is_dispatched).await;
    assert_eq!(
        event,
        KioskEvent::Dispatched {
            command: Command::LoadAmount(10),
            outcome: Outcome::Applied,
        }
    );
    assert_eq!(rig.ledger.balance().await.unwrap(), Money::from_major(10));

    rig.controller.shutdown().await;
}

#[tokio::test]
async fn commands_without_token_are_dropped() {
    let mut rig = start(MemoryLedger::new(Money::from_major(100)), None).await;
    let mut device = rig.pair.open_device(9600).unwrap();

    send(&mut device, &["3127", "wrong-token-value", "3567"]);
    for _ in 0..3 {
        wait_for(&mut rig.events, is_rejected).await;
    }

    let history = rig.controller.context().events().history();
    assert!(dispatched(&history).is_empty());
    assert!(rig.ledger.audit_log().unwrap().is_empty());

    rig.controller.shutdown().await;
}

#[tokio::test]
async fn watchdog_signals_spend_but_not_clear() {
    let settings = WatchdogSettings {
        interval: Duration::from_millis(20),
        retry_interval: Duration::from_millis(60),
        spend_signal: "111111".to_string(),
    };
    let mut rig = start(MemoryLedger::new(Money::from_major(100)), Some(settings)).await;
    let device = rig.pair.open_device(9600).unwrap();
    let is_balance = |wanted: BalanceTransition| {
        move |e: &KioskEvent| {
            matches!(e, KioskEvent::Balance { transition, .. } if *transition == wanted)
        }
    };

    wait_for(&mut rig.events, is_balance(BalanceTransition::Initial)).await;

    // [10] -> [0]: explicit clear, no signal.
    rig.ledger.credit(Money::from_major(10)).await.unwrap();
    wait_for(&mut rig.events, is_balance(BalanceTransition::Increase)).await;
    rig.ledger.clear().await.unwrap();
    wait_for(&mut rig.events, is_balance(BalanceTransition::Cleared)).await;

    // [10] -> [7]: unexplained spend, exactly one signal.
    rig.ledger.credit(Money::from_major(10)).await.unwrap();
    wait_for(&mut rig.events, is_balance(BalanceTransition::Increase)).await;
    rig.ledger.consume(Money::from_major(3)).unwrap();
    wait_for(&mut rig.events, is_balance(BalanceTransition::Spent)).await;

    let received = tokio::task::spawn_blocking(move || {
        let mut reader = BufReader::new(device);
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => lines.push(line),
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => panic!("device read failed: {e}"),
            }
        }
        lines
    })
    .await
    .unwrap();
    assert_eq!(received, ["111111\n"]);

    rig.controller.shutdown().await;
}
