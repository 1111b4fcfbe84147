//! Interactive mock of the kiosk microcontroller.
//!
//! Run with: cargo run -p mock-device
//!
//! Creates a virtual serial pair, then point the daemon at the host end:
//!
//! ```text
//! KIOSK_DEVICE__MODE=fixed KIOSK_DEVICE__PATH=/tmp/ttyVirtual1 kioskd
//! ```
//!
//! Type `help` for the command list. Lines the kiosk sends back are printed
//! as they arrive.

use std::{
    io::{BufRead, BufReader, ErrorKind, Write},
    path::PathBuf,
    time::Duration,
};

use anyhow::Context as _;
use clap::Parser;
use kiosk_protocol::ExpectedToken;
use kiosk_serial::VirtualSerialPair;
use serialport::SerialPort;
use tokio::io::{AsyncBufReadExt, BufReader as AsyncBufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mock-device", about = "Virtual kiosk microcontroller")]
struct Args {
    /// Endpoint this mock writes to.
    #[arg(long, default_value = "/tmp/ttyVirtual0")]
    device_path: PathBuf,

    /// Endpoint the kiosk attaches to.
    #[arg(long, default_value = "/tmp/ttyVirtual1")]
    host_path: PathBuf,

    #[arg(long, default_value_t = 9600)]
    baud_rate: u32,

    /// Token to send on `auth`; derived from the machine id if unset.
    #[arg(long)]
    token: Option<String>,

    #[arg(long, default_value = "/etc/machine-id")]
    machine_id_path: PathBuf,

    /// Do not send the token automatically after start.
    #[arg(long)]
    no_auto_auth: bool,
}

/// What a typed command asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Auth,
    Send(String),
    Help,
    Quit,
}

/// Map a typed command to an action. Loads are in whole units.
fn parse_input(input: &str) -> Option<Action> {
    let input = input.trim();
    if let Some(code) = input.strip_prefix("custom ") {
        let code = code.trim();
        return (!code.is_empty()).then(|| Action::Send(code.to_string()));
    }
    let code = match input {
        "auth" | "a" => return Some(Action::Auth),
        "help" | "h" | "?" => return Some(Action::Help),
        "quit" | "q" => return Some(Action::Quit),
        "clear" | "c" => "3217",
        "load5" | "l5" => "3117",
        "load10" | "l10" => "3127",
        "load20" | "l20" => "3147",
        "load50" | "l50" => "31107",
        "load100" | "l100" => "3567",
        "load1" | "l1" => "3131",
        "load500" | "l500" => "3687",
        "game" | "g" => "3357",
        "earnings" | "e" => "4455",
        _ => return None,
    };
    Some(Action::Send(code.to_string()))
}

fn print_help() {
    println!("\nCommands");
    println!("{}", "-".repeat(40));
    println!("  auth, a        send the auth token");
    println!("  clear, c       clear the balance (3217)");
    println!("  load5, l5      load 5");
    println!("  load10, l10    load 10");
    println!("  load20, l20    load 20");
    println!("  load50, l50    load 50");
    println!("  load100, l100  load 100");
    println!("  load1, l1      load 1");
    println!("  load500, l500  load 500");
    println!("  game, g        toggle the game (3357)");
    println!("  earnings, e    show earnings (4455)");
    println!("  custom <code>  send a raw line");
    println!("  help, h        this list");
    println!("  quit, q        exit");
    println!("{}", "-".repeat(40));
}

fn send(port: &mut dyn SerialPort, line: &str) -> anyhow::Result<()> {
    port.write_all(format!("{line}\n").as_bytes())?;
    port.flush()?;
    println!("[sent] -> {line}");
    Ok(())
}

/// Print whatever the kiosk writes back until the port closes.
fn echo_inbound(port: Box<dyn SerialPort>) {
    let mut reader = BufReader::new(port);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => println!("\n[received] <- {}", line.trim_end()),
            Err(e) if e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                tracing::warn!(error = %e, "Read from kiosk failed");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let token = match &args.token {
        Some(token) => Some(ExpectedToken::new(token.clone()).context("invalid --token")?),
        None => match ExpectedToken::from_identifier_file(&args.machine_id_path) {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(error = %e, "No token available, `auth` is disabled");
                None
            }
        },
    };

    let pair = VirtualSerialPair::create(args.device_path.clone(), args.host_path.clone())
        .context("creating virtual serial pair")?;
    let mut port = pair.open_device(args.baud_rate).context("opening device end")?;
    let reader = port.try_clone().context("cloning device port")?;
    std::thread::Builder::new()
        .name("mock-device-reader".to_string())
        .spawn(move || echo_inbound(reader))
        .context("spawning reader thread")?;

    println!("Mock device ready");
    println!("  device end: {}", pair.device_path().display());
    println!("  kiosk end:  {}", pair.host_path().display());
    print_help();

    let send_token = |port: &mut dyn SerialPort| -> anyhow::Result<()> {
        match &token {
            Some(token) => send(port, token.as_str()),
            None => {
                println!("[error] no token available");
                Ok(())
            }
        }
    };

    if !args.no_auto_auth {
        println!("\nSending token in 2 seconds...");
        tokio::time::sleep(Duration::from_secs(2)).await;
        send_token(port.as_mut())?;
    }

    let mut stdin = AsyncBufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        std::io::stdout().flush()?;

        let input = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = stdin.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        if input.trim().is_empty() {
            continue;
        }

        match parse_input(&input) {
            Some(Action::Auth) => send_token(port.as_mut())?,
            Some(Action::Send(code)) => send(port.as_mut(), &code)?,
            Some(Action::Help) => print_help(),
            Some(Action::Quit) => break,
            None => println!("[warn] unknown command '{}', type help", input.trim()),
        }
    }

    println!("\nMock device closed");
    drop(pair);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(input: &str) -> Option<String> {
        match parse_input(input) {
            Some(Action::Send(code)) => Some(code),
            _ => None,
        }
    }

    #[test]
    fn test_shortcuts_map_to_codes() {
        assert_eq!(code("clear").as_deref(), Some("3217"));
        assert_eq!(code("load5").as_deref(), Some("3117"));
        assert_eq!(code("l10").as_deref(), Some("3127"));
        assert_eq!(code("load50").as_deref(), Some("31107"));
        assert_eq!(code("load100").as_deref(), Some("3567"));
        assert_eq!(code("load1").as_deref(), Some("3131"));
        assert_eq!(code("load500").as_deref(), Some("3687"));
        assert_eq!(code("game").as_deref(), Some("3357"));
        assert_eq!(code("  earnings ").as_deref(), Some("4455"));
    }

    #[test]
    fn test_other_inputs() {
        assert_eq!(parse_input("auth"), Some(Action::Auth));
        assert_eq!(parse_input("q"), Some(Action::Quit));
        assert_eq!(
            parse_input("custom 3999"),
            Some(Action::Send("3999".into()))
        );
        assert_eq!(parse_input("custom   "), None);
        assert_eq!(parse_input("dance"), None);
    }
}
