//! Port reclamation.
//!
//! A stale portal server from a previous run can hold the listening port.
//! [`reclaim_port`] asks every listener to exit, escalates to a kill for the
//! ones that ignore it, and retries until a test bind succeeds.

use std::{
    net::{Ipv4Addr, TcpListener},
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};

use crate::NetworkError;

/// TCP state code for `LISTEN` in `/proc/net/tcp`.
const TCP_LISTEN: &str = "0A";

/// A process listening on a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub pid: i32,
    pub name: String,
}

/// Signals used while reclaiming a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSignal {
    /// Graceful termination request.
    Terminate,
    /// Forceful kill.
    Kill,
}

/// Retry and timeout policy for [`reclaim_port`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimSettings {
    pub retries: u32,
    /// How long a listener gets to exit after the graceful signal.
    pub graceful_timeout: Duration,
    /// Pause after each round before the next bind test.
    pub settle: Duration,
    /// Liveness poll interval while waiting for exit.
    pub poll_interval: Duration,
}

impl Default for ReclaimSettings {
    fn default() -> Self {
        Self {
            retries: 3,
            graceful_timeout: Duration::from_secs(5),
            settle: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Host operations needed to free a port.
#[async_trait]
pub trait PortControl: Send + Sync {
    /// Whether a test bind on the port succeeds.
    fn is_free(&self, port: u16) -> bool;

    /// Processes listening on the port.
    ///
    /// # Errors
    /// Returns error if the socket tables cannot be read.
    async fn listeners(&self, port: u16) -> Result<Vec<Listener>, NetworkError>;

    /// Deliver a signal. A process that already exited is not an error.
    ///
    /// # Errors
    /// Returns error if the signal cannot be delivered.
    fn signal(&self, pid: i32, signal: PortSignal) -> Result<(), NetworkError>;

    /// Whether the process still exists.
    fn is_alive(&self, pid: i32) -> bool;
}

/// Free `port`, terminating the processes that hold it.
///
/// # Errors
/// Returns `NetworkError::PortBusy` if the port is still taken after every
/// retry. Callers must not start serving in that case.
pub async fn reclaim_port(
    control: &dyn PortControl,
    port: u16,
    settings: &ReclaimSettings,
) -> Result<(), NetworkError> {
    tracing::info!(port, "Checking port availability");

    for attempt in 1..=settings.retries {
        if control.is_free(port) {
            tracing::info!(port, "Port is available");
            return Ok(());
        }

        let listeners = control.listeners(port).await?;
        if listeners.is_empty() {
            tracing::warn!(port, attempt, "Port busy but no listening process found");
        } else {
            tracing::warn!(port, attempt, count = listeners.len(), "Port held by other processes");
            evict(control, &listeners, settings).await;
        }
        tokio::time::sleep(settings.settle).await;
    }

    if control.is_free(port) {
        tracing::info!(port, "Port reclaimed");
        Ok(())
    } else {
        tracing::error!(port, attempts = settings.retries, "Failed to free port");
        Err(NetworkError::PortBusy {
            port,
            attempts: settings.retries,
        })
    }
}

/// Terminate every listener, then kill the ones still alive at the deadline.
async fn evict(control: &dyn PortControl, listeners: &[Listener], settings: &ReclaimSettings) {
    let mut pending = Vec::with_capacity(listeners.len());
    for listener in listeners {
        tracing::info!(pid = listener.pid, name = %listener.name, "Sending SIGTERM");
        match control.signal(listener.pid, PortSignal::Terminate) {
            Ok(()) => pending.push(listener),
            Err(e) => tracing::error!(pid = listener.pid, error = %e, "Cannot signal listener"),
        }
    }

    let deadline = tokio::time::Instant::now() + settings.graceful_timeout;
    loop {
        pending.retain(|l| control.is_alive(l.pid));
        if pending.is_empty() || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(settings.poll_interval).await;
    }

    for listener in pending {
        tracing::warn!(
            pid = listener.pid,
            name = %listener.name,
            "Listener ignored SIGTERM, sending SIGKILL"
        );
        if let Err(e) = control.signal(listener.pid, PortSignal::Kill) {
            tracing::error!(pid = listener.pid, error = %e, "Cannot kill listener");
        }
    }
}

/// Port control backed by procfs and real signals.
#[derive(Debug, Clone)]
pub struct SystemPortControl {
    proc_root: PathBuf,
}

impl Default for SystemPortControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemPortControl {
    #[must_use]
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    #[must_use]
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// Socket inodes listening on `port`, from `net/tcp` and `net/tcp6`.
    fn listening_inodes(&self, port: u16) -> Vec<u64> {
        let mut inodes = Vec::new();
        for table in ["net/tcp", "net/tcp6"] {
            let Ok(contents) = std::fs::read_to_string(self.proc_root.join(table)) else {
                continue;
            };
            let rows = contents.lines().skip(1);
            inodes.extend(rows.filter_map(|l| parse_listener(l, port)));
        }
        inodes
    }

    /// Map socket inodes to owning processes by walking `<pid>/fd`.
    ///
    /// # Errors
    /// Returns error if the procfs root cannot be listed.
    pub fn scan(&self, port: u16) -> Result<Vec<Listener>, NetworkError> {
        let inodes = self.listening_inodes(port);
        if inodes.is_empty() {
            return Ok(Vec::new());
        }
        let targets: Vec<String> = inodes.iter().map(|i| format!("socket:[{i}]")).collect();

        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.proc_root)? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            else {
                continue;
            };
            if holds_socket(&entry.path(), &targets) {
                let name = std::fs::read_to_string(entry.path().join("comm"))
                    .map(|n| n.trim().to_string())
                    .unwrap_or_default();
                found.push(Listener { pid, name });
            }
        }
        Ok(found)
    }
}

fn holds_socket(process_dir: &Path, targets: &[String]) -> bool {
    let Ok(fds) = std::fs::read_dir(process_dir.join("fd")) else {
        return false;
    };
    fds.filter_map(Result::ok).any(|fd| {
        std::fs::read_link(fd.path())
            .is_ok_and(|link| targets.iter().any(|t| link.as_os_str() == t.as_str()))
    })
}

/// Parse one `/proc/net/tcp` row; returns the inode if it listens on `port`.
fn parse_listener(line: &str, port: u16) -> Option<u64> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let local = fields.get(1)?;
    let state = fields.get(3)?;
    let inode = fields.get(9)?;

    let (_, hex_port) = local.rsplit_once(':')?;
    let local_port = u16::from_str_radix(hex_port, 16).ok()?;
    if local_port != port || !state.eq_ignore_ascii_case(TCP_LISTEN) {
        return None;
    }
    inode.parse().ok().filter(|&i| i != 0)
}

#[async_trait]
impl PortControl for SystemPortControl {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
    }

    async fn listeners(&self, port: u16) -> Result<Vec<Listener>, NetworkError> {
        let control = self.clone();
        tokio::task::spawn_blocking(move || control.scan(port))
            .await
            .map_err(|e| NetworkError::Io(std::io::Error::other(e)))?
    }

    fn signal(&self, pid: i32, signal: PortSignal) -> Result<(), NetworkError> {
        let signal = match signal {
            PortSignal::Terminate => Signal::SIGTERM,
            PortSignal::Kill => Signal::SIGKILL,
        };
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(NetworkError::Signal {
                pid,
                reason: e.to_string(),
            }),
        }
    }

    fn is_alive(&self, pid: i32) -> bool {
        matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
    }
}
