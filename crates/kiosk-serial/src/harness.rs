//! Virtual serial pair for driving the link without hardware.
//!
//! Two pseudo-terminals are opened and their master sides are bridged by a
//! background thread, so bytes written to one slave come out of the other.
//! Each slave is exposed at a caller-chosen path through a symlink, which
//! lets a separate process attach as if it were a physical device.

use std::{
    fs::File,
    io::{self, Read, Write},
    os::{fd::AsFd, unix::fs::symlink},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    pty::openpty,
    sys::termios::{SetArg, cfmakeraw, tcgetattr, tcsetattr},
    unistd::ttyname,
};
use serialport::SerialPort;

use crate::TransportError;

const BRIDGE_POLL_MS: u16 = 100;
const DEVICE_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Two linked serial endpoints at named paths.
///
/// `device_path` is the microcontroller side, `host_path` is what the
/// kiosk attaches to. Paths are removed on drop.
pub struct VirtualSerialPair {
    device_path: PathBuf,
    host_path: PathBuf,
    stop: Arc<AtomicBool>,
    bridge: Option<JoinHandle<()>>,
    // Held open so the masters never see a hangup between attaches.
    _slaves: [File; 2],
}

impl VirtualSerialPair {
    /// Create the pair. Stale files at either path are removed first, so a
    /// pair can be recreated after an unclean exit.
    ///
    /// # Errors
    /// Returns error if a pseudo-terminal cannot be allocated or a path
    /// cannot be created.
    pub fn create(
        device_path: impl Into<PathBuf>,
        host_path: impl Into<PathBuf>,
    ) -> Result<Self, TransportError> {
        let device_path = device_path.into();
        let host_path = host_path.into();

        let (device_master, device_slave) = open_raw_pty()?;
        let (host_master, host_slave) = open_raw_pty()?;

        publish(&device_slave, &device_path)?;
        if let Err(e) = publish(&host_slave, &host_path) {
            remove_stale(&device_path);
            return Err(e);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let bridge = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("kiosk-virtual-bridge".into())
                .spawn(move || bridge(&device_master, &host_master, &stop))?
        };

        tracing::info!(
            device = %device_path.display(),
            host = %host_path.display(),
            "Virtual serial pair created"
        );
        Ok(Self {
            device_path,
            host_path,
            stop,
            bridge: Some(bridge),
            _slaves: [device_slave, host_slave],
        })
    }

    /// Device side path.
    #[must_use]
    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    /// Host side path, for a `FixedPathTransport`.
    #[must_use]
    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    /// Both endpoints as `(device, host)`.
    #[must_use]
    pub fn endpoints(&self) -> (&Path, &Path) {
        (&self.device_path, &self.host_path)
    }

    /// Open the device side as a serial port.
    ///
    /// # Errors
    /// Returns error if the port cannot be opened.
    pub fn open_device(&self, baud_rate: u32) -> Result<Box<dyn SerialPort>, TransportError> {
        let path = self.device_path.to_string_lossy();
        serialport::new(path.as_ref(), baud_rate)
            .timeout(DEVICE_READ_TIMEOUT)
            .open()
            .map_err(|source| TransportError::Open {
                path: path.to_string(),
                source,
            })
    }
}

impl Drop for VirtualSerialPair {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(bridge) = self.bridge.take() {
            let _ = bridge.join();
        }
        remove_stale(&self.device_path);
        remove_stale(&self.host_path);
        tracing::debug!("Virtual serial pair removed");
    }
}

fn open_raw_pty() -> Result<(File, File), TransportError> {
    let pty = openpty(None, None).map_err(io::Error::from)?;
    let mut termios = tcgetattr(&pty.slave).map_err(io::Error::from)?;
    cfmakeraw(&mut termios);
    tcsetattr(&pty.slave, SetArg::TCSANOW, &termios).map_err(io::Error::from)?;
    Ok((File::from(pty.master), File::from(pty.slave)))
}

fn publish(slave: &File, path: &Path) -> Result<(), TransportError> {
    let target = ttyname(slave.as_fd()).map_err(io::Error::from)?;
    remove_stale(path);
    symlink(&target, path)?;
    Ok(())
}

fn remove_stale(path: &Path) {
    if path.symlink_metadata().is_ok() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove path");
        }
    }
}

fn bridge(a: &File, b: &File, stop: &AtomicBool) {
    let mut buf = [0u8; 1024];
    while !stop.load(Ordering::Acquire) {
        let (a_ready, b_ready) = {
            let mut fds = [
                PollFd::new(a.as_fd(), PollFlags::POLLIN),
                PollFd::new(b.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::from(BRIDGE_POLL_MS)) {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Bridge poll failed");
                    break;
                }
            }
            (readable(&fds[0]), readable(&fds[1]))
        };
        if a_ready && !pump(a, b, &mut buf) {
            break;
        }
        if b_ready && !pump(b, a, &mut buf) {
            break;
        }
    }
}

fn readable(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .is_some_and(|events| events.intersects(PollFlags::POLLIN))
}

fn pump(mut from: &File, mut to: &File, buf: &mut [u8]) -> bool {
    match from.read(buf) {
        Ok(0) => true,
        Ok(n) => match to.write_all(&buf[..n]) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Bridge write failed");
                false
            }
        },
        Err(e) if e.kind() == io::ErrorKind::Interrupted => true,
        Err(e) => {
            tracing::warn!(error = %e, "Bridge read failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};

    use super::*;

    #[test]
    fn test_bytes_cross_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let pair =
            VirtualSerialPair::create(dir.path().join("dev"), dir.path().join("host")).unwrap();

        let mut device = pair.open_device(9600).unwrap();
        let mut host = serialport::new(pair.host_path().to_string_lossy(), 9600)
            .timeout(Duration::from_secs(1))
            .open()
            .unwrap();

        device.write_all(b"3217\n").unwrap();
        let mut line = String::new();
        BufReader::new(host.try_clone().unwrap())
            .read_line(&mut line)
            .unwrap();
        assert_eq!(line, "3217\n");

        host.write_all(b"111111\n").unwrap();
        let mut line = String::new();
        BufReader::new(device).read_line(&mut line).unwrap();
        assert_eq!(line, "111111\n");
    }

    #[test]
    fn test_stale_paths_replaced_and_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("dev");
        let host = dir.path().join("host");
        std::fs::write(&device, b"stale").unwrap();
        symlink("/nonexistent", &host).unwrap();

        let pair = VirtualSerialPair::create(&device, &host).unwrap();
        assert!(device.exists());
        assert!(host.exists());
        drop(pair);

        assert!(device.symlink_metadata().is_err());
        assert!(host.symlink_metadata().is_err());

        let again = VirtualSerialPair::create(&device, &host).unwrap();
        assert_eq!(again.endpoints(), (device.as_path(), host.as_path()));
    }
}
