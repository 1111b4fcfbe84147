//! Link identity.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::TransportError;

/// USB vendor/product id pair, written `VID:PID` in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub vid: u16,
    pub pid: u16,
}

impl DeviceId {
    #[must_use]
    pub const fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }
}

impl FromStr for DeviceId {
    type Err = TransportError;

    /// Parse `1A86:7523`. Hex digits are case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidDeviceId(s.to_string());
        let (vid, pid) = s.trim().split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            vid: u16::from_str_radix(vid, 16).map_err(|_| invalid())?,
            pid: u16::from_str_radix(pid, 16).map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vid, self.pid)
    }
}

/// A transport endpoint the supervisor can attach to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub path: String,
    pub baud_rate: u32,
    /// Set when the link was found by USB discovery.
    pub device: Option<DeviceId>,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device {
            Some(id) => write!(f, "{} [{id}] @ {}", self.path, self.baud_rate),
            None => write!(f, "{} @ {}", self.path, self.baud_rate),
        }
    }
}
