//! Transport capability: how a link is found and opened.

use std::{path::Path, time::Duration};

use serialport::{SerialPort, SerialPortInfo, SerialPortType};

use crate::{DeviceId, Link, TransportError};

/// Read timeout on an open port. Bounds how long the read loop can go
/// without checking for cancellation.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Finds and opens the device link.
///
/// Implementations are selected by configuration: physical USB discovery
/// or a fixed path such as one end of a [`VirtualSerialPair`](crate::VirtualSerialPair).
pub trait Transport: Send + Sync {
    /// Human readable description for logs.
    fn describe(&self) -> String;

    /// Find a candidate endpoint.
    ///
    /// # Errors
    /// Returns `TransportError::NotFound` if no endpoint is currently present.
    fn discover(&self) -> Result<Link, TransportError>;

    /// Open a discovered endpoint.
    ///
    /// # Errors
    /// Returns error if the port cannot be opened.
    fn open(&self, link: &Link) -> Result<Box<dyn SerialPort>, TransportError> {
        serialport::new(link.path.as_str(), link.baud_rate)
            .timeout(READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .open()
            .map_err(|source| TransportError::Open {
                path: link.path.clone(),
                source,
            })
    }
}

/// USB serial discovery filtered by a vendor/product id allow-list.
#[derive(Debug, Clone)]
pub struct SerialTransport {
    allowed: Vec<DeviceId>,
    baud_rate: u32,
}

impl SerialTransport {
    #[must_use]
    pub const fn new(allowed: Vec<DeviceId>, baud_rate: u32) -> Self {
        Self { allowed, baud_rate }
    }

    /// Pick the first port whose USB ids are allowed.
    fn select(&self, ports: &[SerialPortInfo]) -> Option<Link> {
        ports.iter().find_map(|port| {
            let SerialPortType::UsbPort(usb) = &port.port_type else {
                return None;
            };
            let id = DeviceId::new(usb.vid, usb.pid);
            self.allowed.contains(&id).then(|| Link {
                path: port.port_name.clone(),
                baud_rate: self.baud_rate,
                device: Some(id),
            })
        })
    }
}

impl Transport for SerialTransport {
    fn describe(&self) -> String {
        let ids: Vec<String> = self.allowed.iter().map(ToString::to_string).collect();
        format!("usb serial [{}]", ids.join(", "))
    }

    fn discover(&self) -> Result<Link, TransportError> {
        let ports = serialport::available_ports().map_err(TransportError::Enumerate)?;
        tracing::trace!(count = ports.len(), "Enumerated serial ports");
        self.select(&ports).ok_or(TransportError::NotFound)
    }
}

/// Attach to a fixed device path.
#[derive(Debug, Clone)]
pub struct FixedPathTransport {
    path: String,
    baud_rate: u32,
}

impl FixedPathTransport {
    #[must_use]
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

impl Transport for FixedPathTransport {
    fn describe(&self) -> String {
        format!("fixed path {}", self.path)
    }

    fn discover(&self) -> Result<Link, TransportError> {
        if !Path::new(&self.path).exists() {
            return Err(TransportError::NotFound);
        }
        Ok(Link {
            path: self.path.clone(),
            baud_rate: self.baud_rate,
            device: None,
        })
    }
}
