//! Serial transport and link supervision.
//!
//! Provides:
//! - `Transport` - Capability trait for finding and opening a device link
//! - `SerialTransport` - USB discovery by vendor/product id allow-list
//! - `FixedPathTransport` - Attach to a configured path
//! - `LinkSupervisor` - Attach, read lines, reattach on failure
//! - `LinkHandle` - Send lines on the current link
//! - `VirtualSerialPair` - Linked pseudo-terminal pair (feature `harness`)

pub mod error;
#[cfg(any(test, feature = "harness"))]
pub mod harness;
pub mod link;
pub mod supervisor;
pub mod transport;

pub use error::TransportError;
#[cfg(any(test, feature = "harness"))]
pub use harness::VirtualSerialPair;
pub use link::{DeviceId, Link};
pub use supervisor::{InboundLine, LinkHandle, LinkSupervisor};
pub use transport::{FixedPathTransport, SerialTransport, Transport};
