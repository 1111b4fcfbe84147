//! Network service lifecycle for the captive portal.
//!
//! Provides:
//! - `NetworkServiceState` - Target interface, access point and DHCP settings
//! - `NetworkManager` - Apply and tear down the access point stack
//! - `reclaim_port` - Free a TCP port held by stray listeners
//! - `CommandRunner` / `PortControl` - Seams to the host, with system implementations

pub mod error;
pub mod firewall;
pub mod manager;
pub mod port;
pub mod runner;
pub mod state;

pub use error::{NetworkError, Step};
pub use firewall::{FirewallRule, Position, Table, portal_rules};
pub use manager::{ApplyReport, NetworkManager};
pub use port::{Listener, PortControl, PortSignal, ReclaimSettings, SystemPortControl, reclaim_port};
pub use runner::{CommandOutput, CommandRunner, SystemRunner};
pub use state::NetworkServiceState;
