//! Network lifecycle errors.

use std::fmt;

use thiserror::Error;

/// One step of the apply or teardown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CheckInterface,
    ReleaseManager,
    LinkDown,
    FlushAddress,
    AssignAddress,
    LinkUp,
    RenderConfig,
    AccessPoint,
    DhcpDns,
    Firewall,
    RestoreManager,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CheckInterface => "check interface",
            Self::ReleaseManager => "release interface from network manager",
            Self::LinkDown => "bring interface down",
            Self::FlushAddress => "flush addresses",
            Self::AssignAddress => "assign static address",
            Self::LinkUp => "bring interface up",
            Self::RenderConfig => "render service config",
            Self::AccessPoint => "start access point",
            Self::DhcpDns => "start DHCP/DNS server",
            Self::Firewall => "install firewall rules",
            Self::RestoreManager => "return interface to network manager",
        };
        f.write_str(name)
    }
}

/// Network service error.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("{step} failed: {cause}")]
    Step { step: Step, cause: String },

    #[error("port {port} still busy after {attempts} attempts")]
    PortBusy { port: u16, attempts: u32 },

    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("failed to signal process {pid}: {reason}")]
    Signal { pid: i32, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    pub(crate) fn step(step: Step, cause: impl fmt::Display) -> Self {
        Self::Step {
            step,
            cause: cause.to_string(),
        }
    }
}
