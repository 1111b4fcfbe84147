//! Daemon configuration.
//!
//! Layered with figment: built-in defaults, then the TOML file, then
//! `KIOSK_` environment variables with `__` separating sections
//! (`KIOSK_DEVICE__BAUD_RATE=115200`).

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use kiosk_control::{GameConfig, WatchdogSettings};
use kiosk_core::Money;
use kiosk_network::{NetworkServiceState, ReclaimSettings};
use kiosk_protocol::{ExpectedToken, MAX_COMMAND_LEN};
use kiosk_serial::{DeviceId, FixedPathTransport, SerialTransport, Transport};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SYSTEM_CONFIG: &str = "/etc/kiosk/kiosk.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub auth: AuthConfig,
    pub ledger: LedgerConfig,
    pub watchdog: WatchdogConfig,
    pub game: GameConfig,
    pub network: NetworkConfig,
    pub reclaim: ReclaimConfig,
}

/// How the device link is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Enumerate USB serial ports and pick an allowed VID:PID.
    Serial,
    /// Open a fixed path, e.g. a virtual serial endpoint.
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub mode: TransportMode,
    /// Allowed `VID:PID` pairs in hex.
    pub allowed: Vec<String>,
    pub baud_rate: u32,
    /// Port path for `fixed` mode.
    pub path: Option<String>,
    pub supervise_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Serial,
            allowed: vec!["1A86:7523".to_string(), "2341:8037".to_string()],
            baud_rate: 9600,
            path: None,
            supervise_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// The token is derived from this file unless `token` is set.
    pub machine_id_path: PathBuf,
    pub token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            machine_id_path: PathBuf::from("/etc/machine-id"),
            token: None,
        }
    }
}

/// Starting amounts for the in-memory ledger, in whole units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub pool: i64,
    pub balance: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            pool: 1000,
            balance: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub retry_interval_ms: u64,
    pub spend_signal: String,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            retry_interval_ms: 3000,
            spend_signal: "111111".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Set up the access point and firewall on start. Needs root.
    pub enabled: bool,
    #[serde(flatten)]
    pub service: NetworkServiceState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    pub retries: u32,
    pub graceful_timeout_ms: u64,
    pub settle_ms: u64,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            graceful_timeout_ms: 5000,
            settle_ms: 1000,
        }
    }
}

impl Config {
    /// Load from defaults, the config file and the environment, then
    /// validate.
    ///
    /// `path` overrides the file lookup; otherwise the system file is used
    /// if present, else the per-user one.
    ///
    /// # Errors
    /// Returns error if a source is malformed or a value is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(default_path, Path::to_path_buf);
        tracing::debug!(path = %path.display(), "Loading configuration");

        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("KIOSK_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.allowed_devices()?;
        if self.device.baud_rate == 0 {
            return Err(invalid("device.baud_rate", "must be positive"));
        }
        if self.device.mode == TransportMode::Fixed && self.device.path.is_none() {
            return Err(invalid("device.path", "required in fixed mode"));
        }
        if self.device.supervise_interval_ms == 0 {
            return Err(invalid("device.supervise_interval_ms", "must be positive"));
        }
        if let Some(token) = &self.auth.token {
            if token.chars().count() <= MAX_COMMAND_LEN {
                return Err(invalid(
                    "auth.token",
                    format!("must be longer than {MAX_COMMAND_LEN} characters"),
                ));
            }
        }
        if self.ledger.pool < 0 || self.ledger.balance < 0 {
            return Err(invalid("ledger", "amounts must not be negative"));
        }
        if self.watchdog.interval_ms == 0 || self.watchdog.retry_interval_ms == 0 {
            return Err(invalid("watchdog", "intervals must be positive"));
        }
        if self.watchdog.spend_signal.trim().is_empty() {
            return Err(invalid("watchdog.spend_signal", "must not be empty"));
        }
        if self.network.service.prefix_len > 32 {
            return Err(invalid("network.prefix_len", "must be at most 32"));
        }
        if self.network.service.portal_port == 0 {
            return Err(invalid("network.portal_port", "must be non-zero"));
        }
        if self.reclaim.retries == 0 {
            return Err(invalid("reclaim.retries", "must be at least 1"));
        }
        Ok(())
    }

    /// # Errors
    /// Returns error if an entry is not `VID:PID` hex.
    pub fn allowed_devices(&self) -> Result<Vec<DeviceId>, ConfigError> {
        self.device
            .allowed
            .iter()
            .map(|s| s.parse().map_err(|e| invalid("device.allowed", format!("{e}"))))
            .collect()
    }

    /// # Errors
    /// Returns error if the device section is invalid.
    pub fn transport(&self) -> Result<Arc<dyn Transport>, ConfigError> {
        match self.device.mode {
            TransportMode::Serial => Ok(Arc::new(SerialTransport::new(
                self.allowed_devices()?,
                self.device.baud_rate,
            ))),
            TransportMode::Fixed => {
                let path = self
                    .device
                    .path
                    .clone()
                    .ok_or_else(|| invalid("device.path", "required in fixed mode"))?;
                let transport = FixedPathTransport::new(path, self.device.baud_rate);
                Ok(Arc::new(transport))
            }
        }
    }

    #[must_use]
    pub const fn supervise_interval(&self) -> Duration {
        Duration::from_millis(self.device.supervise_interval_ms)
    }

    /// Watchdog settings, `None` when disabled.
    #[must_use]
    pub fn watchdog_settings(&self) -> Option<WatchdogSettings> {
        self.watchdog.enabled.then(|| WatchdogSettings {
            interval: Duration::from_millis(self.watchdog.interval_ms),
            retry_interval: Duration::from_millis(self.watchdog.retry_interval_ms),
            spend_signal: self.watchdog.spend_signal.clone(),
        })
    }

    #[must_use]
    pub fn reclaim_settings(&self) -> ReclaimSettings {
        ReclaimSettings {
            retries: self.reclaim.retries,
            graceful_timeout: Duration::from_millis(self.reclaim.graceful_timeout_ms),
            settle: Duration::from_millis(self.reclaim.settle_ms),
            ..ReclaimSettings::default()
        }
    }

    #[must_use]
    pub const fn initial_pool(&self) -> Money {
        Money::from_major(self.ledger.pool)
    }

    #[must_use]
    pub const fn initial_balance(&self) -> Money {
        Money::from_major(self.ledger.balance)
    }

    /// Token the device must present, or `None` to run unprovisioned.
    ///
    /// # Errors
    /// Returns error if an explicit token is too short.
    pub fn expected_token(&self) -> Result<Option<ExpectedToken>, ConfigError> {
        if let Some(token) = &self.auth.token {
            return ExpectedToken::new(token.clone())
                .map(Some)
                .map_err(|e| invalid("auth.token", e.to_string()));
        }
        match ExpectedToken::from_identifier_file(&self.auth.machine_id_path) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                tracing::warn!(
                    path = %self.auth.machine_id_path.display(),
                    error = %e,
                    "Cannot derive device token, running unprovisioned"
                );
                Ok(None)
            }
        }
    }
}

fn default_path() -> PathBuf {
    let system = PathBuf::from(SYSTEM_CONFIG);
    if system.exists() {
        return system;
    }
    dirs::config_dir().map_or(system, |dir| dir.join("kiosk").join("kiosk.toml"))
}
