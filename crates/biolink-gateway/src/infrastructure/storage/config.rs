//! TOML-based configuration for the gateway.
//!
//! # What is TOML? (for beginners)
//!
//! TOML (Tom's Obvious Minimal Language) is a configuration file format
//! designed to be easy to read and write.  A partial gateway config:
//!
//! ```toml
//! [server]
//! port = 8998
//!
//! [commands]
//! max_attempts = 5
//! missing_template_policy = "fetch_enroll_data"
//!
//! [rest_vendor]
//! utc_offset = "+05:30"
//!
//! [[devices]]
//! id = "HK-GATE-1"
//! vendor = "hikvision"
//! ip = "10.0.0.20"
//! username = "admin"
//! password = "secret"
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "...")]`, and every section is
//! `#[serde(default)]`, so any subset of the file is valid and a missing
//! file means "all defaults".

use std::path::{Path, PathBuf};

use biolink_core::{CommandPolicy, Device, Vendor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::hikvision::SyncOptions;
use crate::application::outbox::MissingTemplatePolicy;
use crate::application::zkteco::HandshakeOptions;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub checkin: CheckinConfig,
    /// Handshake option block for text-protocol terminals.
    #[serde(default)]
    pub text_vendor: HandshakeOptions,
    /// Attendance pull settings for REST-polled terminals.
    #[serde(default)]
    pub rest_vendor: SyncOptions,
    /// Devices registered at startup.  Push-protocol terminals also register
    /// themselves on first contact; REST-polled ones must be listed here.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceConfig>,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// IP address to bind to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Root of every durable file the gateway writes.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Command lifecycle limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandsConfig {
    /// Failed attempts after which a command is closed as failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Days a command may stay pending before it is force-closed.
    #[serde(default = "default_force_close_after_days")]
    pub force_close_after_days: i64,
    #[serde(default)]
    pub missing_template_policy: MissingTemplatePolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckinConfig {
    /// Keep punches from device users that are not linked to an employee.
    #[serde(default)]
    pub record_unknown_employee: bool,
}

/// One `[[devices]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub id: String,
    pub vendor: Vendor,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl DeviceConfig {
    /// Applies this entry over `existing`, keeping its sync bookkeeping.
    pub fn apply(&self, existing: Option<Device>) -> Device {
        let mut device = existing.unwrap_or_else(|| Device::new(self.id.clone(), self.vendor));
        device.vendor = self.vendor;
        device.disabled = self.disabled;
        device.ip = self.ip.clone();
        device.username = self.username.clone();
        device.password = self.password.clone();
        device
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8998
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./biolink-data")
}
fn default_max_attempts() -> u32 {
    3
}
fn default_force_close_after_days() -> i64 {
    3
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            force_close_after_days: default_force_close_after_days(),
            missing_template_policy: MissingTemplatePolicy::default(),
        }
    }
}

impl CommandsConfig {
    /// The lifecycle limits as the domain type.
    pub fn policy(&self) -> CommandPolicy {
        CommandPolicy {
            max_attempts: self.max_attempts.max(1),
            force_close_after: chrono::Duration::days(self.force_close_after_days.max(0)),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
