//! TOML-based configuration for the gateway.
//!
//! Reads `GatewayConfig` from an explicit path, or from the platform config
//! file:
//! - Windows:  `%APPDATA%\Devgate\config.toml`
//! - Linux:    `$XDG_CONFIG_HOME/devgate/config.toml` or `~/.config/devgate/config.toml`
//! - macOS:    `~/Library/Application Support/Devgate/config.toml`
//!
//! # Example file
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0"
//! port = 8000
//!
//! [access]
//! secret = "change-me"
//! allow_remote_access = false
//! allowed_ranges = ["127.0.0.0/8", "192.168.0.0/16"]
//!
//! [controller]
//! baud_rate = 250000
//!
//! [[ports]]
//! path = "sim://printer"
//! manufacturer = "Simulator"
//!
//! [[devices]]
//! name = "Workshop laser"
//! address = "192.168.1.50:80"
//!
//! [jobs]
//! program = "/usr/local/bin/slice-job"
//! args = ["--quiet"]
//! ```
//!
//! Every section and every field is optional.  Fields annotated with
//! `#[serde(default = "some_fn")]` take the return value of `some_fn()` when
//! absent, so an empty file is a valid configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use devgate_core::DeviceInfo;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::access_gate::{InvalidRange, OriginPolicy, DEFAULT_ALLOWED_RANGES};
use crate::application::controller::ControllerSettings;
use crate::application::discovery_relay::KnownPort;

/// Error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

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

    /// An entry of `access.allowed_ranges` is not a CIDR range or address.
    #[error(transparent)]
    InvalidRange(#[from] InvalidRange),

    /// `server.bind_address` is not an IP address.
    #[error("invalid bind address {0:?}")]
    InvalidBindAddress(String),

    /// No JWT secret is configured.
    #[error("access.secret is empty; set it in the config file or via DEVGATE_SECRET")]
    MissingSecret,
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub controller: ControllerDefaults,
    /// Virtual ports listed alongside the physical ones.
    #[serde(default)]
    pub ports: Vec<KnownPort>,
    /// Network devices reported by discovery.
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
    #[serde(default)]
    pub jobs: JobsConfig,
}

/// Listener and session-transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// IP address to bind to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port for WebSocket connections.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds between server pings.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Seconds of silence after which a session is dropped.
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    /// Per-session outbound queue capacity, in events.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Access-gate settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessConfig {
    /// HMAC secret used to verify access tokens.
    #[serde(default)]
    pub secret: String,
    /// Admits sessions from any address when `true`.
    #[serde(default)]
    pub allow_remote_access: bool,
    /// CIDR ranges sessions may connect from.
    #[serde(default = "default_allowed_ranges")]
    pub allowed_ranges: Vec<String>,
}

/// Defaults applied to controller settings a client leaves out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerDefaults {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// External job program.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobsConfig {
    /// Executable run for each job.  Jobs fail when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,
    /// Arguments passed before the job id and parameters.
    #[serde(default)]
    pub args: Vec<String>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_ping_interval_secs() -> u64 {
    25
}
fn default_pong_timeout_secs() -> u64 {
    60
}
fn default_outbound_queue() -> usize {
    256
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_allowed_ranges() -> Vec<String> {
    DEFAULT_ALLOWED_RANGES.iter().map(|r| r.to_string()).collect()
}
fn default_baud_rate() -> u32 {
    115_200
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            outbound_queue: default_outbound_queue(),
            log_level: default_log_level(),
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            allow_remote_access: false,
            allowed_ranges: default_allowed_ranges(),
        }
    }
}

impl Default for ControllerDefaults {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
        }
    }
}

// ── Derived settings ──────────────────────────────────────────────────────────

impl GatewayConfig {
    /// Socket address the server listens on.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .server
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.server.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    pub fn origin_policy(&self) -> Result<OriginPolicy, ConfigError> {
        Ok(OriginPolicy::from_ranges(
            &self.access.allowed_ranges,
            self.access.allow_remote_access,
        )?)
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            baud_rate: self.controller.baud_rate,
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.server.ping_interval_secs.max(1))
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.server.pong_timeout_secs.max(1))
    }

    /// Checks everything that cannot be expressed in the schema.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: an empty secret, a bad bind address,
    /// or a bad allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access.secret.trim().is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        self.listen_addr()?;
        self.origin_policy()?;
        Ok(())
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the platform config file path.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the configuration.
///
/// With `Some(path)` the file must exist.  With `None` the platform file is
/// used, and a missing platform file yields [`GatewayConfig::default()`].
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors and
/// [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    match path {
        Some(path) => load_from(path),
        None => {
            let path = config_file_path()?;
            match load_from(&path) {
                Err(ConfigError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    Ok(GatewayConfig::default())
                }
                other => other,
            }
        }
    }
}

/// Reads and parses one config file.
pub fn load_from(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&content)?)
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &GatewayConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
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

/// Resolves the platform config base directory including the `Devgate`
/// subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Devgate"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("devgate"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("Devgate")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
