use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::DEFAULT_SERVICE_NAME;
use crate::pending::MAX_QUEUE;

pub const DEFAULT_BIND: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080);
pub const DEFAULT_LONG_POLL_SECS: u64 = 30;

/// Session server settings, loaded from TOML.
///
/// Every key is optional; missing keys take the built-in defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server listens on.
    pub bind: SocketAddr,
    /// Whether controllers are told to send debug log lines.
    pub debug_logging: bool,
    /// Updates buffered before `init` before the session is reset.
    pub max_queue: usize,
    /// Directory for the write-once cover archive. Disabled when unset.
    pub cover_dir: Option<PathBuf>,
    /// Advertise the server over mDNS.
    pub advertise: bool,
    /// mDNS instance name.
    pub service_name: String,
    /// How long `GET /cover` waits for a needed key.
    pub long_poll_secs: u64,
    /// Allowed CORS origins for browser displays. Empty disables CORS.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND,
            debug_logging: false,
            max_queue: MAX_QUEUE,
            cover_dir: None,
            advertise: true,
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
            long_poll_secs: DEFAULT_LONG_POLL_SECS,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate().map_err(|reason| ConfigError::Invalid(path.to_path_buf(), reason))?;
        Ok(Some(config))
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.long_poll_secs)
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_queue == 0 {
            return Err("max_queue must be at least 1".into());
        }
        if self.long_poll_secs == 0 {
            return Err("long_poll_secs must be at least 1".into());
        }
        if self.service_name.trim().is_empty() {
            return Err("service_name must not be empty".into());
        }
        Ok(())
    }
}

/// Default config file: `<config dir>/decksync/server.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("decksync")
        .join("server.toml")
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(PathBuf, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(path, reason) => {
                write!(f, "Invalid config {}: {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
