//! Tunnel Configuration
//!
//! Deployment-level configuration: where the tor and relay binaries live,
//! which local ports the tunnel listens on, and where state and logs go.
//! User choices (transport, bridges, nodes) live in [`crate::settings`].

use crate::transport::TransportPorts;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fixed SOCKS listener port
pub const DEFAULT_SOCKS_PORT: u16 = 12345;

/// Fixed DNS listener port
pub const DEFAULT_DNS_PORT: u16 = 12346;

/// Tor process configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Path or name of the tor executable
    pub tor_binary: PathBuf,
    /// tor's DataDirectory; also holds the control-port and cookie files
    pub data_dir: PathBuf,
    /// tor log file, truncated on every launch
    pub log_file: Option<PathBuf>,
    /// SOCKS listener port
    pub socks_port: u16,
    /// DNS listener port
    pub dns_port: u16,
    /// How long to wait for tor to publish its control port (seconds)
    pub control_wait_secs: u64,
    /// Local ports of the pluggable-transport clients
    pub transport_ports: TransportPorts,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            tor_binary: PathBuf::from("tor"),
            data_dir: PathBuf::from("veil-data/tor"),
            log_file: None,
            socks_port: DEFAULT_SOCKS_PORT,
            dns_port: DEFAULT_DNS_PORT,
            control_wait_secs: 30,
            transport_ports: TransportPorts::default(),
        }
    }
}

impl TunnelConfig {
    /// File tor writes its control-port address to
    pub fn control_port_file(&self) -> PathBuf {
        self.data_dir.join("control-port")
    }

    /// Control-port authentication cookie
    pub fn cookie_file(&self) -> PathBuf {
        self.data_dir.join("control_auth_cookie")
    }

    pub fn control_wait(&self) -> Duration {
        Duration::from_secs(self.control_wait_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socks_port == 0 || self.dns_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.socks_port == self.dns_port {
            return Err(ConfigError::PortClash(self.socks_port));
        }
        if self.control_wait_secs == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.tor_binary.as_os_str().is_empty() {
            return Err(ConfigError::MissingBinary("tor"));
        }
        Ok(())
    }
}

/// Volunteer relay (snowflake proxy) configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Path or name of the proxy executable
    pub binary: PathBuf,
    /// Relay log file, truncated on every start
    pub log_file: Option<PathBuf>,
    /// Log text that marks a completed client session
    pub session_marker: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("snowflake-proxy"),
            log_file: None,
            session_marker: "connected to client".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.binary.as_os_str().is_empty() {
            return Err(ConfigError::MissingBinary("relay"));
        }
        Ok(())
    }
}

/// Complete configuration file
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VeilConfig {
    /// Where user settings are persisted
    pub settings_file: Option<PathBuf>,
    pub tunnel: TunnelConfig,
    pub relay: RelayConfig,
}

impl VeilConfig {
    /// Load from a TOML or JSON file, chosen by extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tunnel.validate()?;
        self.relay.validate()
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid listener port")]
    InvalidPort,

    #[error("SOCKS and DNS listeners both use port {0}")]
    PortClash(u16),

    #[error("Control-port wait must be at least one second")]
    InvalidTimeout,

    #[error("No {0} binary configured")]
    MissingBinary(&'static str),

    #[error("Failed to read config: {0}")]
    Io(String),

    #[error("Invalid config: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = TunnelConfig::default();

        assert_eq!(config.socks_port, DEFAULT_SOCKS_PORT);
        assert_eq!(config.dns_port, DEFAULT_DNS_PORT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_clash() {
        let config = TunnelConfig {
            dns_port: DEFAULT_SOCKS_PORT,
            ..TunnelConfig::default()
        };

        assert_eq!(config.validate(), Err(ConfigError::PortClash(DEFAULT_SOCKS_PORT)));
    }

    #[test]
    fn test_relay_binary_required() {
        let relay = RelayConfig {
            binary: PathBuf::new(),
            ..RelayConfig::default()
        };
        assert_eq!(relay.validate(), Err(ConfigError::MissingBinary("relay")));
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = VeilConfig::from_toml(
            r#"
            settings_file = "/var/lib/veil/settings.toml"

            [tunnel]
            tor_binary = "/usr/bin/tor"
            socks_port = 9150
            "#,
        )
        .unwrap();

        assert_eq!(config.tunnel.socks_port, 9150);
        assert_eq!(config.tunnel.dns_port, DEFAULT_DNS_PORT);
        assert_eq!(config.relay, RelayConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = VeilConfig::default();
        let parsed = VeilConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_paths() {
        let config = TunnelConfig::default();
        assert!(config.cookie_file().starts_with(&config.data_dir));
        assert!(config.control_port_file().ends_with("control-port"));
    }
}
