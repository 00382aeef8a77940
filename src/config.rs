// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server configuration.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Device-session server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the TCP listener to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port to accept device connections on (default: 50000)
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Multicast group the discovery emitter sends to.
    #[serde(default = "default_discovery_group")]
    pub discovery_group: IpAddr,

    /// Multicast port the discovery emitter sends to.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// Multicast TTL used for discovery datagrams.
    #[serde(default = "default_discovery_ttl")]
    pub discovery_ttl: u32,

    /// Interval between discovery emissions, in seconds.
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,

    /// How long a device's config handshake may take before the acceptor
    /// gives up on it, in seconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Heartbeat period per device, in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// How long a TIMESYNC stays valid before a resync is due, in seconds.
    #[serde(default = "default_resync_ttl")]
    pub resync_ttl_secs: u64,

    /// Maximum accepted CONFIG payload size, in bytes.
    #[serde(default = "default_max_config_size")]
    pub max_config_size: usize,
}

fn default_bind_address() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}

fn default_tcp_port() -> u16 {
    50000
}

fn default_discovery_group() -> IpAddr {
    "239.255.255.250".parse().unwrap()
}

fn default_discovery_port() -> u16 {
    1900
}

fn default_discovery_ttl() -> u32 {
    2
}

fn default_discovery_interval() -> u64 {
    5
}

fn default_handshake_timeout() -> u64 {
    5
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_resync_ttl() -> u64 {
    600
}

fn default_max_config_size() -> usize {
    1024 * 1024 // 1 MB
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            tcp_port: default_tcp_port(),
            discovery_group: default_discovery_group(),
            discovery_port: default_discovery_port(),
            discovery_ttl: default_discovery_ttl(),
            discovery_interval_secs: default_discovery_interval(),
            handshake_timeout_secs: default_handshake_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            resync_ttl_secs: default_resync_ttl(),
            max_config_size: default_max_config_size(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn resync_ttl(&self) -> Duration {
        Duration::from_secs(self.resync_ttl_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp_port == 0 {
            return Err(ConfigError::InvalidValue("tcp_port cannot be 0".into()));
        }
        if self.discovery_port == 0 {
            return Err(ConfigError::InvalidValue(
                "discovery_port cannot be 0".into(),
            ));
        }
        if !self.discovery_group.is_multicast() {
            return Err(ConfigError::InvalidValue(
                "discovery_group must be a multicast address".into(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat_interval_secs cannot be 0".into(),
            ));
        }
        if self.resync_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "resync_ttl_secs cannot be 0".into(),
            ));
        }
        if self.max_config_size == 0 {
            return Err(ConfigError::InvalidValue(
                "max_config_size cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(s) => write!(f, "I/O error: {}", s),
            Self::ParseError(s) => write!(f, "Parse error: {}", s),
            Self::SerializeError(s) => write!(f, "Serialize error: {}", s),
            Self::InvalidValue(s) => write!(f, "Invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.tcp_port, 50000);
        assert_eq!(config.discovery_port, 1900);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = ServerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.tcp_port, parsed.tcp_port);
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        let config = ServerConfig::default();
        config.to_file(&path).unwrap();
        let loaded = ServerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.tcp_port, config.tcp_port);
    }

    #[test]
    fn test_validation_port_zero() {
        let config = ServerConfig {
            tcp_port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_non_multicast_group() {
        let config = ServerConfig {
            discovery_group: "10.0.0.1".parse().unwrap(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resync_ttl() {
        let config = ServerConfig {
            resync_ttl_secs: 600,
            ..Default::default()
        };
        assert_eq!(config.resync_ttl(), Duration::from_secs(600));
    }
}
