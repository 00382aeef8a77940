// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Top-level server: owns the device registry and runs the acceptor and
//! discovery-emitter tasks side by side until shutdown.

use crate::acceptor;
use crate::config::ServerConfig;
use crate::discovery;
use crate::registry::DeviceRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

/// Device-session server - accepts devices, runs their sessions, and
/// beacons a multicast discovery packet in the background.
#[derive(Clone)]
pub struct TestStandServer {
    config: Arc<ServerConfig>,
    registry: Arc<RwLock<DeviceRegistry>>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl TestStandServer {
    /// Create a new server. Validates `config` up front so a bad config
    /// never gets as far as binding a socket.
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(RwLock::new(DeviceRegistry::new())),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Run the server until `shutdown()` is called. Runs the TCP
    /// acceptor and the discovery emitter concurrently; either task
    /// exiting with an error stops the other via the shared shutdown
    /// signal.
    pub async fn run(&self) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let acceptor_result = {
            let config = self.config.clone();
            let registry = self.registry.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { acceptor::run(config, registry, shutdown).await })
        };

        let discovery_result = {
            let config = self.config.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { discovery::run(config, shutdown).await })
        };

        let (acceptor_outcome, discovery_outcome) =
            tokio::join!(acceptor_result, discovery_result);

        self.running.store(false, Ordering::SeqCst);

        acceptor_outcome
            .map_err(|e| ServerError::Protocol(e.to_string()))?
            .map_err(|e| ServerError::Protocol(e.to_string()))?;
        discovery_outcome
            .map_err(|e| ServerError::Io(e.to_string()))?
            .map_err(|e| ServerError::Io(e.to_string()))?;
        Ok(())
    }

    /// Signal both background tasks to stop.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub async fn device_count(&self) -> usize {
        self.registry.read().await.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Top-level server error types.
#[derive(Debug, Clone)]
pub enum ServerError {
    Config(String),
    Bind(String),
    AlreadyRunning,
    Io(String),
    Protocol(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(s) => write!(f, "configuration error: {}", s),
            Self::Bind(s) => write!(f, "bind error: {}", s),
            Self::AlreadyRunning => write!(f, "server is already running"),
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Protocol(s) => write!(f, "protocol error: {}", s),
        }
    }
}

impl std::error::Error for ServerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_rejects_invalid_config() {
        let config = ServerConfig {
            tcp_port: 0,
            ..Default::default()
        };
        assert!(TestStandServer::new(config).await.is_err());
    }

    #[tokio::test]
    async fn starts_with_zero_devices() {
        let config = ServerConfig::default();
        let server = TestStandServer::new(config).await.unwrap();
        assert_eq!(server.device_count().await, 0);
        assert!(!server.is_running());
    }
}
