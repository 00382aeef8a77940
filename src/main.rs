// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Test-stand device-session server.
//!
//! Accepts TCP connections from test-stand devices, runs each one's
//! CONFIG/TIMESYNC handshake, and keeps a per-device session alive for
//! telemetry and commands while a background task beacons multicast
//! discovery packets.
//!
//! # Usage
//!
//! ```bash
//! # Start server on the default port (50000)
//! teststand-device-session
//!
//! # Custom port and config
//! teststand-device-session --port 50001 --config server.json
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod acceptor;
mod codec;
mod command;
mod config;
mod device;
mod discovery;
mod log;
mod registry;
mod server;
mod session;

pub use config::ServerConfig;
pub use server::TestStandServer;

/// Test-stand device-session server.
#[derive(Parser, Debug)]
#[command(name = "teststand-device-session")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "50000")]
    port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Resync TTL in seconds
    #[arg(long, default_value = "600")]
    resync_ttl: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // Load or create config
    let config = if let Some(config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        ServerConfig::from_file(&config_path)?
    } else {
        ServerConfig {
            bind_address: args.bind.parse()?,
            tcp_port: args.port,
            resync_ttl_secs: args.resync_ttl,
            ..Default::default()
        }
    };

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.tcp_port).parse()?;

    info!("+----------------------------------------------------+");
    info!(
        "|    Test-Stand Device-Session Server v{}           |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:      {:40} |", addr);
    info!(
        "|  Discovery: {:40} |",
        format!("{}:{}", config.discovery_group, config.discovery_port)
    );
    info!(
        "|  Resync:    {:40} |",
        format!("{}s", config.resync_ttl_secs)
    );
    info!("+----------------------------------------------------+");

    // Create and run server
    let server = TestStandServer::new(config).await?;

    // Handle shutdown signals
    let server_handle = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping server...");
        server_handle.shutdown().await;
    });

    // Run server
    server.run().await?;

    info!("Server stopped");
    Ok(())
}
