// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast discovery beacon.
//!
//! Periodically sends a header-only DISCOVERY packet to the well-known
//! multicast group. The emitter never binds to receive anything: there
//! is no unicast reply on this protocol, so the socket is send-only and
//! stateless beyond its TTL/loopback options.

use crate::codec::{encode, Packet};
use crate::config::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Run the discovery emitter until `shutdown` is notified.
pub async fn run(config: Arc<ServerConfig>, shutdown: Arc<Notify>) -> std::io::Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(false).ok();
    match config.discovery_group {
        std::net::IpAddr::V4(_) => {
            socket.set_multicast_loop_v4(true)?;
            socket.set_multicast_ttl_v4(config.discovery_ttl)?;
        }
        std::net::IpAddr::V6(_) => {
            socket.set_multicast_loop_v6(true)?;
        }
    }

    let target = SocketAddr::new(config.discovery_group, config.discovery_port);
    let mut interval = tokio::time::interval(config.discovery_interval());
    // first tick fires immediately; skip it so the server doesn't emit
    // before it's actually listening for TCP connections
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let packet = encode(&Packet::Discovery, 0, now_ms());
                if let Err(err) = socket.send_to(&packet, target).await {
                    crate::log::errlog(&format!("discovery send failed: {err}"));
                } else {
                    crate::log::debuglog("sent DISCOVERY beacon");
                }
            }
            _ = shutdown.notified() => {
                crate::log::debuglog("discovery emitter stopping");
                return Ok(());
            }
        }
    }
}

fn now_ms() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}
