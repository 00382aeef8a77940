// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Command API: the handful of operations a caller can issue against a
//! connected device, each resolved through the registry first and then
//! pushed onto that device's outbound channel rather than touching its
//! socket directly.
//!
//! Every function re-resolves the device by address on each call rather
//! than borrowing a `RegisteredDevice` directly, so a device that drops
//! mid-command is simply not found on the next call instead of leaving a
//! stale handle to a torn-down session. A write failure is treated as
//! proof the connection is already gone: the device is removed from the
//! registry (which aborts its session task) rather than left registered
//! and unreachable.

use crate::codec::{ControlState, Packet};
use crate::registry::DeviceRegistry;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown control {0:?}")]
    UnknownControl(String),
    #[error("stream frequency must be between 1 and 65535 Hz, got {0}")]
    InvalidFrequency(u32),
    #[error("no device registered at this address")]
    UnknownDevice,
    #[error("device disconnected while the command was being sent")]
    Disconnected,
}

/// Request a single immediate reading from the device.
pub async fn get_single(
    registry: &Arc<RwLock<DeviceRegistry>>,
    address: &str,
) -> Result<(), CommandError> {
    send(registry, address, Packet::GetSingle).await
}

/// Start continuous streaming at `frequency_hz` (1..=65535).
pub async fn start_stream(
    registry: &Arc<RwLock<DeviceRegistry>>,
    address: &str,
    frequency_hz: u32,
) -> Result<(), CommandError> {
    if frequency_hz == 0 || frequency_hz > u16::MAX as u32 {
        return Err(CommandError::InvalidFrequency(frequency_hz));
    }
    send(
        registry,
        address,
        Packet::StreamStart {
            frequency_hz: frequency_hz as u16,
        },
    )
    .await
}

pub async fn stop_stream(
    registry: &Arc<RwLock<DeviceRegistry>>,
    address: &str,
) -> Result<(), CommandError> {
    send(registry, address, Packet::StreamStop).await
}

/// Command a named control to `state`. The wire sequence number for this
/// CONTROL is assigned by the session task when it actually writes the
/// packet, not here, so the pending-control bookkeeping that correlates
/// an ack lives in the session's outbound-send path rather than in this
/// function: nothing in the command API can know the sequence number in
/// advance.
pub async fn set_control(
    registry: &Arc<RwLock<DeviceRegistry>>,
    address: &str,
    name: &str,
    state: ControlState,
) -> Result<(), CommandError> {
    let control_id = {
        let reg = registry.read().await;
        let entry = reg.lookup(address).ok_or(CommandError::UnknownDevice)?;
        let device = entry.device.read().await;
        device
            .control_id(name)
            .ok_or_else(|| CommandError::UnknownControl(name.to_string()))?
    };

    send(
        registry,
        address,
        Packet::Control {
            control_id: control_id as u8,
            state,
        },
    )
    .await
}

pub async fn get_status(
    registry: &Arc<RwLock<DeviceRegistry>>,
    address: &str,
) -> Result<(), CommandError> {
    send(registry, address, Packet::StatusRequest).await
}

/// Emergency stop. Bypasses no queuing beyond the outbound channel
/// itself; it carries no payload so there is nothing to validate.
pub async fn estop(
    registry: &Arc<RwLock<DeviceRegistry>>,
    address: &str,
) -> Result<(), CommandError> {
    send(registry, address, Packet::Estop).await
}

/// Look up `address`, clone out its outbound sender under a short read
/// lock, and push `packet`. A send failure means the session already
/// tore down behind the registry's back; the registry entry is removed
/// (aborting the session task) rather than left pointing at a dead
/// connection.
async fn send(
    registry: &Arc<RwLock<DeviceRegistry>>,
    address: &str,
    packet: Packet,
) -> Result<(), CommandError> {
    let outbound = {
        let reg = registry.read().await;
        let entry = reg.lookup(address).ok_or(CommandError::UnknownDevice)?;
        entry.outbound.clone()
    };

    if outbound.send(packet).await.is_err() {
        registry.write().await.remove(address);
        return Err(CommandError::Disconnected);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Control, Device};
    use crate::registry::RegisteredDevice;
    use tokio::sync::mpsc;

    const ADDR: &str = "addr";

    fn registry_with_device() -> (Arc<RwLock<DeviceRegistry>>, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(8);
        let device = Device::new(
            ADDR.to_string(),
            "name".to_string(),
            "Sensor Monitor".to_string(),
            serde_json::json!({}),
            vec![],
            vec![Control {
                name: "VALVE1".to_string(),
                kind: "valve".to_string(),
                pin: 5,
                default_state: ControlState::Closed,
                last_known_state: ControlState::Closed,
            }],
        );
        let entry = RegisteredDevice {
            device: Arc::new(RwLock::new(device)),
            outbound: tx,
            session_task: tokio::spawn(async {}),
        };
        let mut registry = DeviceRegistry::new();
        registry.insert(ADDR.to_string(), entry).unwrap();
        (Arc::new(RwLock::new(registry)), rx)
    }

    #[tokio::test]
    async fn set_control_sends_resolved_control_id() {
        let (registry, mut rx) = registry_with_device();
        set_control(&registry, ADDR, "VALVE1", ControlState::Open)
            .await
            .unwrap();

        let packet = rx.recv().await.unwrap();
        assert_eq!(
            packet,
            Packet::Control {
                control_id: 0,
                state: ControlState::Open
            }
        );
    }

    #[tokio::test]
    async fn set_control_rejects_unknown_name() {
        let (registry, _rx) = registry_with_device();
        let err = set_control(&registry, ADDR, "NOPE", ControlState::Open).await;
        assert_eq!(err, Err(CommandError::UnknownControl("NOPE".to_string())));
    }

    #[tokio::test]
    async fn commands_reject_unknown_device() {
        let (registry, _rx) = registry_with_device();
        let err = get_status(&registry, "nowhere").await;
        assert_eq!(err, Err(CommandError::UnknownDevice));
    }

    #[tokio::test]
    async fn start_stream_rejects_zero_frequency() {
        let (registry, _rx) = registry_with_device();
        let err = start_stream(&registry, ADDR, 0).await;
        assert_eq!(err, Err(CommandError::InvalidFrequency(0)));
    }

    #[tokio::test]
    async fn start_stream_rejects_frequency_above_u16_max() {
        let (registry, _rx) = registry_with_device();
        let err = start_stream(&registry, ADDR, 70_000).await;
        assert_eq!(err, Err(CommandError::InvalidFrequency(70_000)));
    }

    #[tokio::test]
    async fn send_failure_removes_device_from_registry() {
        let (registry, rx) = registry_with_device();
        drop(rx); // close the channel so the send fails

        let err = estop(&registry, ADDR).await;
        assert_eq!(err, Err(CommandError::Disconnected));
        assert!(!registry.read().await.contains(ADDR));
    }
}
