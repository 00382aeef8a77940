// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP accept loop: reads a device's CONFIG handshake, builds its
//! [`Device`] model, and hands the connection off to a session task.

use crate::codec::{
    decode, encode, peek_header, CodecError, ErrorCode, Packet, PacketHeader, PacketType,
    HEADER_SIZE,
};
use crate::config::ServerConfig;
use crate::device::{Control, Device, Sensor, SensorKind};
use crate::registry::{DeviceRegistry, RegisteredDevice};
use crate::session;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify, RwLock};

#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("codec error during handshake: {0}")]
    Codec(#[from] CodecError),
    #[error("malformed config: {0}")]
    BadConfig(String),
    #[error("device already registered")]
    DuplicateDevice,
}

/// Run the accept loop until `shutdown` is notified.
pub async fn run(
    config: Arc<ServerConfig>,
    registry: Arc<RwLock<DeviceRegistry>>,
    shutdown: Arc<Notify>,
) -> Result<(), AcceptorError> {
    let bind_addr = format!("{}:{}", config.bind_address, config.tcp_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(AcceptorError::Bind)?;
    crate::log::syslog(&format!("listening for devices on {bind_addr}"));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let config = config.clone();
                let registry = registry.clone();
                tokio::spawn(async move {
                    let address = peer.to_string();
                    match handshake(stream, &config, &address, &registry).await {
                        Ok((device, stream)) => {
                            crate::log::syslog(&format!("{} connected from {address}", device.name));
                            spawn_session(device, stream, address, config, registry).await;
                        }
                        Err(err) => {
                            crate::log::errlog(&format!("handshake with {address} failed: {err}"));
                        }
                    }
                });
            }
            _ = shutdown.notified() => {
                crate::log::syslog("acceptor stopping");
                return Ok(());
            }
        }
    }
}

/// Read the CONFIG handshake, ack it, run TIMESYNC, and return the
/// constructed device plus the still-open stream.
///
/// The registry is consulted for a duplicate address before any ack is
/// written: a device already registered gets `NACK(busy)` and the
/// connection is dropped instead of a second session ever being spawned.
async fn handshake(
    mut stream: TcpStream,
    config: &ServerConfig,
    address: &str,
    registry: &Arc<RwLock<DeviceRegistry>>,
) -> Result<(Device, TcpStream), AcceptorError> {
    let timeout = config.handshake_timeout();
    tokio::time::timeout(timeout, async {
        let (packet, header) = read_one_packet(&mut stream, config.max_config_size).await?;
        let json = match packet {
            Packet::Config { json } => json,
            other => {
                let nack = encode(
                    &Packet::Nack {
                        nacked_type: header.packet_type,
                        nacked_seq: header.sequence,
                        error_code: ErrorCode::UnknownType,
                    },
                    0,
                    0,
                );
                stream.write_all(&nack).await?;
                return Err(AcceptorError::BadConfig(format!(
                    "expected CONFIG as first packet, got {other:?}"
                )));
            }
        };

        let value: Value = serde_json::from_str(&json)
            .map_err(|e| AcceptorError::BadConfig(format!("invalid json: {e}")))?;
        let device = build_device(address.to_string(), &value)?;

        if registry.read().await.contains(address) {
            let nack = encode(
                &Packet::Nack {
                    nacked_type: PacketType::Config as u8,
                    nacked_seq: header.sequence,
                    error_code: ErrorCode::Busy,
                },
                0,
                0,
            );
            stream.write_all(&nack).await?;
            return Err(AcceptorError::DuplicateDevice);
        }

        let ack = encode(
            &Packet::Ack {
                acked_type: PacketType::Config as u8,
                acked_seq: header.sequence,
                error_code: ErrorCode::None,
            },
            0,
            0,
        );
        stream.write_all(&ack).await?;

        let timesync = encode(&Packet::TimeSync, 1, 0);
        stream.write_all(&timesync).await?;

        Ok((device, stream))
    })
    .await
    .map_err(|_| AcceptorError::HandshakeTimeout)?
}

/// Read exactly one length-framed packet off `stream`, returning it
/// alongside its header (the caller needs the device's sequence number,
/// which `decode` alone discards).
async fn read_one_packet(
    stream: &mut TcpStream,
    max_size: usize,
) -> Result<(Packet, PacketHeader), AcceptorError> {
    let mut buf = vec![0u8; HEADER_SIZE];
    stream.read_exact(&mut buf).await?;
    let header = peek_header(&buf)?;
    if header.length as usize > max_size {
        return Err(AcceptorError::BadConfig(format!(
            "declared length {} exceeds max {max_size}",
            header.length
        )));
    }
    let remaining = header.length as usize - HEADER_SIZE;
    buf.resize(header.length as usize, 0);
    stream.read_exact(&mut buf[HEADER_SIZE..HEADER_SIZE + remaining]).await?;
    let packet = decode(&buf)?;
    Ok((packet, header))
}

/// Build a [`Device`] from a parsed CONFIG payload. Unrecognized device
/// types become a generic device with no sensors rather than a hard
/// failure, so a server can still track and command it.
fn build_device(address: String, value: &Value) -> Result<Device, AcceptorError> {
    let name = value
        .get("deviceName")
        .and_then(Value::as_str)
        .ok_or_else(|| AcceptorError::BadConfig("missing deviceName".into()))?
        .to_string();
    let device_type = value
        .get("deviceType")
        .and_then(Value::as_str)
        .ok_or_else(|| AcceptorError::BadConfig("missing deviceType".into()))?
        .to_string();

    let (sensors, controls) = match device_type.as_str() {
        "Sensor Monitor" | "Simulated Sensor Monitor" => (
            parse_sensors(value.get("sensorInfo")),
            parse_controls(value.get("controls")),
        ),
        _ => (Vec::new(), Vec::new()),
    };

    Ok(Device::new(
        address,
        name,
        device_type,
        value.clone(),
        sensors,
        controls,
    ))
}

fn parse_sensors(sensor_info: Option<&Value>) -> Vec<Sensor> {
    let mut sensors = Vec::new();
    let Some(sensor_info) = sensor_info.and_then(Value::as_object) else {
        return sensors;
    };

    let groups: &[(&str, SensorKind, crate::codec::Unit)] = &[
        (
            "thermocouples",
            SensorKind::Thermocouple,
            crate::codec::Unit::Celsius,
        ),
        (
            "pressureTransducers",
            SensorKind::PressureTransducer,
            crate::codec::Unit::Psi,
        ),
        (
            "loadCells",
            SensorKind::LoadCell,
            crate::codec::Unit::Newtons,
        ),
        ("current", SensorKind::Current, crate::codec::Unit::Amps),
        (
            "resistance",
            SensorKind::Resistance,
            crate::codec::Unit::Ohms,
        ),
    ];

    for (key, kind, default_unit) in groups {
        let Some(group) = sensor_info.get(*key).and_then(Value::as_object) else {
            continue;
        };
        for (sensor_name, spec) in group {
            let unit = spec
                .get("units")
                .and_then(Value::as_str)
                .and_then(parse_unit)
                .unwrap_or(*default_unit);
            sensors.push(Sensor::new(sensor_name.clone(), *kind, unit));
        }
    }
    sensors
}

fn parse_unit(s: &str) -> Option<crate::codec::Unit> {
    use crate::codec::Unit::*;
    Some(match s {
        "V" => Volts,
        "A" => Amps,
        "C" => Celsius,
        "F" => Fahrenheit,
        "K" => Kelvin,
        "PSI" => Psi,
        "Bar" => Bar,
        "Pa" => Pascal,
        "g" => Gravity,
        "kg" => Kilograms,
        "lb" => Pounds,
        "N" => Newtons,
        "s" => Seconds,
        "ms" => Milliseconds,
        "Hz" => Hertz,
        "Ohms" => Ohms,
        _ => return None,
    })
}

fn parse_controls(controls: Option<&Value>) -> Vec<Control> {
    let mut out = Vec::new();
    let Some(controls) = controls.and_then(Value::as_object) else {
        return out;
    };
    for (name, spec) in controls {
        let pin = spec.get("pin").and_then(Value::as_u64).unwrap_or(0) as u32;
        let kind = spec
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("valve")
            .to_string();
        let default_state = match spec.get("defaultState").and_then(Value::as_str) {
            Some("OPEN") => crate::codec::ControlState::Open,
            _ => crate::codec::ControlState::Closed,
        };
        out.push(Control {
            name: name.clone(),
            kind,
            pin,
            default_state,
            last_known_state: default_state,
        });
    }
    out
}

async fn spawn_session(
    device: Device,
    stream: TcpStream,
    address: String,
    config: Arc<ServerConfig>,
    registry: Arc<RwLock<DeviceRegistry>>,
) {
    let (outbound_tx, outbound_rx) = mpsc::channel(32);
    let device = Arc::new(RwLock::new(device));

    let session_device = device.clone();
    let session_registry = registry.clone();
    let session_address = address.clone();
    let session_config = config.clone();
    let session_outbound_tx = outbound_tx.clone();

    let session_task = tokio::spawn(async move {
        session::run(
            session_device,
            stream,
            session_address.clone(),
            session_config,
            outbound_rx,
            session_outbound_tx,
        )
        .await;
        session_registry.write().await.remove_without_abort(&session_address);
    });

    let entry = RegisteredDevice {
        device,
        outbound: outbound_tx,
        session_task,
    };

    if let Err(leaked) = registry.write().await.insert(address.clone(), entry) {
        leaked.session_task.abort();
        crate::log::errlog(&format!(
            "duplicate device registration for {address}; aborted leaked session"
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ControlState, Unit};

    fn sample_config() -> Value {
        serde_json::json!({
            "deviceName": "TestDevice",
            "deviceType": "Sensor Monitor",
            "sensorInfo": {
                "thermocouples": {
                    "TC1": {"ADCIndex": 0, "highPin": 1, "lowPin": 2, "type": "K", "units": "C"}
                },
                "pressureTransducers": {
                    "PT1": {"ADCIndex": 1, "pin": 3, "maxPressure_PSI": 500, "units": "PSI"}
                }
            },
            "controls": {
                "VALVE1": {"pin": 5, "type": "valve", "defaultState": "CLOSED"}
            }
        })
    }

    #[test]
    fn build_device_parses_sensors_and_controls() {
        let device = build_device("1.2.3.4:9".to_string(), &sample_config()).unwrap();
        assert_eq!(device.name, "TestDevice");
        assert_eq!(device.sensors.len(), 2);
        assert_eq!(device.controls.len(), 1);
        assert_eq!(device.controls[0].name, "VALVE1");
        assert_eq!(device.controls[0].default_state, ControlState::Closed);

        let tc1 = device.sensors.iter().find(|s| s.name == "TC1").unwrap();
        assert_eq!(tc1.kind, SensorKind::Thermocouple);
        assert_eq!(tc1.unit, Unit::Celsius);
    }

    #[test]
    fn build_device_tolerates_unrecognized_type() {
        let config = serde_json::json!({
            "deviceName": "Mystery",
            "deviceType": "Mystery Box",
        });
        let device = build_device("1.2.3.4:9".to_string(), &config).unwrap();
        assert_eq!(device.name, "Mystery");
        assert!(device.sensors.is_empty());
        assert!(device.controls.is_empty());
    }

    #[test]
    fn build_device_requires_device_name() {
        let config = serde_json::json!({"deviceType": "Sensor Monitor"});
        assert!(build_device("addr".to_string(), &config).is_err());
    }

    #[test]
    fn parse_controls_defaults_to_closed_when_unspecified() {
        let controls = parse_controls(Some(&serde_json::json!({
            "VALVE2": {"pin": 7}
        })));
        assert_eq!(controls[0].default_state, ControlState::Closed);
        assert_eq!(controls[0].kind, "valve");
    }
}
