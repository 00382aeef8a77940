// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory model of a connected device: its sensors, its controls, and
//! the bookkeeping a session needs to apply incoming DATA and correlate
//! outgoing CONTROL acks.

use crate::codec::{ControlState, Unit};
use std::collections::HashMap;
use std::time::Instant;

/// What kind of sensor a [`Sensor`] represents, matching the sub-objects
/// a CONFIG payload's `sensorInfo` may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Thermocouple,
    PressureTransducer,
    LoadCell,
    Current,
    Resistance,
}

/// A single named measurement channel and its append-only sample buffer.
#[derive(Debug, Clone)]
pub struct Sensor {
    pub name: String,
    pub kind: SensorKind,
    pub unit: Unit,
    pub data: Vec<f32>,
}

impl Sensor {
    pub fn new(name: impl Into<String>, kind: SensorKind, unit: Unit) -> Self {
        Self {
            name: name.into(),
            kind,
            unit,
            data: Vec::new(),
        }
    }
}

/// A single named actuator. Position in `Device::controls` is the wire
/// `control_id`.
#[derive(Debug, Clone)]
pub struct Control {
    pub name: String,
    pub kind: String,
    pub pin: u32,
    pub default_state: ControlState,
    pub last_known_state: ControlState,
}

/// Everything the server tracks about one connected device.
///
/// The socket itself is not stored here: it is owned exclusively by the
/// session task, which reaches `Device` state through the registry's
/// lock and reaches the socket through the outbound channel it holds
/// alongside the registry entry. This keeps the device model plain data,
/// safely readable by the command API without touching the connection.
pub struct Device {
    pub address: String,
    pub name: String,
    pub device_type: String,
    pub config: serde_json::Value,
    pub sensors: Vec<Sensor>,
    pub controls: Vec<Control>,
    pub times: Vec<f64>,
    pub start_time: Instant,
    pub last_sync_time: Option<Instant>,
    /// The device's own clock (packet header `timestamp`, ms) at the
    /// moment `last_sync_time` was recorded. Once set, later DATA
    /// packets' timestamps are read relative to this base instead of the
    /// server's local clock.
    pub sync_timestamp_ms: Option<u32>,
    pub resync_pending: bool,
    /// sequence number of an outstanding CONTROL -> (control name, requested state)
    pub pending_controls: HashMap<u8, (String, ControlState)>,
}

impl Device {
    pub fn new(
        address: String,
        name: String,
        device_type: String,
        config: serde_json::Value,
        sensors: Vec<Sensor>,
        controls: Vec<Control>,
    ) -> Self {
        Self {
            address,
            name,
            device_type,
            config,
            sensors,
            controls,
            times: Vec::new(),
            start_time: Instant::now(),
            last_sync_time: None,
            sync_timestamp_ms: None,
            resync_pending: true,
            pending_controls: HashMap::new(),
        }
    }

    /// Append one timestamped round of readings. `values[i]` lands in
    /// `sensors[i].data`; `times` grows by exactly one entry so every
    /// sensor's buffer and `times` stay the same length.
    pub fn append_reading(&mut self, t: f64, values: &[f32]) {
        debug_assert_eq!(values.len(), self.sensors.len());
        for (sensor, value) in self.sensors.iter_mut().zip(values) {
            sensor.data.push(*value);
        }
        self.times.push(t);
    }

    /// Record a successful TIMESYNC exchange: `now` is the server's local
    /// clock at the moment of the ack, `device_timestamp_ms` is the
    /// device's own clock reading carried in that ack's header. Clears
    /// the resync flag.
    pub fn record_sync(&mut self, now: Instant, device_timestamp_ms: u32) {
        self.last_sync_time = Some(now);
        self.sync_timestamp_ms = Some(device_timestamp_ms);
        self.resync_pending = false;
    }

    /// Mark a resync as due; the session loop will reinitiate TIMESYNC
    /// on its next pass through the dispatch loop.
    pub fn set_resync_pending(&mut self) {
        self.resync_pending = true;
    }

    /// Record that a CONTROL with the given sequence number is awaiting
    /// an ACK/NACK. Callers must do this before the corresponding socket
    /// write to close the race against a fast reply.
    pub fn set_pending_control(&mut self, seq: u8, control_name: String, state: ControlState) {
        self.pending_controls.insert(seq, (control_name, state));
    }

    /// Resolve a pending CONTROL by sequence number, updating
    /// `last_known_state` on success. Returns the control name if one was
    /// pending, or `None` if the sequence number wasn't outstanding
    /// (a late or duplicate ack).
    pub fn resolve_pending_control(&mut self, seq: u8, applied: bool) -> Option<String> {
        let (name, state) = self.pending_controls.remove(&seq)?;
        if applied {
            if let Some(control) = self.controls.iter_mut().find(|c| c.name == name) {
                control.last_known_state = state;
            }
        }
        Some(name)
    }

    /// Index of a named control, used to derive the wire `control_id`.
    pub fn control_id(&self, name: &str) -> Option<usize> {
        self.controls.iter().position(|c| c.name == name)
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    /// Whether the last successful sync is still within `ttl` of `now`.
    pub fn is_sync_fresh(&self, now: Instant, ttl: std::time::Duration) -> bool {
        match self.last_sync_time {
            Some(t) => now.duration_since(t) < ttl,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_device() -> Device {
        Device::new(
            "10.0.0.5:51000".to_string(),
            "TestDevice".to_string(),
            "Sensor Monitor".to_string(),
            serde_json::json!({}),
            vec![
                Sensor::new("TC1", SensorKind::Thermocouple, Unit::Celsius),
                Sensor::new("PT1", SensorKind::PressureTransducer, Unit::Psi),
            ],
            vec![Control {
                name: "VALVE1".to_string(),
                kind: "valve".to_string(),
                pin: 5,
                default_state: ControlState::Closed,
                last_known_state: ControlState::Closed,
            }],
        )
    }

    #[test]
    fn times_tracks_sensor_buffer_length() {
        let mut device = make_device();
        device.append_reading(0.0, &[21.0, 500.0]);
        device.append_reading(0.1, &[21.1, 501.0]);

        assert_eq!(device.times.len(), 2);
        for sensor in &device.sensors {
            assert_eq!(sensor.data.len(), device.times.len());
        }
    }

    #[test]
    fn pending_control_resolves_by_sequence() {
        let mut device = make_device();
        device.set_pending_control(9, "VALVE1".to_string(), ControlState::Open);
        assert_eq!(device.pending_controls.len(), 1);

        let name = device.resolve_pending_control(9, true).unwrap();
        assert_eq!(name, "VALVE1");
        assert!(device.pending_controls.is_empty());
        assert_eq!(device.controls[0].last_known_state, ControlState::Open);
    }

    #[test]
    fn resolving_unknown_sequence_is_a_noop() {
        let mut device = make_device();
        assert!(device.resolve_pending_control(99, true).is_none());
    }

    #[test]
    fn failed_control_does_not_update_last_known_state() {
        let mut device = make_device();
        device.set_pending_control(1, "VALVE1".to_string(), ControlState::Open);
        device.resolve_pending_control(1, false);
        assert_eq!(device.controls[0].last_known_state, ControlState::Closed);
    }

    #[test]
    fn control_id_is_its_declaration_position() {
        let device = make_device();
        assert_eq!(device.control_id("VALVE1"), Some(0));
        assert_eq!(device.control_id("NOPE"), None);
    }
}
