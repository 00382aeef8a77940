// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Binary TCP protocol v2 for test-stand device communication.
//!
//! All devices talk to the server using fixed-layout, big-endian
//! ("network byte order") packets. Every packet shares a 9-byte header:
//!
//! ```text
//!  0        1        2        3  4    5  6        7        8        9
//! +--------+--------+--------+--------+--------+--------+--------+--------+--------+
//! |version |  type  |  seq   |     length      |           timestamp              |
//! +--------+--------+--------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! `length` is the total packet length, header included, and is
//! authoritative for framing: a reader buffers until `length` bytes are
//! available before attempting to decode a payload. This module performs
//! no I/O of its own; framing (how many bytes to read off a socket) is
//! the caller's job, this module only turns bytes into [`Packet`]s and
//! back.
//!
//! Sequence numbers are not managed here. The session that owns a
//! connection holds its own `u8` counter; [`encode`] just writes
//! whatever value it's given.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

/// Size of the fixed header, in bytes.
pub const HEADER_SIZE: usize = 9;

/// The protocol version this crate speaks.
pub const PROTOCOL_VERSION: u8 = 2;

/// Errors produced while decoding a byte slice into a [`Packet`].
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CodecError {
    #[error("buffer too small to hold a header: got {0} bytes, need at least {HEADER_SIZE}")]
    ShortBuffer(usize),
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("unknown packet type 0x{0:02x}")]
    UnknownType(u8),
    #[error("malformed payload: {0}")]
    BadPayload(String),
    #[error("unknown unit code 0x{0:02x}")]
    UnknownUnit(u8),
    #[error("unknown device status code 0x{0:02x}")]
    UnknownStatus(u8),
    #[error("unknown error code 0x{0:02x}")]
    UnknownErrorCode(u8),
    #[error("unknown control state 0x{0:02x}")]
    UnknownControlState(u8),
}

/// Wire-level packet type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Estop = 0x00,
    Discovery = 0x01,
    TimeSync = 0x02,
    Control = 0x03,
    StatusRequest = 0x04,
    StreamStart = 0x05,
    StreamStop = 0x06,
    GetSingle = 0x07,
    Heartbeat = 0x08,
    // 0x09-0x0f are reserved/unused on the wire.
    Config = 0x10,
    Data = 0x11,
    Status = 0x12,
    Ack = 0x13,
    Nack = 0x14,
}

impl PacketType {
    fn from_u8(v: u8) -> Result<Self, CodecError> {
        use PacketType::*;
        Ok(match v {
            0x00 => Estop,
            0x01 => Discovery,
            0x02 => TimeSync,
            0x03 => Control,
            0x04 => StatusRequest,
            0x05 => StreamStart,
            0x06 => StreamStop,
            0x07 => GetSingle,
            0x08 => Heartbeat,
            0x10 => Config,
            0x11 => Data,
            0x12 => Status,
            0x13 => Ack,
            0x14 => Nack,
            other => return Err(CodecError::UnknownType(other)),
        })
    }
}

/// Engineering unit carried alongside a sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Unit {
    Volts = 0x00,
    Amps = 0x01,
    Celsius = 0x02,
    Fahrenheit = 0x03,
    Kelvin = 0x04,
    Psi = 0x05,
    Bar = 0x06,
    Pascal = 0x07,
    Gravity = 0x08,
    Kilograms = 0x09,
    Pounds = 0x0a,
    Newtons = 0x0b,
    Seconds = 0x0c,
    Milliseconds = 0x0d,
    Hertz = 0x0e,
    Ohms = 0x0f,
    Unitless = 0xff,
}

impl Unit {
    fn from_u8(v: u8) -> Result<Self, CodecError> {
        use Unit::*;
        Ok(match v {
            0x00 => Volts,
            0x01 => Amps,
            0x02 => Celsius,
            0x03 => Fahrenheit,
            0x04 => Kelvin,
            0x05 => Psi,
            0x06 => Bar,
            0x07 => Pascal,
            0x08 => Gravity,
            0x09 => Kilograms,
            0x0a => Pounds,
            0x0b => Newtons,
            0x0c => Seconds,
            0x0d => Milliseconds,
            0x0e => Hertz,
            0x0f => Ohms,
            0xff => Unitless,
            other => return Err(CodecError::UnknownUnit(other)),
        })
    }
}

/// Commanded or reported state of a control (typically a solenoid valve).
///
/// Open means the controlled gas path is allowed to flow; closed means it
/// isn't. This is the opposite sense of an electrical switch, which is
/// exactly why the wire never reuses a plain bool for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlState {
    Closed = 0x00,
    Open = 0x01,
    Err = 0xff,
}

impl ControlState {
    fn from_u8(v: u8) -> Result<Self, CodecError> {
        Ok(match v {
            0x00 => ControlState::Closed,
            0x01 => ControlState::Open,
            0xff => ControlState::Err,
            other => return Err(CodecError::UnknownControlState(other)),
        })
    }
}

/// Device-reported operating status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceStatus {
    Inactive = 0x00,
    Active = 0x01,
    Error = 0x02,
    Calibrating = 0x03,
}

impl DeviceStatus {
    fn from_u8(v: u8) -> Result<Self, CodecError> {
        Ok(match v {
            0x00 => DeviceStatus::Inactive,
            0x01 => DeviceStatus::Active,
            0x02 => DeviceStatus::Error,
            0x03 => DeviceStatus::Calibrating,
            other => return Err(CodecError::UnknownStatus(other)),
        })
    }
}

/// Error code carried by a NACK (or a non-`None` ACK, for partial failures).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0x00,
    UnknownType = 0x01,
    InvalidId = 0x02,
    HardwareFault = 0x03,
    Busy = 0x04,
    NotStreaming = 0x05,
    InvalidParam = 0x06,
}

impl ErrorCode {
    fn from_u8(v: u8) -> Result<Self, CodecError> {
        Ok(match v {
            0x00 => ErrorCode::None,
            0x01 => ErrorCode::UnknownType,
            0x02 => ErrorCode::InvalidId,
            0x03 => ErrorCode::HardwareFault,
            0x04 => ErrorCode::Busy,
            0x05 => ErrorCode::NotStreaming,
            0x06 => ErrorCode::InvalidParam,
            other => return Err(CodecError::UnknownErrorCode(other)),
        })
    }
}

/// One sensor reading inside a DATA packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub sensor_id: u8,
    pub unit: Unit,
    pub value: f32,
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub packet_type: u8,
    pub sequence: u8,
    pub length: u16,
    pub timestamp: u32,
}

impl PacketHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.push(self.packet_type);
        out.push(self.sequence);
        out.write_u16::<BigEndian>(self.length).unwrap();
        out.write_u32::<BigEndian>(self.timestamp).unwrap();
    }
}

/// Peek the header of a buffer without decoding the payload.
///
/// This is what lets framing code learn how many bytes to wait for
/// before handing a full packet to [`decode`].
pub fn peek_header(buf: &[u8]) -> Result<PacketHeader, CodecError> {
    if buf.len() < HEADER_SIZE {
        return Err(CodecError::ShortBuffer(buf.len()));
    }
    let mut cursor = Cursor::new(buf);
    let version = cursor.read_u8().unwrap();
    let packet_type = cursor.read_u8().unwrap();
    let sequence = cursor.read_u8().unwrap();
    let length = cursor.read_u16::<BigEndian>().unwrap();
    let timestamp = cursor.read_u32::<BigEndian>().unwrap();
    Ok(PacketHeader {
        version,
        packet_type,
        sequence,
        length,
        timestamp,
    })
}

/// A decoded application packet, tagged by its wire type.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Estop,
    Discovery,
    TimeSync,
    Control {
        control_id: u8,
        state: ControlState,
    },
    StatusRequest,
    StreamStart {
        frequency_hz: u16,
    },
    StreamStop,
    GetSingle,
    Heartbeat,
    Config {
        json: String,
    },
    Data {
        readings: Vec<Reading>,
    },
    Status {
        status: DeviceStatus,
    },
    Ack {
        acked_type: u8,
        acked_seq: u8,
        error_code: ErrorCode,
    },
    Nack {
        nacked_type: u8,
        nacked_seq: u8,
        error_code: ErrorCode,
    },
}

impl Packet {
    fn packet_type(&self) -> PacketType {
        match self {
            Packet::Estop => PacketType::Estop,
            Packet::Discovery => PacketType::Discovery,
            Packet::TimeSync => PacketType::TimeSync,
            Packet::Control { .. } => PacketType::Control,
            Packet::StatusRequest => PacketType::StatusRequest,
            Packet::StreamStart { .. } => PacketType::StreamStart,
            Packet::StreamStop => PacketType::StreamStop,
            Packet::GetSingle => PacketType::GetSingle,
            Packet::Heartbeat => PacketType::Heartbeat,
            Packet::Config { .. } => PacketType::Config,
            Packet::Data { .. } => PacketType::Data,
            Packet::Status { .. } => PacketType::Status,
            Packet::Ack { .. } => PacketType::Ack,
            Packet::Nack { .. } => PacketType::Nack,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Packet::Control { control_id, state } => {
                out.push(*control_id);
                out.push(*state as u8);
            }
            Packet::StreamStart { frequency_hz } => {
                out.write_u16::<BigEndian>(*frequency_hz).unwrap();
            }
            Packet::Config { json } => {
                let bytes = json.as_bytes();
                out.write_u32::<BigEndian>(bytes.len() as u32).unwrap();
                out.extend_from_slice(bytes);
            }
            Packet::Data { readings } => {
                out.push(readings.len() as u8);
                for r in readings {
                    out.push(r.sensor_id);
                    out.push(r.unit as u8);
                    out.write_f32::<BigEndian>(r.value).unwrap();
                }
            }
            Packet::Status { status } => {
                out.push(*status as u8);
            }
            Packet::Ack {
                acked_type,
                acked_seq,
                error_code,
            } => {
                out.push(*acked_type);
                out.push(*acked_seq);
                out.push(*error_code as u8);
            }
            Packet::Nack {
                nacked_type,
                nacked_seq,
                error_code,
            } => {
                out.push(*nacked_type);
                out.push(*nacked_seq);
                out.push(*error_code as u8);
            }
            Packet::Estop
            | Packet::Discovery
            | Packet::TimeSync
            | Packet::StatusRequest
            | Packet::StreamStop
            | Packet::GetSingle
            | Packet::Heartbeat => {}
        }
    }
}

/// Encode a packet with the given sequence number and timestamp (ms).
///
/// The session owns `sequence`; this function never mutates or inspects
/// any counter of its own.
pub fn encode(packet: &Packet, sequence: u8, timestamp_ms: u32) -> Vec<u8> {
    let mut body = Vec::new();
    packet.encode_payload(&mut body);

    let header = PacketHeader {
        version: PROTOCOL_VERSION,
        packet_type: packet.packet_type() as u8,
        sequence,
        length: (HEADER_SIZE + body.len()) as u16,
        timestamp: timestamp_ms,
    };

    let mut out = Vec::with_capacity(header.length as usize);
    header.encode(&mut out);
    out.extend_from_slice(&body);
    out
}

/// Decode a complete packet (header plus however many bytes `length`
/// declares) from `buf`. `buf` must be exactly one packet; callers using
/// length-authoritative framing slice the buffer to `header.length`
/// before calling this.
pub fn decode(buf: &[u8]) -> Result<Packet, CodecError> {
    let header = peek_header(buf)?;
    if header.version != PROTOCOL_VERSION {
        return Err(CodecError::BadVersion(header.version));
    }
    if (header.length as usize) < HEADER_SIZE {
        return Err(CodecError::BadPayload(format!(
            "length {} smaller than header size",
            header.length
        )));
    }
    if buf.len() < header.length as usize {
        return Err(CodecError::ShortBuffer(buf.len()));
    }

    let payload = &buf[HEADER_SIZE..header.length as usize];
    let packet_type = PacketType::from_u8(header.packet_type)?;

    let packet = match packet_type {
        PacketType::Estop => Packet::Estop,
        PacketType::Discovery => Packet::Discovery,
        PacketType::TimeSync => Packet::TimeSync,
        PacketType::Control => {
            if payload.len() != 2 {
                return Err(CodecError::BadPayload(
                    "CONTROL payload must be 2 bytes".into(),
                ));
            }
            Packet::Control {
                control_id: payload[0],
                state: ControlState::from_u8(payload[1])?,
            }
        }
        PacketType::StatusRequest => Packet::StatusRequest,
        PacketType::StreamStart => {
            if payload.len() != 2 {
                return Err(CodecError::BadPayload(
                    "STREAM_START payload must be 2 bytes".into(),
                ));
            }
            let mut cursor = Cursor::new(payload);
            Packet::StreamStart {
                frequency_hz: cursor.read_u16::<BigEndian>().unwrap(),
            }
        }
        PacketType::StreamStop => Packet::StreamStop,
        PacketType::GetSingle => Packet::GetSingle,
        PacketType::Heartbeat => Packet::Heartbeat,
        PacketType::Config => {
            if payload.len() < 4 {
                return Err(CodecError::BadPayload(
                    "CONFIG payload missing length prefix".into(),
                ));
            }
            let mut cursor = Cursor::new(&payload[..4]);
            let json_len = cursor.read_u32::<BigEndian>().unwrap() as usize;
            let rest = &payload[4..];
            if rest.len() != json_len {
                return Err(CodecError::BadPayload(format!(
                    "CONFIG declared {json_len} json bytes, got {}",
                    rest.len()
                )));
            }
            let json = std::str::from_utf8(rest)
                .map_err(|e| CodecError::BadPayload(format!("CONFIG json not utf-8: {e}")))?
                .to_string();
            Packet::Config { json }
        }
        PacketType::Data => {
            if payload.is_empty() {
                return Err(CodecError::BadPayload("DATA payload missing count".into()));
            }
            let count = payload[0] as usize;
            let rest = &payload[1..];
            if rest.len() != count * 6 {
                return Err(CodecError::BadPayload(format!(
                    "DATA declared {count} readings, got {} bytes",
                    rest.len()
                )));
            }
            let mut readings = Vec::with_capacity(count);
            for chunk in rest.chunks_exact(6) {
                let sensor_id = chunk[0];
                let unit = Unit::from_u8(chunk[1])?;
                let mut cursor = Cursor::new(&chunk[2..6]);
                let value = cursor.read_f32::<BigEndian>().unwrap();
                readings.push(Reading {
                    sensor_id,
                    unit,
                    value,
                });
            }
            Packet::Data { readings }
        }
        PacketType::Status => {
            if payload.len() != 1 {
                return Err(CodecError::BadPayload(
                    "STATUS payload must be 1 byte".into(),
                ));
            }
            Packet::Status {
                status: DeviceStatus::from_u8(payload[0])?,
            }
        }
        PacketType::Ack => {
            if payload.len() != 3 {
                return Err(CodecError::BadPayload("ACK payload must be 3 bytes".into()));
            }
            Packet::Ack {
                acked_type: payload[0],
                acked_seq: payload[1],
                error_code: ErrorCode::from_u8(payload[2])?,
            }
        }
        PacketType::Nack => {
            if payload.len() != 3 {
                return Err(CodecError::BadPayload(
                    "NACK payload must be 3 bytes".into(),
                ));
            }
            Packet::Nack {
                nacked_type: payload[0],
                nacked_seq: payload[1],
                error_code: ErrorCode::from_u8(payload[2])?,
            }
        }
    };

    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let bytes = encode(&packet, 7, 1234);
        let header = peek_header(&bytes).unwrap();
        assert_eq!(header.length as usize, bytes.len());
        assert_eq!(header.sequence, 7);
        assert_eq!(header.timestamp, 1234);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn roundtrips_header_only_packets() {
        roundtrip(Packet::Estop);
        roundtrip(Packet::Discovery);
        roundtrip(Packet::TimeSync);
        roundtrip(Packet::StatusRequest);
        roundtrip(Packet::StreamStop);
        roundtrip(Packet::GetSingle);
        roundtrip(Packet::Heartbeat);
    }

    #[test]
    fn roundtrips_control() {
        roundtrip(Packet::Control {
            control_id: 3,
            state: ControlState::Open,
        });
    }

    #[test]
    fn roundtrips_stream_start_at_max_frequency() {
        roundtrip(Packet::StreamStart {
            frequency_hz: 65535,
        });
    }

    #[test]
    fn roundtrips_config() {
        roundtrip(Packet::Config {
            json: r#"{"deviceName":"TestDevice"}"#.to_string(),
        });
    }

    #[test]
    fn roundtrips_data_with_multiple_readings() {
        roundtrip(Packet::Data {
            readings: vec![
                Reading {
                    sensor_id: 0,
                    unit: Unit::Celsius,
                    value: 21.5,
                },
                Reading {
                    sensor_id: 1,
                    unit: Unit::Psi,
                    value: 512.25,
                },
            ],
        });
    }

    #[test]
    fn roundtrips_data_with_zero_readings() {
        roundtrip(Packet::Data { readings: vec![] });
    }

    #[test]
    fn roundtrips_status() {
        roundtrip(Packet::Status {
            status: DeviceStatus::Calibrating,
        });
    }

    #[test]
    fn roundtrips_ack_and_nack() {
        roundtrip(Packet::Ack {
            acked_type: PacketType::Control as u8,
            acked_seq: 42,
            error_code: ErrorCode::None,
        });
        roundtrip(Packet::Nack {
            nacked_type: PacketType::Control as u8,
            nacked_seq: 42,
            error_code: ErrorCode::HardwareFault,
        });
    }

    #[test]
    fn rejects_buffer_shorter_than_header() {
        assert_eq!(decode(&[0u8; 8]), Err(CodecError::ShortBuffer(8)));
    }

    #[test]
    fn rejects_truncated_payload() {
        let bytes = encode(&Packet::Status {
            status: DeviceStatus::Active,
        }, 1, 0);
        let truncated = &bytes[..bytes.len() - 1];
        assert_eq!(
            decode(truncated),
            Err(CodecError::ShortBuffer(truncated.len()))
        );
    }

    #[test]
    fn rejects_unknown_packet_type() {
        let mut bytes = encode(&Packet::Heartbeat, 1, 0);
        bytes[1] = 0xfe;
        assert_eq!(decode(&bytes), Err(CodecError::UnknownType(0xfe)));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = encode(&Packet::Heartbeat, 1, 0);
        bytes[0] = 1;
        assert_eq!(decode(&bytes), Err(CodecError::BadVersion(1)));
    }

    #[test]
    fn length_framing_recovers_concatenated_packets() {
        let mut stream = Vec::new();
        stream.extend(encode(&Packet::Heartbeat, 0, 0));
        stream.extend(encode(
            &Packet::Control {
                control_id: 1,
                state: ControlState::Open,
            },
            1,
            10,
        ));
        stream.extend(encode(&Packet::GetSingle, 2, 20));

        let mut offset = 0;
        let mut packets = Vec::new();
        while offset < stream.len() {
            let header = peek_header(&stream[offset..]).unwrap();
            let end = offset + header.length as usize;
            packets.push(decode(&stream[offset..end]).unwrap());
            offset = end;
        }

        assert_eq!(
            packets,
            vec![
                Packet::Heartbeat,
                Packet::Control {
                    control_id: 1,
                    state: ControlState::Open,
                },
                Packet::GetSingle,
            ]
        );
    }
}
