// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-device session loop.
//!
//! One task owns a device's socket end to end: it multiplexes incoming
//! bytes, outbound packets queued by the command API, and its own
//! heartbeat cadence, and it is the only place that ever writes to the
//! socket. A write failure anywhere tears the session down; there is no
//! retry path, matching the aggressive write-failure policy the command
//! API also follows.

use crate::codec::{decode, peek_header, encode, CodecError, ErrorCode, Packet, PacketType, HEADER_SIZE};
use crate::config::ServerConfig;
use crate::device::Device;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};

/// Clock-sync phase of a session. The handshake already sends the first
/// TIMESYNC before this loop starts, so a session is always born
/// SYNC_PENDING; from there it advances to STEADY on ack and back to
/// SYNC_PENDING once the sync goes stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    SyncPending,
    Steady,
}

/// Drive one device's session until the connection closes, a write
/// fails, or the process is shutting down. Registry cleanup is the
/// caller's responsibility; this function only owns the socket and the
/// device's live state.
pub async fn run(
    device: Arc<RwLock<Device>>,
    stream: TcpStream,
    address: String,
    config: Arc<ServerConfig>,
    mut outbound_rx: mpsc::Receiver<Packet>,
    outbound_tx: mpsc::Sender<Packet>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let sequence = Arc::new(AtomicU8::new(2)); // 0/1 used by the handshake CONFIG ack/TIMESYNC

    let heartbeat_tx = outbound_tx.clone();
    let heartbeat_interval = config.heartbeat_interval();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            if heartbeat_tx.send(Packet::Heartbeat).await.is_err() {
                return;
            }
        }
    });

    let mut sync_state = SyncState::SyncPending;
    let resync_ttl = config.resync_ttl();
    let mut read_buf: Vec<u8> = Vec::with_capacity(256);
    let mut read_chunk = [0u8; 4096];

    'session: loop {
        // a STEADY session whose sync has aged past the TTL must resync
        if sync_state == SyncState::Steady {
            let stale = {
                let d = device.read().await;
                !d.is_sync_fresh(Instant::now(), resync_ttl)
            };
            if stale {
                device.write().await.set_resync_pending();
                sync_state = SyncState::SyncPending;
                let seq = next_seq(&sequence);
                if send(&mut write_half, &Packet::TimeSync, seq).await.is_err() {
                    break 'session;
                }
                crate::log::debuglog(&format!("{address} resync TIMESYNC sent"));
            }
        }

        tokio::select! {
            read_result = read_half.read(&mut read_chunk) => {
                let n = match read_result {
                    Ok(0) => {
                        crate::log::syslog(&format!("{address} closed the connection"));
                        break 'session;
                    }
                    Ok(n) => n,
                    Err(err) => {
                        crate::log::errlog(&format!("{address} read error: {err}"));
                        break 'session;
                    }
                };
                read_buf.extend_from_slice(&read_chunk[..n]);

                while let Some(packet_len) = complete_frame_len(&read_buf) {
                    let frame: Vec<u8> = read_buf.drain(..packet_len).collect();
                    let header = match peek_header(&frame) {
                        Ok(h) => h,
                        Err(_) => continue,
                    };
                    match decode(&frame) {
                        Ok(packet) => {
                            if !dispatch(
                                &device,
                                &address,
                                &config,
                                &mut write_half,
                                &sequence,
                                &mut sync_state,
                                header.packet_type,
                                header.sequence,
                                header.timestamp,
                                packet,
                            ).await {
                                break 'session;
                            }
                        }
                        Err(err) => {
                            crate::log::errlog(&format!("{address} decode failure: {err}"));
                            let seq = next_seq(&sequence);
                            let nack = Packet::Nack {
                                nacked_type: header.packet_type,
                                nacked_seq: header.sequence,
                                error_code: classify(&err),
                            };
                            if send(&mut write_half, &nack, seq).await.is_err() {
                                break 'session;
                            }
                        }
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(packet) => {
                        let seq = next_seq(&sequence);
                        // The wire sequence number only exists from this
                        // point on, so a CONTROL's pending-ack bookkeeping
                        // is recorded here, immediately before the write
                        // that makes it real, rather than by the command
                        // API that queued the packet.
                        if let Packet::Control { control_id, state } = &packet {
                            let name = device
                                .read()
                                .await
                                .controls
                                .get(*control_id as usize)
                                .map(|c| c.name.clone());
                            if let Some(name) = name {
                                device.write().await.set_pending_control(seq, name, *state);
                            }
                        }
                        if send(&mut write_half, &packet, seq).await.is_err() {
                            crate::log::errlog(&format!("{address} write failed, tearing down session"));
                            break 'session;
                        }
                    }
                    None => break 'session,
                }
            }
        }
    }

    heartbeat_task.abort();
    crate::log::syslog(&format!("{address} session ended"));
}

/// Length of the next complete frame buffered at the front of `buf`, if
/// one is fully available yet.
fn complete_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    let header = peek_header(buf).ok()?;
    let len = header.length as usize;
    if len < HEADER_SIZE || buf.len() < len {
        return None;
    }
    Some(len)
}

fn next_seq(counter: &AtomicU8) -> u8 {
    counter.fetch_add(1, Ordering::Relaxed)
}

async fn send(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    packet: &Packet,
    seq: u8,
) -> std::io::Result<()> {
    let bytes = encode(packet, seq, now_ms());
    write_half.write_all(&bytes).await
}

fn now_ms() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

fn classify(err: &CodecError) -> ErrorCode {
    match err {
        CodecError::UnknownType(_) => ErrorCode::UnknownType,
        CodecError::BadPayload(_) | CodecError::ShortBuffer(_) | CodecError::BadVersion(_) => {
            ErrorCode::InvalidParam
        }
        _ => ErrorCode::InvalidParam,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ControlState, PacketType};

    #[test]
    fn complete_frame_len_waits_for_full_header() {
        assert_eq!(complete_frame_len(&[0u8; 3]), None);
    }

    #[test]
    fn complete_frame_len_waits_for_full_body() {
        let packet = encode(&Packet::Heartbeat, 0, 0);
        assert_eq!(complete_frame_len(&packet[..packet.len() - 1]), None);
        assert_eq!(complete_frame_len(&packet), Some(packet.len()));
    }

    #[test]
    fn complete_frame_len_ignores_trailing_bytes_of_next_frame() {
        let mut buf = encode(&Packet::Heartbeat, 0, 0);
        let tail_len = buf.len();
        buf.extend(encode(
            &Packet::Control {
                control_id: 0,
                state: ControlState::Open,
            },
            1,
            0,
        ));
        assert_eq!(complete_frame_len(&buf), Some(tail_len));
    }

    #[test]
    fn sequence_counter_wraps_at_256() {
        let counter = AtomicU8::new(255);
        assert_eq!(next_seq(&counter), 255);
        assert_eq!(next_seq(&counter), 0);
    }

    #[test]
    fn classify_maps_unknown_type_distinctly() {
        assert_eq!(
            classify(&CodecError::UnknownType(PacketType::Control as u8)),
            ErrorCode::UnknownType
        );
        assert_eq!(
            classify(&CodecError::ShortBuffer(3)),
            ErrorCode::InvalidParam
        );
    }
}

/// Apply one decoded packet to device state and reply if the protocol
/// calls for it. Returns `false` if the session should tear down (a
/// write failed).
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    device: &Arc<RwLock<Device>>,
    address: &str,
    _config: &Arc<ServerConfig>,
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    sequence: &AtomicU8,
    sync_state: &mut SyncState,
    packet_type: u8,
    header_seq: u8,
    header_timestamp: u32,
    packet: Packet,
) -> bool {
    match packet {
        Packet::Data { readings } => {
            let name = {
                let mut d = device.write().await;
                // Once the session is STEADY, the device's own clock (the
                // packet header timestamp) is the time axis; it is
                // reconciled against the baseline captured at TIMESYNC ack
                // rather than the server's local elapsed time.
                let t = match (*sync_state, d.sync_timestamp_ms) {
                    (SyncState::Steady, Some(base)) => {
                        header_timestamp.wrapping_sub(base) as f64 / 1000.0
                    }
                    _ => d.start_time.elapsed().as_secs_f64(),
                };
                let values: Vec<f32> = readings.iter().map(|r| r.value).collect();
                d.append_reading(t, &values);
                d.name.clone()
            };
            for reading in &readings {
                crate::log::log(&format!(
                    "{name} sensor#{}: {}",
                    reading.sensor_id, reading.value
                ));
            }
            true
        }
        Packet::Status { status } => {
            let name = device.read().await.name.clone();
            crate::log::syslog(&format!("{name} status: {status:?}"));
            true
        }
        Packet::Heartbeat => {
            let seq = next_seq(sequence);
            let ack = Packet::Ack {
                acked_type: PacketType::Heartbeat as u8,
                acked_seq: header_seq,
                error_code: ErrorCode::None,
            };
            send(write_half, &ack, seq).await.is_ok()
        }
        Packet::Ack {
            acked_type,
            acked_seq,
            error_code,
        } => {
            if acked_type == PacketType::TimeSync as u8 {
                device.write().await.record_sync(Instant::now(), header_timestamp);
                *sync_state = SyncState::Steady;
                crate::log::debuglog(&format!("{address} TIMESYNC acked"));
            } else if acked_type == PacketType::Control as u8 {
                let applied = error_code == ErrorCode::None;
                let resolved = device.write().await.resolve_pending_control(acked_seq, applied);
                if let Some(name) = resolved {
                    let state = device
                        .read()
                        .await
                        .controls
                        .iter()
                        .find(|c| c.name == name)
                        .map(|c| c.last_known_state);
                    if let Some(state) = state {
                        crate::log::log(&format!("{address} CONTROL {name} {state:?}"));
                    }
                }
            }
            true
        }
        Packet::Nack {
            nacked_type,
            nacked_seq,
            error_code,
        } => {
            crate::log::errlog(&format!(
                "{address} NACK type=0x{nacked_type:02x} seq={nacked_seq} error={error_code:?}"
            ));
            if nacked_type == PacketType::Control as u8 {
                device.write().await.resolve_pending_control(nacked_seq, false);
            }
            true
        }
        // A device may resend CONFIG on an already-live session (e.g. after
        // its own restart race with our ack). Benign: log and move on, no
        // NACK, no re-handshake.
        Packet::Config { .. } => {
            crate::log::errlog(&format!(
                "{address} resent CONFIG on a live session; ignoring"
            ));
            true
        }
        // Remaining types the server sends, not the device: reject
        // politely rather than crash the session over a confused peer.
        Packet::Estop
        | Packet::Discovery
        | Packet::TimeSync
        | Packet::Control { .. }
        | Packet::StatusRequest
        | Packet::StreamStart { .. }
        | Packet::StreamStop
        | Packet::GetSingle => {
            crate::log::errlog(&format!(
                "{address} sent unexpected packet type 0x{packet_type:02x}"
            ));
            let seq = next_seq(sequence);
            let nack = Packet::Nack {
                nacked_type: packet_type,
                nacked_seq: header_seq,
                error_code: ErrorCode::UnknownType,
            };
            send(write_half, &nack, seq).await.is_ok()
        }
    }
}
