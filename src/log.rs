// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Four-channel log facade.
//!
//! Call sites reach for one of these instead of `tracing` directly so the
//! channel a message belongs to stays visible at the call site: `log` for
//! telemetry and acked controls, `syslog` for connection lifecycle,
//! `errlog` for NACKs/decode failures/disconnects, `debuglog` for
//! multicast and resync chatter. A missing subscriber is already a safe
//! no-op, so there is no fallback path to write: losing the backing log
//! sink never faults a session.

/// Telemetry and acknowledged control state, e.g. `"TestDevice TC1: 21.5"`.
pub fn log(message: &str) {
    tracing::info!(target: "telemetry", "{message}");
}

/// Connection lifecycle and issued commands.
pub fn syslog(message: &str) {
    tracing::info!(target: "syslog", "{message}");
}

/// NACKs, decode failures, disconnects.
pub fn errlog(message: &str) {
    tracing::warn!(target: "errlog", "{message}");
}

/// Multicast and resync chatter.
pub fn debuglog(message: &str) {
    tracing::debug!(target: "debuglog", "{message}");
}
