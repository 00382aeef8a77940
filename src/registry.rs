// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide registry of connected devices, keyed by network address.
//!
//! Each entry bundles the device's shared, lock-protected state with the
//! handles a caller needs to reach its owning session: a cancellation
//! handle for the session task and an outbound channel for anything that
//! wants to send the device a packet without owning its socket directly.

use crate::device::Device;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::codec::Packet;

/// Everything the registry stores for one connected device.
pub struct RegisteredDevice {
    pub device: Arc<RwLock<Device>>,
    pub outbound: mpsc::Sender<Packet>,
    pub session_task: JoinHandle<()>,
}

/// Keyed by device network address (`ip:port`). Insertion order is
/// tracked separately so `snapshot()` iterates in a stable, deterministic
/// order rather than HashMap's unspecified one.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, RegisteredDevice>,
    order: Vec<String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry, or hand it back on a duplicate address so the
    /// caller can abort its session task instead of leaking it: a plain
    /// drop here would only detach the task, leaving it running forever.
    pub fn insert(
        &mut self,
        address: String,
        entry: RegisteredDevice,
    ) -> Result<(), RegisteredDevice> {
        if self.devices.contains_key(&address) {
            return Err(entry);
        }
        self.order.push(address.clone());
        self.devices.insert(address, entry);
        Ok(())
    }

    pub fn lookup(&self, address: &str) -> Option<&RegisteredDevice> {
        self.devices.get(address)
    }

    /// Remove and return an entry, aborting its session task. Callers
    /// that are the session task itself should not abort themselves;
    /// use `remove_without_abort` there.
    pub fn remove(&mut self, address: &str) -> Option<RegisteredDevice> {
        let entry = self.devices.remove(address);
        if entry.is_some() {
            self.order.retain(|a| a != address);
        }
        if let Some(entry) = &entry {
            entry.session_task.abort();
        }
        entry
    }

    /// Remove an entry without aborting its session task. Used by a
    /// session task cleaning up its own registry entry on the way out,
    /// where aborting itself would be a no-op race at best.
    pub fn remove_without_abort(&mut self, address: &str) -> Option<RegisteredDevice> {
        let entry = self.devices.remove(address);
        if entry.is_some() {
            self.order.retain(|a| a != address);
        }
        entry
    }

    pub fn contains(&self, address: &str) -> bool {
        self.devices.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Addresses of every registered device, in insertion order.
    pub fn snapshot(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Invoke `f` once per registered device, in insertion order.
    pub fn each<'a, F>(&'a self, mut f: F)
    where
        F: FnMut(&'a str, &'a RegisteredDevice),
    {
        for address in &self.order {
            if let Some(entry) = self.devices.get(address) {
                f(address, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    fn dummy_entry() -> RegisteredDevice {
        let (tx, _rx) = mpsc::channel(8);
        let device = Device::new(
            "addr".to_string(),
            "name".to_string(),
            "type".to_string(),
            serde_json::json!({}),
            vec![],
            vec![],
        );
        RegisteredDevice {
            device: Arc::new(RwLock::new(device)),
            outbound: tx,
            session_task: tokio::spawn(async {}),
        }
    }

    #[tokio::test]
    async fn insert_lookup_remove() {
        let mut registry = DeviceRegistry::new();
        registry
            .insert("1.2.3.4:1".to_string(), dummy_entry())
            .unwrap();

        assert!(registry.contains("1.2.3.4:1"));
        assert!(registry.lookup("1.2.3.4:1").is_some());

        let removed = registry.remove("1.2.3.4:1");
        assert!(removed.is_some());
        assert!(!registry.contains("1.2.3.4:1"));
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let mut registry = DeviceRegistry::new();
        registry
            .insert("1.2.3.4:1".to_string(), dummy_entry())
            .unwrap();

        let rejected = registry.insert("1.2.3.4:1".to_string(), dummy_entry());
        assert!(rejected.is_err());
        rejected.err().unwrap().session_task.abort();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_preserves_insertion_order() {
        let mut registry = DeviceRegistry::new();
        registry.insert("c".to_string(), dummy_entry()).unwrap();
        registry.insert("a".to_string(), dummy_entry()).unwrap();
        registry.insert("b".to_string(), dummy_entry()).unwrap();

        assert_eq!(registry.snapshot(), vec!["c", "a", "b"]);
    }
}
