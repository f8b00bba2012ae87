//! The shared device set.
//!
//! One mutex guards the whole map; every method takes it, does its read-modify-write and
//! releases it, so no caller can hold it across I/O. Devices are keyed by address in a
//! `BTreeMap`, which also makes election deterministic: on equal scores the lowest address
//! wins.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Deserialize;

use super::{DeviceInfo, DeviceKind};
use crate::meshtastic::transport::tcp_target;

/// Result of one election.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Election {
    pub primary: Option<String>,
    /// Previous primary, when the role moved.
    pub demoted: Option<String>,
    pub changed: bool,
}

#[derive(Default)]
pub struct Registry {
    devices: Mutex<BTreeMap<String, DeviceInfo>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, DeviceInfo>> {
        // the map stays consistent across a panic in another holder; keep going
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.lock().contains_key(address)
    }

    pub fn get(&self, address: &str) -> Option<DeviceInfo> {
        self.lock().get(address).cloned()
    }

    /// All devices, primary first, then by address.
    pub fn snapshot(&self) -> Vec<DeviceInfo> {
        let mut all: Vec<DeviceInfo> = self.lock().values().cloned().collect();
        all.sort_by_key(|d| !d.is_primary);
        all
    }

    /// Register a device unless its address is already known. Returns whether it was added.
    pub fn insert_if_absent(&self, device: DeviceInfo) -> bool {
        let mut guard = self.lock();
        if guard.contains_key(&device.address) {
            return false;
        }
        guard.insert(device.address.clone(), device);
        true
    }

    /// Recompute every score and move the primary role to the best device.
    pub fn elect(&self, now: DateTime<Utc>) -> Election {
        let mut guard = self.lock();
        let previous = guard
            .values()
            .find(|d| d.is_primary)
            .map(|d| d.address.clone());

        let mut best: Option<(&str, f64)> = None;
        for device in guard.values_mut() {
            device.priority_score = device.score(now);
        }
        for device in guard.values() {
            // strictly greater: ties keep the earlier (lower) address
            if best.map_or(true, |(_, s)| device.priority_score > s) {
                best = Some((device.address.as_str(), device.priority_score));
            }
        }
        let primary = best.map(|(a, _)| a.to_string());

        for device in guard.values_mut() {
            let now_primary = primary.as_deref() == Some(device.address.as_str());
            if now_primary && !device.is_primary {
                info!(
                    "NEW PRIMARY: {} (nodes: {}, score: {:.1}, health: {}%)",
                    device.name,
                    device.node_count,
                    device.priority_score,
                    device.health_pct()
                );
            } else if device.is_primary && !now_primary {
                info!("DEMOTED: {} (now standby)", device.name);
            }
            device.is_primary = now_primary;
        }

        let changed = previous != primary;
        Election {
            demoted: previous.filter(|_| changed),
            primary,
            changed,
        }
    }

    /// Devices to poll this cycle: the primary always, each standby when its counter reaches
    /// `divisor` (the counter then restarts). Primary comes first.
    pub fn select_for_cycle(&self, divisor: u32) -> Vec<DeviceInfo> {
        let divisor = divisor.max(1);
        let mut guard = self.lock();
        let mut out = Vec::new();
        for device in guard.values_mut() {
            if device.is_primary {
                out.push(device.clone());
                continue;
            }
            device.standby_poll_counter += 1;
            if device.standby_poll_counter >= divisor {
                device.standby_poll_counter = 0;
                out.push(device.clone());
            }
        }
        out.sort_by_key(|d| !d.is_primary);
        out
    }

    /// Returns the updated device, or `None` if it was removed meanwhile.
    pub fn record_success(
        &self,
        address: &str,
        node_count: usize,
        now: DateTime<Utc>,
    ) -> Option<DeviceInfo> {
        let mut guard = self.lock();
        let device = guard.get_mut(address)?;
        device.mark_success(node_count, now);
        Some(device.clone())
    }

    pub fn record_failure(&self, address: &str, now: DateTime<Utc>) -> Option<DeviceInfo> {
        let mut guard = self.lock();
        let device = guard.get_mut(address)?;
        device.mark_failure(now);
        Some(device.clone())
    }

    /// Drop devices whose failure count reached `max_fail_count`.
    pub fn remove_dead(&self, max_fail_count: u32) -> Vec<DeviceInfo> {
        let mut guard = self.lock();
        let dead: Vec<String> = guard
            .values()
            .filter(|d| d.should_remove(max_fail_count))
            .map(|d| d.address.clone())
            .collect();
        let mut removed = Vec::with_capacity(dead.len());
        for address in dead {
            if let Some(device) = guard.remove(&address) {
                warn!(
                    "Removing dead device: {} (failed {} times)",
                    device.name, device.fail_count
                );
                removed.push(device);
            }
        }
        removed
    }

    /// Add manual entries that are not registered yet. Returns how many were added.
    pub fn merge_manual(&self, entries: Vec<DeviceInfo>) -> usize {
        let mut added = 0;
        for device in entries {
            let name = device.name.clone();
            let address = device.address.clone();
            if self.insert_if_absent(device) {
                info!("Loaded manual device: {} ({})", name, address);
                added += 1;
            }
        }
        added
    }

    /// `(responding, registered)`; responding means no failure since the last success.
    pub fn responding(&self) -> (usize, usize) {
        let guard = self.lock();
        let ok = guard.values().filter(|d| d.fail_count == 0).count();
        (ok, guard.len())
    }
}

#[derive(Debug, Deserialize)]
struct ManualEntry {
    #[serde(rename = "type")]
    kind: DeviceKind,
    #[serde(default)]
    name: Option<String>,
}

/// Parse the manual registry: `{ "<address>": { "type": "serial"|"tcp", "name": "..." } }`.
///
/// TCP addresses without a port get `tcp_port`, so they key the same registry entry as a
/// discovered `ip:port`. An unusable TCP address is logged and skipped.
pub fn parse_manual_registry(
    json: &str,
    tcp_port: u16,
    now: DateTime<Utc>,
) -> Result<Vec<DeviceInfo>, serde_json::Error> {
    let entries: BTreeMap<String, ManualEntry> = serde_json::from_str(json)?;
    Ok(entries
        .into_iter()
        .filter_map(|(address, e)| {
            let address = match e.kind {
                DeviceKind::Tcp => match tcp_target(&address, tcp_port) {
                    Ok(target) => target,
                    Err(err) => {
                        warn!("Skipping manual device {:?}: {}", address, err);
                        return None;
                    }
                },
                DeviceKind::Serial => address,
            };
            Some(DeviceInfo::new(e.kind, &address, e.name.as_deref(), now))
        })
        .collect())
}

/// Read the manual registry file. A missing file is an empty registry; an unreadable or
/// malformed one is logged and treated as empty so polling carries on.
pub async fn load_manual_registry(
    path: &Path,
    tcp_port: u16,
    now: DateTime<Utc>,
) -> Vec<DeviceInfo> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("Failed to read manual registry {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    match parse_manual_registry(&content, tcp_port, now) {
        Ok(devices) => devices,
        Err(e) => {
            warn!("Failed to parse manual registry {}: {}", path.display(), e);
            Vec::new()
        }
    }
}
