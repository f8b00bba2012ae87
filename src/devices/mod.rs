//! # Direct-poll devices
//!
//! - [`registry`] - the set of known radios, scoring and primary election
//! - [`discovery`] - USB enumeration and network sweeps that feed the registry
//! - [`poller`] - one poll of one device, applied to the store as a batch
//! - [`scheduler`] - the polling cycle: election, primary/standby cadence, failover, removal
//!
//! Device lifecycle: discovered (or loaded from the manual registry file) → polled
//! successfully (`fail_count = 0`) ⇄ failing (`fail_count` > 0) → removed once `fail_count`
//! reaches `max_fail_count`. Discovery only ever adds devices.

pub mod discovery;
pub mod poller;
pub mod registry;
pub mod scheduler;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use poller::{NodeTableSource, PollBatch, PollOutcome, RadioLink};
pub use registry::Registry;
pub use scheduler::{PollScheduler, SchedulerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Serial,
    Tcp,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Serial => "serial",
            DeviceKind::Tcp => "tcp",
        })
    }
}

/// One poll endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    /// Serial port path or `host:port`; the registry key.
    pub address: String,
    pub name: String,
    pub last_seen: DateTime<Utc>,
    pub fail_count: u32,
    /// Nodes returned by the last successful poll.
    pub node_count: usize,
    pub last_success: Option<DateTime<Utc>>,
    pub is_primary: bool,
    pub priority_score: f64,
    pub standby_poll_counter: u32,
}

impl DeviceInfo {
    pub fn new(kind: DeviceKind, address: &str, name: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            address: address.to_string(),
            name: name.unwrap_or(address).to_string(),
            last_seen: now,
            fail_count: 0,
            node_count: 0,
            last_success: None,
            is_primary: false,
            priority_score: 0.0,
            standby_poll_counter: 0,
        }
    }

    pub fn mark_success(&mut self, node_count: usize, now: DateTime<Utc>) {
        self.last_seen = now;
        self.last_success = Some(now);
        self.fail_count = 0;
        self.node_count = node_count;
    }

    pub fn mark_failure(&mut self, now: DateTime<Utc>) {
        self.fail_count = self.fail_count.saturating_add(1);
        self.last_seen = now;
    }

    pub fn should_remove(&self, max_fail_count: u32) -> bool {
        self.fail_count >= max_fail_count
    }

    /// `node_count × reliability × recency`. Devices that never returned a node score 0.
    pub fn score(&self, now: DateTime<Utc>) -> f64 {
        if self.node_count == 0 {
            return 0.0;
        }
        let reliability = (1.0 - 0.1 * f64::from(self.fail_count)).max(0.5);
        let recency = match self.last_success {
            Some(at) => {
                let age = (now - at).num_milliseconds().max(0) as f64 / 1000.0;
                (1.1 - age / 3600.0).max(1.0)
            }
            None => 1.0,
        };
        self.node_count as f64 * reliability * recency
    }

    /// Health percentage shown in status lines.
    pub fn health_pct(&self) -> u32 {
        let penalty = (0.1 * f64::from(self.fail_count)).min(1.0);
        (100.0 * (1.0 - penalty)).round() as u32
    }

    pub fn role(&self) -> &'static str {
        if self.is_primary {
            "PRIMARY"
        } else {
            "STANDBY"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn device(nodes: usize, fails: u32) -> DeviceInfo {
        let mut d = DeviceInfo::new(DeviceKind::Tcp, "10.0.0.1:4403", None, Utc::now());
        d.node_count = nodes;
        d.fail_count = fails;
        d
    }

    #[test]
    fn reliability_floors_at_half() {
        let now = Utc::now();
        assert_eq!(device(10, 0).score(now), 10.0);
        assert!((device(10, 2).score(now) - 8.0).abs() < 1e-9);
        assert!((device(10, 9).score(now) - 5.0).abs() < 1e-9);
        assert_eq!(device(0, 0).score(now), 0.0);
    }

    #[test]
    fn recency_bonus_decays_to_neutral() {
        let now = Utc::now();
        let mut d = device(10, 0);
        d.last_success = Some(now);
        assert!((d.score(now) - 11.0).abs() < 1e-9);
        d.last_success = Some(now - Duration::minutes(30));
        assert!((d.score(now) - 10.0).abs() < 1e-9);
        d.last_success = Some(now - Duration::hours(5));
        assert!((d.score(now) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn success_resets_failures() {
        let now = Utc::now();
        let mut d = device(0, 0);
        d.mark_failure(now);
        d.mark_failure(now);
        assert_eq!(d.fail_count, 2);
        assert_eq!(d.health_pct(), 80);
        d.mark_success(7, now);
        assert_eq!(d.fail_count, 0);
        assert_eq!(d.node_count, 7);
        assert_eq!(d.last_success, Some(now));
        assert!(!d.should_remove(10));
    }

    #[test]
    fn default_name_is_address() {
        let d = DeviceInfo::new(DeviceKind::Serial, "/dev/ttyUSB0", None, Utc::now());
        assert_eq!(d.name, "/dev/ttyUSB0");
        assert_eq!(d.kind.to_string(), "serial");
    }
}
