//! The polling cycle.
//!
//! Each cycle: merge the manual registry file, elect a primary, poll the primary and any
//! standby whose cadence counter is due, re-elect straight away if the primary has hit the
//! failover threshold, then drop devices that reached the failure ceiling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use super::poller::{poll_device, NodeTableSource, PollOutcome};
use super::registry::{load_manual_registry, Registry};
use crate::config::DevicesConfig;
use crate::metrics;
use crate::storage::NodeStore;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub standby_poll_divisor: u32,
    pub primary_failover_threshold: u32,
    pub max_fail_count: u32,
    pub manual_registry: Option<PathBuf>,
    /// Port given to manual TCP entries that name only a host.
    pub tcp_port: u16,
    /// Pause between two device polls within a cycle.
    pub inter_poll_delay: Duration,
}

impl SchedulerSettings {
    pub fn from_config(devices: &DevicesConfig) -> Self {
        Self {
            standby_poll_divisor: devices.standby_poll_divisor,
            primary_failover_threshold: devices.primary_failover_threshold,
            max_fail_count: devices.max_fail_count,
            manual_registry: Some(PathBuf::from(&devices.manual_registry)),
            tcp_port: devices.tcp_port,
            inter_poll_delay: Duration::from_secs(1),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            standby_poll_divisor: 5,
            primary_failover_threshold: 3,
            max_fail_count: 10,
            manual_registry: None,
            tcp_port: 4403,
            inter_poll_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub primary: Option<String>,
    pub polled: Vec<(String, PollOutcome)>,
    /// The primary crossed the failover threshold and the role was re-elected.
    pub failover: bool,
    pub removed: Vec<String>,
}

pub struct PollScheduler<S> {
    registry: Arc<Registry>,
    store: NodeStore,
    source: S,
    settings: SchedulerSettings,
    cycle: u64,
}

impl<S: NodeTableSource> PollScheduler<S> {
    pub fn new(registry: Arc<Registry>, store: NodeStore, source: S, settings: SchedulerSettings) -> Self {
        Self {
            registry,
            store,
            source,
            settings,
            cycle: 0,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport {
            cycle: self.cycle,
            ..CycleReport::default()
        };

        if let Some(path) = &self.settings.manual_registry {
            let manual = load_manual_registry(path, self.settings.tcp_port, Utc::now()).await;
            self.registry.merge_manual(manual);
        }
        if self.registry.is_empty() {
            debug!("No devices to poll");
            self.cycle += 1;
            return report;
        }

        let election = self.registry.elect(Utc::now());
        report.primary = election.primary.clone();
        let due = self.registry.select_for_cycle(self.settings.standby_poll_divisor);
        info!("Polling {} device(s) (cycle {})", due.len(), self.cycle);

        for (i, device) in due.iter().enumerate() {
            if i > 0 && !self.settings.inter_poll_delay.is_zero() {
                time::sleep(self.settings.inter_poll_delay).await;
            }
            debug!("[{}] {}", device.role(), device.name);
            let outcome = poll_device(&self.source, &self.store, device).await;
            let now = Utc::now();
            let updated = match &outcome {
                PollOutcome::Success { nodes, .. } => {
                    self.registry.record_success(&device.address, *nodes, now)
                }
                PollOutcome::Failed(_) => self.registry.record_failure(&device.address, now),
            };
            report.polled.push((device.address.clone(), outcome));

            let Some(updated) = updated else { continue };
            if device.is_primary
                && !report.failover
                && updated.fail_count >= self.settings.primary_failover_threshold
            {
                warn!(
                    "Primary {} failing ({} failures), triggering re-selection",
                    updated.name, updated.fail_count
                );
                let again = self.registry.elect(now);
                report.primary = again.primary;
                report.failover = true;
            }
        }

        for dead in self.registry.remove_dead(self.settings.max_fail_count) {
            metrics::inc_devices_removed();
            report.removed.push(dead.address);
        }
        self.cycle += 1;
        report
    }

    /// Run a cycle every `cadence` until shutdown flips to true.
    pub async fn run(mut self, cadence: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.store.flush() {
            warn!("Store flush on shutdown failed: {}", e);
        }
        debug!("polling task stopped");
    }
}

/// Status block logged by the status task.
pub fn status_lines(registry: &Registry) -> Vec<String> {
    let (responding, registered) = registry.responding();
    let mut lines = vec![format!("Status: {}/{} devices responding", responding, registered)];
    for d in registry.snapshot() {
        lines.push(format!(
            "  {}: {} (nodes: {}, score: {:.1}, health: {}%)",
            d.role(),
            d.name,
            d.node_count,
            d.priority_score,
            d.health_pct()
        ));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DeviceInfo, DeviceKind};

    #[test]
    fn status_block_lists_primary_first() {
        let registry = Registry::new();
        let now = Utc::now();
        let mut a = DeviceInfo::new(DeviceKind::Tcp, "a", Some("Alpha"), now);
        a.node_count = 1;
        let mut b = DeviceInfo::new(DeviceKind::Tcp, "b", Some("Bravo"), now);
        b.node_count = 9;
        b.fail_count = 1;
        registry.insert_if_absent(a);
        registry.insert_if_absent(b);
        registry.elect(now);
        let lines = status_lines(&registry);
        assert_eq!(lines[0], "Status: 1/2 devices responding");
        assert!(lines[1].starts_with("  PRIMARY: Bravo"));
        assert!(lines[1].contains("health: 90%"));
        assert!(lines[2].starts_with("  STANDBY: Alpha"));
    }
}
