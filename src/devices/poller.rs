//! One poll of one device.
//!
//! A poll is all-or-nothing: either the complete node table arrives and every entry is
//! applied as one batch sourced `radio`, or the device is charged a failure and nothing is
//! written. An empty table counts as a failure.

use std::future::Future;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use super::DeviceInfo;
use crate::meshtastic::transport::{fetch_node_table, LinkOptions};
use crate::meshtastic::{LinkError, NodeTable};
use crate::metrics;
use crate::model::{NodeUpdate, Provenance};
use crate::storage::NodeStore;

/// Anything that can hand over a device's node table. The radio link in production, a
/// canned table in tests.
pub trait NodeTableSource: Send + Sync {
    fn fetch(&self, device: &DeviceInfo)
        -> impl Future<Output = Result<NodeTable, LinkError>> + Send;
}

/// Real serial/TCP link.
#[derive(Debug, Clone, Default)]
pub struct RadioLink {
    opts: LinkOptions,
}

impl RadioLink {
    pub fn new(opts: LinkOptions) -> Self {
        Self { opts }
    }
}

impl NodeTableSource for RadioLink {
    fn fetch(
        &self,
        device: &DeviceInfo,
    ) -> impl Future<Output = Result<NodeTable, LinkError>> + Send {
        let kind = device.kind;
        let address = device.address.clone();
        let opts = self.opts.clone();
        async move { fetch_node_table(kind, &address, &opts).await }
    }
}

/// Updates from one successful poll, with what is needed to build their provenance.
#[derive(Debug, Clone)]
pub struct PollBatch {
    /// Device name, recorded as the nodes' source interface.
    pub interface: String,
    pub received_at: DateTime<Utc>,
    pub my_node_num: Option<u32>,
    pub region: Option<String>,
    pub fixed_position: bool,
    pub updates: Vec<NodeUpdate>,
}

impl PollBatch {
    pub fn from_table(device: &DeviceInfo, table: &NodeTable, received_at: DateTime<Utc>) -> Self {
        Self {
            interface: device.name.clone(),
            received_at,
            my_node_num: table.my_node_num,
            region: table.region_name(),
            fixed_position: table.fixed_position,
            updates: table.updates(received_at),
        }
    }

    pub fn provenance_for(&self, update: &NodeUpdate) -> Provenance {
        let mut prov = Provenance::poll(&self.interface, self.received_at);
        prov.self_report = self.my_node_num == Some(update.node_id.num());
        prov.device_fixed_position = self.fixed_position;
        prov.region = self.region.clone();
        prov
    }

    /// Apply every update. Store failures are per update: logged, counted, and the rest of
    /// the batch still goes in. Returns how many applied.
    pub fn apply(&self, store: &NodeStore) -> usize {
        let mut applied = 0;
        for update in &self.updates {
            let prov = self.provenance_for(update);
            match store.apply_update(update, &prov) {
                Ok(outcome) => {
                    metrics::record_update(
                        outcome.created,
                        outcome.position.accepted(),
                        outcome.telemetry.is_some(),
                    );
                    applied += 1;
                }
                Err(e) => {
                    metrics::inc_store_failures();
                    error!("Store write for {} from {} failed: {}", update.node_id, self.interface, e);
                }
            }
        }
        applied
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Success { nodes: usize, applied: usize },
    Failed(String),
}

impl PollOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PollOutcome::Success { .. })
    }
}

/// Poll `device` through `source` and write the result. The registry is not touched here.
pub async fn poll_device<S: NodeTableSource>(
    source: &S,
    store: &NodeStore,
    device: &DeviceInfo,
) -> PollOutcome {
    let table = match source.fetch(device).await {
        Ok(table) => table,
        Err(e) => {
            warn!("{}: poll failed - {}", device.name, e);
            metrics::inc_poll(false);
            return PollOutcome::Failed(e.to_string());
        }
    };
    if table.is_empty() {
        warn!("{}: no nodes returned", device.name);
        metrics::inc_poll(false);
        return PollOutcome::Failed("empty node table".to_string());
    }
    let batch = PollBatch::from_table(device, &table, Utc::now());
    if let Some(region) = &batch.region {
        debug!("{}: region {}", device.name, region);
    }
    let applied = batch.apply(store);
    metrics::inc_poll(true);
    info!("{}: retrieved {} nodes", device.name, table.len());
    PollOutcome::Success {
        nodes: table.len(),
        applied,
    }
}
