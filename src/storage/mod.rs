//! # Node store
//!
//! Sled-backed persistence for reconciled node records and their history.
//!
//! | tree        | key                                   | value               |
//! |-------------|---------------------------------------|---------------------|
//! | `nodes`     | `!xxxxxxxx`                           | [`NodeRecord`]      |
//! | `positions` | `!xxxxxxxx/<nanos:020>/<id:016x>`     | [`PositionSample`]  |
//! | `telemetry` | `!xxxxxxxx/<nanos:020>/<id:016x>`     | [`TelemetryReading`]|
//! | `messages`  | `from|to|channel|packet_id`           | [`TextMessageRecord`]|
//!
//! Values are bincode encoded and carry a schema version byte. A node update (record upsert
//! plus its optional position and telemetry rows) commits as one sled transaction across the
//! three trees, so a failed write leaves nothing behind.

pub mod errors;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

pub use errors::StoreError;

use crate::config::StalenessConfig;
use crate::model::{
    ManualPosition, NodeId, NodeRecord, NodeUpdate, PositionSample, PositionSource, Provenance,
    TelemetryReading, TextMessageRecord, NODE_SCHEMA_VERSION, POSITION_SCHEMA_VERSION,
};
use crate::reconcile::{self, MergeOutcome};

const TREE_NODES: &str = "nodes";
const TREE_POSITIONS: &str = "positions";
const TREE_TELEMETRY: &str = "telemetry";
const TREE_MESSAGES: &str = "messages";

fn timestamp_nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt()
        .unwrap_or_else(|| ts.timestamp_micros() * 1000)
        .max(0)
}

fn history_key(node: NodeId, ts: DateTime<Utc>, id: u64) -> Vec<u8> {
    format!("{}/{:020}/{:016x}", node, timestamp_nanos(ts), id).into_bytes()
}

fn unwrap_tx(e: TransactionError<StoreError>) -> StoreError {
    match e {
        TransactionError::Abort(inner) => inner,
        TransactionError::Storage(err) => StoreError::Sled(err),
    }
}

fn history_prefix(node: NodeId) -> Vec<u8> {
    format!("{}/", node).into_bytes()
}

/// Counts reported by `meshtrack status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreSummary {
    pub nodes: usize,
    pub by_status: BTreeMap<&'static str, usize>,
    pub by_source: BTreeMap<&'static str, usize>,
    pub with_position: usize,
    pub position_samples: usize,
    pub telemetry_readings: usize,
    pub messages: usize,
}

/// Sled-backed store for nodes, history rows and text messages.
#[derive(Clone)]
pub struct NodeStore {
    db: sled::Db,
    nodes: sled::Tree,
    positions: sled::Tree,
    telemetry: sled::Tree,
    messages: sled::Tree,
}

impl NodeStore {
    /// Open (or create) the store rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        let nodes = db.open_tree(TREE_NODES)?;
        let positions = db.open_tree(TREE_POSITIONS)?;
        let telemetry = db.open_tree(TREE_TELEMETRY)?;
        let messages = db.open_tree(TREE_MESSAGES)?;
        info!(
            "Node store opened at {} ({} nodes)",
            path_ref.display(),
            nodes.len()
        );
        Ok(Self {
            db,
            nodes,
            positions,
            telemetry,
            messages,
        })
    }

    fn node_key(id: NodeId) -> Vec<u8> {
        id.to_string().into_bytes()
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
        Ok(bincode::deserialize::<T>(bytes)?)
    }

    fn decode_node(bytes: &[u8]) -> Result<NodeRecord, StoreError> {
        let record: NodeRecord = Self::deserialize(bytes)?;
        if record.schema_version != NODE_SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                entity: "node",
                expected: NODE_SCHEMA_VERSION,
                found: record.schema_version,
            });
        }
        Ok(record)
    }

    /// Reconcile one update into the store as a single transaction.
    pub fn apply_update(
        &self,
        update: &NodeUpdate,
        prov: &Provenance,
    ) -> Result<MergeOutcome, StoreError> {
        let key = Self::node_key(update.node_id);
        // ids are taken outside the transaction so a retried closure reuses them
        let position_id = self.db.generate_id()?;
        let telemetry_id = self.db.generate_id()?;

        let result = (&self.nodes, &self.positions, &self.telemetry).transaction(
            |(nodes, positions, telemetry)| {
                let existing = match nodes.get(&key)? {
                    Some(bytes) => {
                        Some(Self::decode_node(&bytes).map_err(ConflictableTransactionError::Abort)?)
                    }
                    None => None,
                };
                let outcome = reconcile::merge(existing, update, prov);
                let bytes =
                    Self::serialize(&outcome.record).map_err(ConflictableTransactionError::Abort)?;
                nodes.insert(key.as_slice(), bytes)?;
                if let Some(sample) = &outcome.position_sample {
                    let bytes =
                        Self::serialize(sample).map_err(ConflictableTransactionError::Abort)?;
                    positions.insert(
                        history_key(sample.node_id, sample.timestamp, position_id),
                        bytes,
                    )?;
                }
                if let Some(reading) = &outcome.telemetry {
                    let bytes =
                        Self::serialize(reading).map_err(ConflictableTransactionError::Abort)?;
                    telemetry.insert(
                        history_key(reading.node_id, reading.timestamp, telemetry_id),
                        bytes,
                    )?;
                }
                Ok(outcome)
            },
        );
        result.map_err(unwrap_tx)
    }

    /// Insert a text message. Returns `false` when a row with the same natural key exists.
    pub fn insert_message(&self, msg: &TextMessageRecord) -> Result<bool, StoreError> {
        let key = msg.natural_key();
        let bytes = Self::serialize(msg)?;
        let swapped = self
            .messages
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(bytes))?;
        if swapped.is_err() {
            debug!("duplicate message {} suppressed", key);
        }
        Ok(swapped.is_ok())
    }

    pub fn get_node(&self, id: NodeId) -> Result<Option<NodeRecord>, StoreError> {
        match self.nodes.get(Self::node_key(id))? {
            Some(bytes) => Ok(Some(Self::decode_node(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_nodes(&self) -> Result<Vec<NodeRecord>, StoreError> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for entry in self.nodes.iter() {
            let (_, bytes) = entry?;
            out.push(Self::decode_node(&bytes)?);
        }
        Ok(out)
    }

    /// Position trail of one node, oldest first, optionally from `since` onwards.
    pub fn positions_for(
        &self,
        id: NodeId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PositionSample>, StoreError> {
        let mut out = Vec::new();
        for entry in self.positions.scan_prefix(history_prefix(id)) {
            let (_, bytes) = entry?;
            let sample: PositionSample = Self::deserialize(&bytes)?;
            if since.map_or(true, |s| sample.timestamp >= s) {
                out.push(sample);
            }
        }
        Ok(out)
    }

    /// Most recent telemetry rows of one node, newest first.
    pub fn telemetry_for(
        &self,
        id: NodeId,
        limit: usize,
    ) -> Result<Vec<TelemetryReading>, StoreError> {
        let mut out = Vec::new();
        for entry in self.telemetry.scan_prefix(history_prefix(id)).rev() {
            if out.len() >= limit {
                break;
            }
            let (_, bytes) = entry?;
            out.push(Self::deserialize(&bytes)?);
        }
        Ok(out)
    }

    /// Most recent text messages across all nodes, newest first.
    pub fn recent_messages(&self, limit: usize) -> Result<Vec<TextMessageRecord>, StoreError> {
        let mut all: Vec<TextMessageRecord> = Vec::new();
        for entry in self.messages.iter() {
            let (_, bytes) = entry?;
            all.push(Self::deserialize(&bytes)?);
        }
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all.truncate(limit);
        Ok(all)
    }

    /// Read-modify-write of one node inside a transaction. `edit` returns whether it changed
    /// anything; unchanged records are not rewritten.
    fn modify_node<F>(&self, id: NodeId, edit: F) -> Result<NodeRecord, StoreError>
    where
        F: Fn(&mut NodeRecord) -> Result<bool, StoreError>,
    {
        let key = Self::node_key(id);
        self.nodes
            .transaction(|nodes| {
                let Some(bytes) = nodes.get(&key)? else {
                    return Err(ConflictableTransactionError::Abort(StoreError::NotFound(
                        format!("node {}", id),
                    )));
                };
                let mut record =
                    Self::decode_node(&bytes).map_err(ConflictableTransactionError::Abort)?;
                if edit(&mut record).map_err(ConflictableTransactionError::Abort)? {
                    record.last_updated = Utc::now();
                    let bytes =
                        Self::serialize(&record).map_err(ConflictableTransactionError::Abort)?;
                    nodes.insert(key.as_slice(), bytes)?;
                }
                Ok(record)
            })
            .map_err(unwrap_tx)
    }

    /// Set an operator position override and record it in the trail.
    pub fn set_manual_position(
        &self,
        id: NodeId,
        latitude: f64,
        longitude: f64,
        altitude: Option<f64>,
        address: Option<String>,
    ) -> Result<NodeRecord, StoreError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(StoreError::InvalidInput(format!(
                "latitude {} out of range",
                latitude
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(StoreError::InvalidInput(format!(
                "longitude {} out of range",
                longitude
            )));
        }
        let now = Utc::now();
        let key = Self::node_key(id);
        let sample = PositionSample {
            schema_version: POSITION_SCHEMA_VERSION,
            node_id: id,
            timestamp: now,
            latitude,
            longitude,
            altitude,
            source: PositionSource::Manual,
        };
        let sample_key = history_key(id, now, self.db.generate_id()?);
        let sample_bytes = Self::serialize(&sample)?;

        // override and trail row commit together
        let record = (&self.nodes, &self.positions)
            .transaction(|(nodes, positions)| {
                let Some(bytes) = nodes.get(&key)? else {
                    return Err(ConflictableTransactionError::Abort(StoreError::NotFound(
                        format!("node {}", id),
                    )));
                };
                let mut record =
                    Self::decode_node(&bytes).map_err(ConflictableTransactionError::Abort)?;
                record.manual_position = Some(ManualPosition {
                    latitude,
                    longitude,
                    altitude,
                    address: address.clone(),
                    set_at: now,
                });
                record.last_updated = now;
                let bytes =
                    Self::serialize(&record).map_err(ConflictableTransactionError::Abort)?;
                nodes.insert(key.as_slice(), bytes)?;
                positions.insert(sample_key.as_slice(), sample_bytes.as_slice())?;
                Ok(record)
            })
            .map_err(unwrap_tx)?;
        info!("Manual position set for {}: {:.6}, {:.6}", id, latitude, longitude);
        Ok(record)
    }

    /// Drop the override; the last reported position shows through again.
    pub fn clear_manual_position(&self, id: NodeId) -> Result<NodeRecord, StoreError> {
        let record = self.modify_node(id, |record| {
            if record.manual_position.take().is_none() {
                return Err(StoreError::InvalidInput(format!(
                    "node {} has no manual position",
                    id
                )));
            }
            Ok(true)
        })?;
        info!("Manual position cleared for {}", id);
        Ok(record)
    }

    /// Add a tag; tags stay unique and keep insertion order.
    pub fn add_tag(&self, id: NodeId, tag: &str) -> Result<NodeRecord, StoreError> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(StoreError::InvalidInput("empty tag".into()));
        }
        self.modify_node(id, |record| {
            if record.tags.iter().any(|t| t == tag) {
                return Ok(false);
            }
            record.tags.push(tag.to_string());
            Ok(true)
        })
    }

    pub fn remove_tag(&self, id: NodeId, tag: &str) -> Result<NodeRecord, StoreError> {
        let tag = tag.trim();
        self.modify_node(id, |record| {
            let before = record.tags.len();
            record.tags.retain(|t| t != tag);
            if record.tags.len() == before {
                return Err(StoreError::NotFound(format!("tag '{}' on {}", tag, id)));
            }
            Ok(true)
        })
    }

    pub fn set_notes(&self, id: NodeId, notes: Option<&str>) -> Result<NodeRecord, StoreError> {
        let notes = notes.map(str::trim).filter(|n| !n.is_empty());
        self.modify_node(id, |record| {
            record.notes = notes.map(str::to_string);
            Ok(true)
        })
    }

    pub fn summary(
        &self,
        staleness: &StalenessConfig,
        now: DateTime<Utc>,
    ) -> Result<StoreSummary, StoreError> {
        let mut summary = StoreSummary::default();
        for node in self.list_nodes()? {
            summary.nodes += 1;
            let status = staleness.status_for(node.last_heard, now);
            *summary.by_status.entry(status.as_str()).or_default() += 1;
            *summary.by_source.entry(node.source.as_str()).or_default() += 1;
            if node.displayed_position().is_some() {
                summary.with_position += 1;
            }
        }
        summary.position_samples = self.positions.len();
        summary.telemetry_readings = self.telemetry.len();
        summary.messages = self.messages.len();
        Ok(summary)
    }

    pub fn flush(&self) -> Result<usize, StoreError> {
        Ok(self.db.flush()?)
    }
}
