//! Records shared by both ingestion paths and the store.
//!
//! [`NodeUpdate`] is what the classifier (bus path) and the poller (direct path) produce;
//! [`NodeRecord`], [`TelemetryReading`], [`PositionSample`] and [`TextMessageRecord`] are what
//! the store keeps.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sensors::MetricSet;

pub const NODE_SCHEMA_VERSION: u8 = 1;
pub const TELEMETRY_SCHEMA_VERSION: u8 = 1;
pub const POSITION_SCHEMA_VERSION: u8 = 1;
pub const MESSAGE_SCHEMA_VERSION: u8 = 1;

/// Mesh broadcast address.
pub const BROADCAST_NUM: u32 = 0xffff_ffff;

/// Stable node identifier: the 32-bit node number rendered as `!` plus eight hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn num(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(num: u32) -> Self {
        NodeId(num)
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix('!').unwrap_or(s);
        if hex.is_empty() || hex.len() > 8 {
            return Err(format!("invalid node id '{}'", s));
        }
        u32::from_str_radix(hex, 16)
            .map(NodeId)
            .map_err(|_| format!("invalid node id '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSource {
    Gps,
    Mqtt,
    Manual,
    Fixed,
}

impl PositionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionSource::Gps => "gps",
            PositionSource::Mqtt => "mqtt",
            PositionSource::Manual => "manual",
            PositionSource::Fixed => "fixed",
        }
    }
}

impl fmt::Display for PositionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which ingestion channel a node has been attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeSource {
    Radio,
    Mqtt,
}

impl NodeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeSource::Radio => "radio",
            NodeSource::Mqtt => "mqtt",
        }
    }
}

/// Staleness bucket derived from the age of `last_heard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Recent,
    Offline,
    Dead,
    Unknown,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Recent => "recent",
            NodeStatus::Offline => "offline",
            NodeStatus::Dead => "dead",
            NodeStatus::Unknown => "unknown",
        }
    }
}

/// Role code to firmware name. Unknown codes render as `ROLE_<n>`.
pub fn role_name(role: i32) -> String {
    let name = match role {
        0 => "CLIENT",
        1 => "CLIENT_MUTE",
        2 => "ROUTER",
        3 => "ROUTER_CLIENT",
        4 => "REPEATER",
        5 => "TRACKER",
        6 => "SENSOR",
        7 => "TAK",
        8 => "CLIENT_HIDDEN",
        9 => "LOST_AND_FOUND",
        10 => "TAK_TRACKER",
        11 => "ROUTER_LATE",
        other => return format!("ROLE_{}", other),
    };
    name.to_string()
}

/// Position as last reported by the mesh (bus or poll).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
    pub source: PositionSource,
    /// Device timestamp of the fix, when the report carried one.
    pub time: Option<DateTime<Utc>>,
}

/// Operator-entered position. Automated ingestion never reads or writes this slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub address: Option<String>,
    pub set_at: DateTime<Utc>,
}

/// Coordinates a consumer should draw for a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub source: PositionSource,
}

/// Canonical, reconciled state of one mesh node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub schema_version: u8,
    pub node_id: NodeId,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<i32>,
    pub role: Option<i32>,
    pub position: Option<ReportedPosition>,
    pub manual_position: Option<ManualPosition>,
    /// Last known value of every metric ever reported for this node.
    pub metrics: MetricSet,
    pub source: NodeSource,
    pub source_interface: String,
    /// LoRa region of the device that last polled this node.
    pub region: Option<String>,
    pub last_heard: Option<DateTime<Utc>>,
    pub last_radio_contact: Option<DateTime<Utc>>,
    pub last_mqtt_contact: Option<DateTime<Utc>>,
    pub has_power_sensor: bool,
    pub has_environment_sensor: bool,
    pub has_air_quality_sensor: bool,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl NodeRecord {
    /// Blank record for a node seen for the first time.
    pub fn new(node_id: NodeId, source: NodeSource, interface: &str, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: NODE_SCHEMA_VERSION,
            node_id,
            long_name: None,
            short_name: None,
            hw_model: None,
            role: None,
            position: None,
            manual_position: None,
            metrics: MetricSet::new(),
            source,
            source_interface: interface.to_string(),
            region: None,
            last_heard: None,
            last_radio_contact: None,
            last_mqtt_contact: None,
            has_power_sensor: false,
            has_environment_sensor: false,
            has_air_quality_sensor: false,
            notes: None,
            tags: Vec::new(),
            first_seen: now,
            last_updated: now,
        }
    }

    /// Effective position source tag: `manual` while an override is set.
    pub fn position_source(&self) -> Option<PositionSource> {
        if self.manual_position.is_some() {
            return Some(PositionSource::Manual);
        }
        self.position.as_ref().map(|p| p.source)
    }

    /// Position to draw: the manual override if any, else the reported position. An exact
    /// (0, 0) is never returned.
    pub fn displayed_position(&self) -> Option<DisplayPosition> {
        if let Some(m) = &self.manual_position {
            return Some(DisplayPosition {
                latitude: m.latitude,
                longitude: m.longitude,
                altitude: m.altitude,
                source: PositionSource::Manual,
            });
        }
        let p = self.position.as_ref()?;
        if p.latitude == 0.0 && p.longitude == 0.0 {
            return None;
        }
        Some(DisplayPosition {
            latitude: p.latitude,
            longitude: p.longitude,
            altitude: p.altitude.map(f64::from),
            source: p.source,
        })
    }

    pub fn label(&self) -> String {
        match (&self.long_name, &self.short_name) {
            (Some(l), _) => l.clone(),
            (None, Some(s)) => s.clone(),
            (None, None) => self.node_id.to_string(),
        }
    }
}

/// Immutable snapshot of the sensor metrics carried by one update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub schema_version: u8,
    pub node_id: NodeId,
    pub timestamp: DateTime<Utc>,
    pub metrics: MetricSet,
    pub has_power_metrics: bool,
    pub has_environment_metrics: bool,
    pub has_air_quality_metrics: bool,
}

/// Immutable trail point, appended when a position is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub schema_version: u8,
    pub node_id: NodeId,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub source: PositionSource,
}

/// Free-text message observed on the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextMessageRecord {
    pub schema_version: u8,
    pub from: NodeId,
    pub to: NodeId,
    pub channel: u32,
    pub packet_id: u32,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub gateway_id: Option<String>,
    pub channel_id: Option<String>,
}

impl TextMessageRecord {
    /// Natural key used for duplicate suppression.
    pub fn natural_key(&self) -> String {
        format!(
            "{}|{}|{}|{:010}",
            self.from, self.to, self.channel, self.packet_id
        )
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.num() == BROADCAST_NUM
    }
}

/// Identity attributes extracted from one report. Empty strings are already dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityReport {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<i32>,
    pub role: Option<i32>,
}

impl IdentityReport {
    pub fn is_empty(&self) -> bool {
        self.long_name.is_none()
            && self.short_name.is_none()
            && self.hw_model.is_none()
            && self.role.is_none()
    }
}

/// Position extracted from one report, already converted to decimal degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionReport {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
    pub time: Option<DateTime<Utc>>,
    /// Device flagged the fix as entered by hand (`LOC_MANUAL`).
    pub manual_fix: bool,
}

impl PositionReport {
    /// Convert fixed-point (1e-7 degree) coordinates. `(0, 0)` and missing axes mean
    /// "no position".
    pub fn from_fixed(
        latitude_i: Option<i32>,
        longitude_i: Option<i32>,
        altitude: Option<i32>,
        time: u32,
    ) -> Option<Self> {
        let (lat_i, lon_i) = (latitude_i?, longitude_i?);
        if lat_i == 0 && lon_i == 0 {
            return None;
        }
        Some(Self {
            latitude: f64::from(lat_i) / 1e7,
            longitude: f64::from(lon_i) / 1e7,
            altitude,
            time: unix_time(time),
            manual_fix: false,
        })
    }
}

/// Seconds since the epoch to a timestamp; `0` means unknown.
pub fn unix_time(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    DateTime::<Utc>::from_timestamp(i64::from(secs), 0)
}

/// One classified update about one node, from either ingestion path.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub node_id: NodeId,
    pub identity: IdentityReport,
    pub position: Option<PositionReport>,
    pub metrics: MetricSet,
    /// When the node was last heard according to this report.
    pub heard_at: Option<DateTime<Utc>>,
}

impl NodeUpdate {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            identity: IdentityReport::default(),
            position: None,
            metrics: MetricSet::new(),
            heard_at: None,
        }
    }
}

/// Ingestion path an update arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Bus,
    Poll,
}

/// Where an update came from, evaluated by the reconciliation rules.
#[derive(Debug, Clone, PartialEq)]
pub struct Provenance {
    pub channel: Channel,
    /// Topic on the bus path, device address on the poll path.
    pub interface: String,
    pub received_at: DateTime<Utc>,
    /// Sender is the polling device itself.
    pub self_report: bool,
    /// Polling device is configured with a fixed position.
    pub device_fixed_position: bool,
    /// LoRa region name of the polling device.
    pub region: Option<String>,
}

impl Provenance {
    pub fn bus(topic: &str, received_at: DateTime<Utc>) -> Self {
        Self {
            channel: Channel::Bus,
            interface: topic.to_string(),
            received_at,
            self_report: false,
            device_fixed_position: false,
            region: None,
        }
    }

    pub fn poll(device: &str, received_at: DateTime<Utc>) -> Self {
        Self {
            channel: Channel::Poll,
            interface: device.to_string(),
            received_at,
            self_report: false,
            device_fixed_position: false,
            region: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_renders_fixed_width_hex() {
        assert_eq!(NodeId(0x1a2b).to_string(), "!00001a2b");
        assert_eq!(NodeId(0xdeadbeef).to_string(), "!deadbeef");
        assert_eq!("!00001a2b".parse::<NodeId>().unwrap(), NodeId(0x1a2b));
        assert!("!zz".parse::<NodeId>().is_err());
        assert!("!123456789".parse::<NodeId>().is_err());
    }

    #[test]
    fn zero_zero_is_no_position() {
        assert!(PositionReport::from_fixed(Some(0), Some(0), Some(10), 0).is_none());
        assert!(PositionReport::from_fixed(None, Some(5), None, 0).is_none());
        let p = PositionReport::from_fixed(Some(0), Some(1_234_567), None, 0).unwrap();
        assert_eq!(p.latitude, 0.0);
        assert!((p.longitude - 0.1234567).abs() < 1e-12);
    }

    #[test]
    fn displayed_position_hides_origin_and_prefers_manual() {
        let now = Utc::now();
        let mut rec = NodeRecord::new(NodeId(1), NodeSource::Mqtt, "msh/test", now);
        rec.position = Some(ReportedPosition {
            latitude: 0.0,
            longitude: 0.0,
            altitude: None,
            source: PositionSource::Mqtt,
            time: None,
        });
        assert!(rec.displayed_position().is_none());

        rec.manual_position = Some(ManualPosition {
            latitude: 40.0,
            longitude: -105.0,
            altitude: Some(1600.0),
            address: None,
            set_at: now,
        });
        let shown = rec.displayed_position().unwrap();
        assert_eq!(shown.source, PositionSource::Manual);
        assert_eq!(rec.position_source(), Some(PositionSource::Manual));
    }

    #[test]
    fn message_key_is_stable() {
        let m = TextMessageRecord {
            schema_version: MESSAGE_SCHEMA_VERSION,
            from: NodeId(1),
            to: NodeId(BROADCAST_NUM),
            channel: 0,
            packet_id: 77,
            timestamp: Utc::now(),
            text: "hi".into(),
            gateway_id: None,
            channel_id: None,
        };
        assert_eq!(m.natural_key(), "!00000001|!ffffffff|0|0000000077");
        assert!(m.is_broadcast());
    }

    #[test]
    fn role_names_cover_known_and_unknown() {
        assert_eq!(role_name(2), "ROUTER");
        assert_eq!(role_name(42), "ROLE_42");
    }
}
