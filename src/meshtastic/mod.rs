//! # Meshtastic device link
//!
//! Everything needed to pull a node table out of one radio:
//!
//! - [`framer`] - `0x94 0xC3` length-prefixed stream framing
//! - [`session`] - the `want_config_id` handshake as a sans-IO state machine
//! - [`transport`] - TCP and serial byte pipes driving a session to completion
//!
//! The result of a poll is a [`NodeTable`]: the device's own node number, its LoRa region and
//! fixed-position setting, plus one [`TableEntry`] per node it knows about. Entries already
//! carry identity, position and metrics structurally, so [`NodeTable::updates`] only extracts
//! fields; nothing on this path is decrypted or classified.
//!
//! ```rust,no_run
//! use meshtrack::devices::DeviceKind;
//! use meshtrack::meshtastic::transport::{fetch_node_table, LinkOptions};
//!
//! # async fn demo() -> Result<(), meshtrack::meshtastic::LinkError> {
//! let table = fetch_node_table(DeviceKind::Tcp, "192.168.1.40:4403", &LinkOptions::default()).await?;
//! println!("{} nodes, region {:?}", table.len(), table.region_name());
//! # Ok(())
//! # }
//! ```

pub mod framer;
pub mod session;
pub mod transport;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ingest::classify::{identity_report, position_report};
use crate::model::{unix_time, NodeId, NodeUpdate};
use crate::protobuf as proto;
use crate::sensors::{Metric, MetricSet};

pub use framer::{FrameTooLarge, StreamFramer};
pub use session::ConfigSession;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("cannot reach {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serial")]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),
    #[error("device closed the connection before the node table was complete")]
    Closed,
    #[error(transparent)]
    FrameTooLarge(#[from] FrameTooLarge),
    #[error("bad device address '{0}'")]
    BadAddress(String),
    #[error("serial support not compiled in")]
    SerialUnsupported,
    #[error("device task failed: {0}")]
    Task(String),
}

/// LoRa region enum value to its firmware name.
pub fn region_name(code: i32) -> String {
    let name = match code {
        0 => "UNSET",
        1 => "US",
        2 => "EU_433",
        3 => "EU_868",
        4 => "CN",
        5 => "JP",
        6 => "ANZ",
        7 => "KR",
        8 => "TW",
        9 => "RU",
        10 => "IN",
        11 => "NZ_865",
        12 => "TH",
        13 => "UA_433",
        14 => "UA_868",
        15 => "MY_433",
        16 => "MY_919",
        17 => "SG_923",
        18 => "LORA_24",
        other => return format!("UNKNOWN_{}", other),
    };
    name.to_string()
}

/// One node as the polling device knows it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableEntry {
    pub info: proto::NodeInfo,
    /// Environment, power and air-quality readings seen in live packets during the poll.
    pub extra_metrics: MetricSet,
    /// RSSI of the last live packet from this node.
    pub rssi: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeTable {
    pub my_node_num: Option<u32>,
    pub region_code: Option<i32>,
    /// Device is configured with a fixed position.
    pub fixed_position: bool,
    pub entries: BTreeMap<u32, TableEntry>,
}

impl NodeTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn region_name(&self) -> Option<String> {
        self.region_code.map(region_name)
    }

    pub fn is_self(&self, node: NodeId) -> bool {
        self.my_node_num == Some(node.num())
    }

    pub fn entry_mut(&mut self, num: u32) -> &mut TableEntry {
        let entry = self.entries.entry(num).or_default();
        entry.info.num = num;
        entry
    }

    /// Fold a live mesh packet seen during the handshake into its sender's entry.
    pub fn merge_packet(&mut self, pkt: &proto::MeshPacket, now: DateTime<Utc>) {
        use prost::Message;
        use proto::mesh_packet::PayloadVariant;
        use proto::PortNum;

        let Some(PayloadVariant::Decoded(data)) = &pkt.payload_variant else {
            return;
        };
        let port = PortNum::try_from(data.portnum).unwrap_or(PortNum::UnknownApp);
        if !matches!(
            port,
            PortNum::PositionApp | PortNum::NodeinfoApp | PortNum::TelemetryApp
        ) {
            return;
        }
        let entry = self.entry_mut(pkt.from);
        match port {
            PortNum::PositionApp => {
                if let Ok(pos) = proto::Position::decode(data.payload.as_slice()) {
                    if position_report(&pos).is_some() {
                        entry.info.position = Some(pos);
                    }
                }
            }
            PortNum::NodeinfoApp => {
                if let Ok(user) = proto::User::decode(data.payload.as_slice()) {
                    entry.info.user = Some(user);
                }
            }
            _ => {
                if let Ok(t) = proto::Telemetry::decode(data.payload.as_slice()) {
                    match t.variant {
                        Some(proto::telemetry::Variant::DeviceMetrics(dm)) => {
                            entry.info.device_metrics = Some(dm)
                        }
                        _ => entry.extra_metrics.add_telemetry(&t),
                    }
                }
            }
        }
        if pkt.rx_rssi != 0 {
            entry.rssi = Some(pkt.rx_rssi);
        }
        if pkt.rx_snr != 0.0 {
            entry.info.snr = pkt.rx_snr;
        }
        let heard = if pkt.rx_time != 0 {
            pkt.rx_time
        } else {
            u32::try_from(now.timestamp()).unwrap_or(0)
        };
        entry.info.last_heard = entry.info.last_heard.max(heard);
    }

    /// One update per entry. The device's own entry is heard `now`; every other entry keeps
    /// the device's `last_heard`.
    pub fn updates(&self, now: DateTime<Utc>) -> Vec<NodeUpdate> {
        self.entries
            .values()
            .map(|entry| {
                let node_id = NodeId(entry.info.num);
                let mut update = NodeUpdate::new(node_id);
                if let Some(user) = &entry.info.user {
                    update.identity = identity_report(user);
                }
                update.position = entry.info.position.as_ref().and_then(position_report);
                if let Some(dm) = &entry.info.device_metrics {
                    update.metrics.add_device(dm);
                }
                update.metrics.merge_from(&entry.extra_metrics);
                update
                    .metrics
                    .insert_checked(Metric::Snr, Some(f64::from(entry.info.snr)));
                update
                    .metrics
                    .insert_checked(Metric::Rssi, entry.rssi.map(f64::from));
                update
                    .metrics
                    .insert_checked(Metric::HopsAway, entry.info.hops_away.map(f64::from));
                update.heard_at = if self.is_self(node_id) {
                    Some(now)
                } else {
                    unix_time(entry.info.last_heard)
                };
                update
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protobuf::{mesh_packet::PayloadVariant, PortNum};
    use prost::Message;

    fn node(num: u32, name: &str, last_heard: u32) -> proto::NodeInfo {
        proto::NodeInfo {
            num,
            user: Some(proto::User {
                long_name: name.into(),
                short_name: name[..2].into(),
                hw_model: 9,
                ..Default::default()
            }),
            snr: 5.5,
            last_heard,
            ..Default::default()
        }
    }

    #[test]
    fn region_names() {
        assert_eq!(region_name(1), "US");
        assert_eq!(region_name(3), "EU_868");
        assert_eq!(region_name(18), "LORA_24");
        assert_eq!(region_name(42), "UNKNOWN_42");
    }

    #[test]
    fn self_entry_is_heard_now() {
        let now = Utc::now();
        let mut table = NodeTable {
            my_node_num: Some(1),
            ..Default::default()
        };
        table.entry_mut(1).info = node(1, "Base", 1_600_000_000);
        table.entry_mut(2).info = node(2, "Remote", 1_700_000_000);
        let updates = table.updates(now);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].heard_at, Some(now));
        assert_eq!(updates[1].heard_at, unix_time(1_700_000_000));
        assert_eq!(updates[1].identity.long_name.as_deref(), Some("Remote"));
        assert_eq!(updates[1].metrics.get(Metric::Snr), Some(5.5));
    }

    #[test]
    fn live_packets_merge_into_sender() {
        let now = Utc::now();
        let mut table = NodeTable::default();
        let env = proto::Telemetry {
            time: 0,
            variant: Some(proto::telemetry::Variant::EnvironmentMetrics(
                proto::EnvironmentMetrics {
                    temperature: Some(18.0),
                    ..Default::default()
                },
            )),
        };
        let pkt = proto::MeshPacket {
            from: 0x55,
            rx_rssi: -97,
            rx_time: 1_700_000_100,
            payload_variant: Some(PayloadVariant::Decoded(proto::Data {
                portnum: PortNum::TelemetryApp as i32,
                payload: env.encode_to_vec(),
                ..Default::default()
            })),
            ..Default::default()
        };
        table.merge_packet(&pkt, now);
        let updates = table.updates(now);
        assert_eq!(updates.len(), 1);
        let u = &updates[0];
        assert_eq!(u.node_id, NodeId(0x55));
        assert_eq!(u.metrics.get(Metric::Temperature), Some(18.0));
        assert_eq!(u.metrics.get(Metric::Rssi), Some(-97.0));
        assert_eq!(u.heard_at, unix_time(1_700_000_100));
    }

    #[test]
    fn text_packets_do_not_create_entries() {
        let mut table = NodeTable::default();
        let pkt = proto::MeshPacket {
            from: 0x66,
            payload_variant: Some(PayloadVariant::Decoded(proto::Data {
                portnum: PortNum::TextMessageApp as i32,
                payload: b"hi".to_vec(),
                ..Default::default()
            })),
            ..Default::default()
        };
        table.merge_packet(&pkt, Utc::now());
        assert!(table.is_empty());
    }
}
