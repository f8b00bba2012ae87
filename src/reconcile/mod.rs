//! # Node reconciliation
//!
//! [`merge`] folds one [`NodeUpdate`] into the current [`NodeRecord`] and decides which history
//! rows the update produces. It is pure; the store runs it inside the write transaction.
//!
//! Field rules:
//!
//! - identity and metrics: update-if-present, per field
//! - `last_heard` and the contact timestamps: never move backwards
//! - `source` / `source_interface`: once `radio`, bus updates leave them alone
//! - capability flags: monotonic OR
//! - position: see [`PositionDecision`]; the manual override slot is never touched here

use chrono::{DateTime, Utc};
use log::trace;

use crate::model::{
    Channel, NodeRecord, NodeSource, NodeUpdate, PositionReport, PositionSample, PositionSource,
    Provenance, ReportedPosition, TelemetryReading, POSITION_SCHEMA_VERSION,
    TELEMETRY_SCHEMA_VERSION,
};
use crate::sensors::Category;

/// Coordinates closer than this on both axes (about 11 m) are treated as the same fix.
pub const POSITION_EPSILON_DEG: f64 = 0.0001;

/// Outcome of the position acceptance gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionDecision {
    /// Update carried no position.
    Absent,
    /// Stored position is a fixed self-report and this sender is someone else.
    RejectedFixed,
    /// Within [`POSITION_EPSILON_DEG`] of the stored position.
    RejectedJitter,
    /// Same coordinates, but the device now reports them as fixed; only the tag changed.
    SourceUpgraded,
    Accepted,
}

impl PositionDecision {
    /// `None` when no position was offered, otherwise whether it was taken.
    pub fn accepted(self) -> Option<bool> {
        match self {
            PositionDecision::Absent => None,
            PositionDecision::Accepted | PositionDecision::SourceUpgraded => Some(true),
            PositionDecision::RejectedFixed | PositionDecision::RejectedJitter => Some(false),
        }
    }
}

/// Merged record plus the history rows to append with it.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub record: NodeRecord,
    pub created: bool,
    pub position: PositionDecision,
    pub position_sample: Option<PositionSample>,
    pub telemetry: Option<TelemetryReading>,
}

pub fn merge(existing: Option<NodeRecord>, update: &NodeUpdate, prov: &Provenance) -> MergeOutcome {
    let now = prov.received_at;
    let created = existing.is_none();
    let mut record = existing.unwrap_or_else(|| {
        let source = match prov.channel {
            Channel::Poll => NodeSource::Radio,
            Channel::Bus => NodeSource::Mqtt,
        };
        NodeRecord::new(update.node_id, source, &prov.interface, now)
    });

    apply_identity(&mut record, update);
    record.metrics.merge_from(&update.metrics);

    advance(&mut record.last_heard, update.heard_at);
    match prov.channel {
        Channel::Bus => {
            advance(&mut record.last_mqtt_contact, Some(now));
            if record.source != NodeSource::Radio {
                record.source = NodeSource::Mqtt;
                record.source_interface = prov.interface.clone();
            }
        }
        Channel::Poll => {
            let contact = update
                .heard_at
                .or_else(|| prov.self_report.then_some(now));
            advance(&mut record.last_radio_contact, contact);
            record.source = NodeSource::Radio;
            record.source_interface = prov.interface.clone();
            if prov.region.is_some() {
                record.region = prov.region.clone();
            }
        }
    }

    let (position, position_sample) = match &update.position {
        None => (PositionDecision::Absent, None),
        Some(report) => gate_position(&mut record, report, prov),
    };

    let sensors = update.metrics.sensor_readings();
    let telemetry = if sensors.is_empty() {
        None
    } else {
        let power = sensors.has_category(Category::Power);
        let environment = sensors.has_category(Category::Environment);
        let air_quality = sensors.has_category(Category::AirQuality);
        record.has_power_sensor |= power;
        record.has_environment_sensor |= environment;
        record.has_air_quality_sensor |= air_quality;
        Some(TelemetryReading {
            schema_version: TELEMETRY_SCHEMA_VERSION,
            node_id: update.node_id,
            timestamp: now,
            metrics: sensors,
            has_power_metrics: power,
            has_environment_metrics: environment,
            has_air_quality_metrics: air_quality,
        })
    };

    record.last_updated = now;
    MergeOutcome {
        record,
        created,
        position,
        position_sample,
        telemetry,
    }
}

fn apply_identity(record: &mut NodeRecord, update: &NodeUpdate) {
    let id = &update.identity;
    if let Some(v) = &id.long_name {
        record.long_name = Some(v.clone());
    }
    if let Some(v) = &id.short_name {
        record.short_name = Some(v.clone());
    }
    if id.hw_model.is_some() {
        record.hw_model = id.hw_model;
    }
    if id.role.is_some() {
        record.role = id.role;
    }
}

/// Move `slot` forward to `candidate`, never backwards.
fn advance(slot: &mut Option<DateTime<Utc>>, candidate: Option<DateTime<Utc>>) {
    if let Some(c) = candidate {
        if slot.map_or(true, |cur| c >= cur) {
            *slot = Some(c);
        }
    }
}

/// Source tag a report earns if accepted.
pub fn incoming_source(report: &PositionReport, prov: &Provenance) -> PositionSource {
    match prov.channel {
        Channel::Bus => PositionSource::Mqtt,
        Channel::Poll if prov.self_report && (prov.device_fixed_position || report.manual_fix) => {
            PositionSource::Fixed
        }
        Channel::Poll => PositionSource::Gps,
    }
}

fn gate_position(
    record: &mut NodeRecord,
    report: &PositionReport,
    prov: &Provenance,
) -> (PositionDecision, Option<PositionSample>) {
    let source = incoming_source(report, prov);

    if let Some(current) = &mut record.position {
        if current.source == PositionSource::Fixed && !prov.self_report {
            trace!("{}: fixed position kept over third-party report", record.node_id);
            return (PositionDecision::RejectedFixed, None);
        }
        let same_spot = (current.latitude - report.latitude).abs() < POSITION_EPSILON_DEG
            && (current.longitude - report.longitude).abs() < POSITION_EPSILON_DEG;
        if same_spot {
            if source == PositionSource::Fixed && current.source != PositionSource::Fixed {
                current.source = PositionSource::Fixed;
                return (PositionDecision::SourceUpgraded, None);
            }
            return (PositionDecision::RejectedJitter, None);
        }
    }

    record.position = Some(ReportedPosition {
        latitude: report.latitude,
        longitude: report.longitude,
        altitude: report.altitude,
        source,
        time: report.time,
    });
    let sample = PositionSample {
        schema_version: POSITION_SCHEMA_VERSION,
        node_id: record.node_id,
        timestamp: prov.received_at,
        latitude: report.latitude,
        longitude: report.longitude,
        altitude: report.altitude.map(f64::from),
        source,
    };
    (PositionDecision::Accepted, Some(sample))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IdentityReport, NodeId};
    use crate::sensors::Metric;
    use chrono::Duration;

    fn pos(lat: f64, lon: f64) -> PositionReport {
        PositionReport {
            latitude: lat,
            longitude: lon,
            altitude: Some(100),
            time: None,
            manual_fix: false,
        }
    }

    fn update_with_position(lat: f64, lon: f64) -> NodeUpdate {
        let mut u = NodeUpdate::new(NodeId(0x42));
        u.position = Some(pos(lat, lon));
        u
    }

    fn self_poll(now: DateTime<Utc>) -> Provenance {
        let mut p = Provenance::poll("/dev/ttyUSB0", now);
        p.self_report = true;
        p.device_fixed_position = true;
        p
    }

    #[test]
    fn first_bus_update_creates_mqtt_record() {
        let now = Utc::now();
        let mut u = update_with_position(10.0, 20.0);
        u.heard_at = Some(now);
        let out = merge(None, &u, &Provenance::bus("msh/US/2/e/LongFast", now));
        assert!(out.created);
        assert_eq!(out.record.source, NodeSource::Mqtt);
        assert_eq!(out.record.source_interface, "msh/US/2/e/LongFast");
        assert_eq!(out.position, PositionDecision::Accepted);
        assert_eq!(out.position_sample.unwrap().source, PositionSource::Mqtt);
        assert_eq!(out.record.last_mqtt_contact, Some(now));
        assert!(out.telemetry.is_none());
    }

    #[test]
    fn fixed_self_report_is_immune_to_third_parties() {
        let now = Utc::now();
        let fixed = merge(None, &update_with_position(10.0, 20.0), &self_poll(now)).record;
        assert_eq!(fixed.position.as_ref().unwrap().source, PositionSource::Fixed);

        let mut third = Provenance::poll("10.0.0.5:4403", now);
        third.self_report = false;
        let out = merge(Some(fixed.clone()), &update_with_position(11.0, 21.0), &third);
        assert_eq!(out.position, PositionDecision::RejectedFixed);
        assert_eq!(out.record.position, fixed.position);

        let out = merge(
            Some(fixed.clone()),
            &update_with_position(12.0, 22.0),
            &Provenance::bus("msh/x", now),
        );
        assert_eq!(out.position, PositionDecision::RejectedFixed);
        assert!(out.position_sample.is_none());
    }

    #[test]
    fn fixed_owner_can_still_move_itself() {
        let now = Utc::now();
        let fixed = merge(None, &update_with_position(10.0, 20.0), &self_poll(now)).record;
        let out = merge(Some(fixed), &update_with_position(10.5, 20.0), &self_poll(now));
        assert_eq!(out.position, PositionDecision::Accepted);
    }

    #[test]
    fn jitter_is_not_a_new_sample_but_identity_applies() {
        let now = Utc::now();
        let base = merge(None, &update_with_position(10.0, 20.0), &Provenance::bus("t", now)).record;
        let mut u = update_with_position(10.00005, 20.00009);
        u.identity = IdentityReport {
            long_name: Some("Ridge Repeater".into()),
            ..Default::default()
        };
        u.metrics.insert_checked(Metric::Voltage, Some(4.1));
        let out = merge(Some(base), &u, &Provenance::bus("t", now));
        assert_eq!(out.position, PositionDecision::RejectedJitter);
        assert!(out.position_sample.is_none());
        assert_eq!(out.record.long_name.as_deref(), Some("Ridge Repeater"));
        assert!(out.telemetry.is_some());
        assert!((out.record.position.unwrap().latitude - 10.0).abs() < 1e-12);
    }

    #[test]
    fn self_report_upgrades_tag_without_new_sample() {
        let now = Utc::now();
        let gps = merge(
            None,
            &update_with_position(10.0, 20.0),
            &Provenance::poll("dev", now),
        )
        .record;
        assert_eq!(gps.position.as_ref().unwrap().source, PositionSource::Gps);
        let out = merge(Some(gps), &update_with_position(10.0, 20.0), &self_poll(now));
        assert_eq!(out.position, PositionDecision::SourceUpgraded);
        assert_eq!(out.record.position.unwrap().source, PositionSource::Fixed);
        assert!(out.position_sample.is_none());
    }

    #[test]
    fn radio_source_is_sticky() {
        let now = Utc::now();
        let radio = merge(None, &NodeUpdate::new(NodeId(1)), &Provenance::poll("dev0", now)).record;
        let out = merge(Some(radio), &NodeUpdate::new(NodeId(1)), &Provenance::bus("msh/x", now));
        assert_eq!(out.record.source, NodeSource::Radio);
        assert_eq!(out.record.source_interface, "dev0");
        assert_eq!(out.record.last_mqtt_contact, Some(now));
    }

    #[test]
    fn last_heard_is_monotonic_in_either_order() {
        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(90);
        let at = |t| {
            let mut u = NodeUpdate::new(NodeId(5));
            u.heard_at = Some(t);
            u
        };
        let prov = Provenance::poll("dev", t2);
        let a = merge(None, &at(t1), &prov).record;
        let a = merge(Some(a), &at(t2), &prov).record;
        let b = merge(None, &at(t2), &prov).record;
        let b = merge(Some(b), &at(t1), &prov).record;
        assert_eq!(a.last_heard, Some(t2));
        assert_eq!(b.last_heard, Some(t2));
        assert_eq!(b.last_radio_contact, Some(t2));
    }

    #[test]
    fn capability_flags_only_ever_turn_on() {
        let now = Utc::now();
        let mut u = NodeUpdate::new(NodeId(9));
        u.metrics.insert_checked(Metric::Ch1Voltage, Some(12.6));
        let rec = merge(None, &u, &Provenance::bus("t", now)).record;
        assert!(rec.has_power_sensor);

        let mut env = NodeUpdate::new(NodeId(9));
        env.metrics.insert_checked(Metric::Temperature, Some(18.0));
        let out = merge(Some(rec), &env, &Provenance::bus("t", now));
        assert!(out.record.has_power_sensor);
        assert!(out.record.has_environment_sensor);
        let reading = out.telemetry.unwrap();
        assert!(reading.has_environment_metrics);
        assert!(!reading.has_power_metrics);
    }

    #[test]
    fn absent_fields_leave_existing_values() {
        let now = Utc::now();
        let mut u = NodeUpdate::new(NodeId(3));
        u.identity.long_name = Some("Alpha".into());
        u.identity.hw_model = Some(43);
        u.metrics.insert_checked(Metric::BatteryLevel, Some(88.0));
        let rec = merge(None, &u, &Provenance::bus("t", now)).record;

        let mut later = NodeUpdate::new(NodeId(3));
        later.identity.short_name = Some("ALP".into());
        let rec = merge(Some(rec), &later, &Provenance::bus("t", now)).record;
        assert_eq!(rec.long_name.as_deref(), Some("Alpha"));
        assert_eq!(rec.short_name.as_deref(), Some("ALP"));
        assert_eq!(rec.hw_model, Some(43));
        assert_eq!(rec.metrics.get(Metric::BatteryLevel), Some(88.0));
    }

    #[test]
    fn radio_only_metrics_do_not_produce_telemetry_rows() {
        let now = Utc::now();
        let mut u = NodeUpdate::new(NodeId(4));
        u.metrics.insert_checked(Metric::Snr, Some(3.0));
        let out = merge(None, &u, &Provenance::bus("t", now));
        assert!(out.telemetry.is_none());
        assert_eq!(out.record.metrics.get(Metric::Snr), Some(3.0));
    }
}
