//! Port-based interpretation of a decoded `Data` message.

use prost::Message;

use super::FrameDiscard;
use crate::model::{unix_time, IdentityReport, PositionReport};
use crate::protobuf::{self as proto, PortNum};
use crate::sensors::MetricSet;

/// The five update shapes the tracker understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// `None` when the report carried no usable coordinates (missing or `(0, 0)`).
    Position(Option<PositionReport>),
    Identity(IdentityReport),
    Telemetry {
        metrics: MetricSet,
        time: Option<chrono::DateTime<chrono::Utc>>,
    },
    Text(String),
    /// Text port whose payload is not UTF-8. The text is lost; the sender was still heard.
    UndecodableText,
    /// Position-only summary from a map report.
    MapReport(Option<PositionReport>),
}

impl Classified {
    pub fn kind(&self) -> &'static str {
        match self {
            Classified::Position(_) => "position",
            Classified::Identity(_) => "nodeinfo",
            Classified::Telemetry { .. } => "telemetry",
            Classified::Text(_) | Classified::UndecodableText => "text",
            Classified::MapReport(_) => "map_report",
        }
    }
}

pub fn classify(data: &proto::Data) -> Result<Classified, FrameDiscard> {
    let port = PortNum::try_from(data.portnum).map_err(|_| FrameDiscard::UnknownPort(data.portnum))?;
    let payload = data.payload.as_slice();
    match port {
        PortNum::TextMessageApp => Ok(String::from_utf8(data.payload.clone())
            .map(Classified::Text)
            .unwrap_or(Classified::UndecodableText)),
        PortNum::PositionApp => {
            let pos = proto::Position::decode(payload).map_err(|_| FrameDiscard::Malformed)?;
            Ok(Classified::Position(position_report(&pos)))
        }
        PortNum::NodeinfoApp => {
            let user = proto::User::decode(payload).map_err(|_| FrameDiscard::Malformed)?;
            Ok(Classified::Identity(identity_report(&user)))
        }
        PortNum::TelemetryApp => {
            let t = proto::Telemetry::decode(payload).map_err(|_| FrameDiscard::Malformed)?;
            let mut metrics = MetricSet::new();
            metrics.add_telemetry(&t);
            Ok(Classified::Telemetry {
                metrics,
                time: unix_time(t.time),
            })
        }
        PortNum::MapReportApp => {
            let report = proto::MapReport::decode(payload).map_err(|_| FrameDiscard::Malformed)?;
            let altitude = (report.altitude != 0).then_some(report.altitude);
            Ok(Classified::MapReport(PositionReport::from_fixed(
                Some(report.latitude_i),
                Some(report.longitude_i),
                altitude,
                0,
            )))
        }
        other => Err(FrameDiscard::UnknownPort(other as i32)),
    }
}

/// Position message to a report; keeps the device's "entered by hand" marker.
pub fn position_report(pos: &proto::Position) -> Option<PositionReport> {
    let time = if pos.time != 0 { pos.time } else { pos.timestamp };
    let mut report = PositionReport::from_fixed(pos.latitude_i, pos.longitude_i, pos.altitude, time)?;
    report.manual_fix = pos.location_source == proto::LOC_MANUAL;
    Some(report)
}

/// User message to an identity report. Empty strings and an unset hardware model are absent.
pub fn identity_report(user: &proto::User) -> IdentityReport {
    let text = |s: &str| {
        let t = s.trim();
        (!t.is_empty()).then(|| t.to_string())
    };
    IdentityReport {
        long_name: text(&user.long_name),
        short_name: text(&user.short_name),
        hw_model: (user.hw_model != 0).then_some(user.hw_model),
        role: Some(user.role),
    }
}
