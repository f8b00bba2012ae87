//! Per-field sensor validity rules.
//!
//! Meshtastic firmware reports "no reading" for most sensor fields as 0 (or a negative
//! value), but a few fields legitimately read 0 (wind from due north, dry soil). Every
//! metric the tracker stores is listed in [`Metric`] together with the predicate that
//! decides whether a reported value is a real reading. Both ingestion paths filter through
//! [`MetricSet::insert_checked`], so the bus and the poller agree on what counts as present.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protobuf as proto;

/// Telemetry category a metric belongs to. Capability flags are tracked per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Device,
    Power,
    Environment,
    AirQuality,
    Radio,
}

/// Predicate applied to a reported value before it is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Presence on the wire is the signal; any finite value is kept.
    Always,
    /// Zero means "not measured".
    NonZero,
    /// Zero and negative values mean "not measured".
    Positive,
    /// Negative values mean "not measured"; zero is a real reading.
    NonNegative,
}

impl Validity {
    pub fn accepts(self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self {
            Validity::Always => true,
            Validity::NonZero => value != 0.0,
            Validity::Positive => value > 0.0,
            Validity::NonNegative => value >= 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Metric {
    // device
    BatteryLevel,
    Voltage,
    ChannelUtilization,
    AirUtilTx,
    UptimeSeconds,
    // power
    Ch1Voltage,
    Ch1Current,
    Ch2Voltage,
    Ch2Current,
    Ch3Voltage,
    Ch3Current,
    // environment
    Temperature,
    RelativeHumidity,
    BarometricPressure,
    GasResistance,
    Iaq,
    Distance,
    Lux,
    WhiteLux,
    IrLux,
    UvLux,
    WindDirection,
    WindSpeed,
    WindGust,
    WindLull,
    Weight,
    Radiation,
    Rainfall1h,
    Rainfall24h,
    SoilMoisture,
    SoilTemperature,
    // air quality
    Pm10Standard,
    Pm25Standard,
    Pm100Standard,
    Co2,
    VocIdx,
    NoxIdx,
    // radio
    Snr,
    Rssi,
    HopsAway,
}

impl Metric {
    pub const ALL: [Metric; 40] = [
        Metric::BatteryLevel,
        Metric::Voltage,
        Metric::ChannelUtilization,
        Metric::AirUtilTx,
        Metric::UptimeSeconds,
        Metric::Ch1Voltage,
        Metric::Ch1Current,
        Metric::Ch2Voltage,
        Metric::Ch2Current,
        Metric::Ch3Voltage,
        Metric::Ch3Current,
        Metric::Temperature,
        Metric::RelativeHumidity,
        Metric::BarometricPressure,
        Metric::GasResistance,
        Metric::Iaq,
        Metric::Distance,
        Metric::Lux,
        Metric::WhiteLux,
        Metric::IrLux,
        Metric::UvLux,
        Metric::WindDirection,
        Metric::WindSpeed,
        Metric::WindGust,
        Metric::WindLull,
        Metric::Weight,
        Metric::Radiation,
        Metric::Rainfall1h,
        Metric::Rainfall24h,
        Metric::SoilMoisture,
        Metric::SoilTemperature,
        Metric::Pm10Standard,
        Metric::Pm25Standard,
        Metric::Pm100Standard,
        Metric::Co2,
        Metric::VocIdx,
        Metric::NoxIdx,
        Metric::Snr,
        Metric::Rssi,
        Metric::HopsAway,
    ];

    pub fn category(self) -> Category {
        use Metric::*;
        match self {
            BatteryLevel | Voltage | ChannelUtilization | AirUtilTx | UptimeSeconds => {
                Category::Device
            }
            Ch1Voltage | Ch1Current | Ch2Voltage | Ch2Current | Ch3Voltage | Ch3Current => {
                Category::Power
            }
            Temperature | RelativeHumidity | BarometricPressure | GasResistance | Iaq
            | Distance | Lux | WhiteLux | IrLux | UvLux | WindDirection | WindSpeed | WindGust
            | WindLull | Weight | Radiation | Rainfall1h | Rainfall24h | SoilMoisture
            | SoilTemperature => Category::Environment,
            Pm10Standard | Pm25Standard | Pm100Standard | Co2 | VocIdx | NoxIdx => {
                Category::AirQuality
            }
            Snr | Rssi | HopsAway => Category::Radio,
        }
    }

    pub fn validity(self) -> Validity {
        use Metric::*;
        match self.category() {
            Category::Device => Validity::Always,
            Category::Power | Category::AirQuality => Validity::Positive,
            Category::Radio => match self {
                HopsAway => Validity::Always,
                _ => Validity::NonZero,
            },
            Category::Environment => match self {
                Temperature | RelativeHumidity | BarometricPressure | SoilTemperature => {
                    Validity::NonZero
                }
                GasResistance | Iaq | Distance | Weight => Validity::Positive,
                _ => Validity::NonNegative,
            },
        }
    }

    pub fn name(self) -> &'static str {
        use Metric::*;
        match self {
            BatteryLevel => "battery_level",
            Voltage => "voltage",
            ChannelUtilization => "channel_utilization",
            AirUtilTx => "air_util_tx",
            UptimeSeconds => "uptime_seconds",
            Ch1Voltage => "ch1_voltage",
            Ch1Current => "ch1_current",
            Ch2Voltage => "ch2_voltage",
            Ch2Current => "ch2_current",
            Ch3Voltage => "ch3_voltage",
            Ch3Current => "ch3_current",
            Temperature => "temperature",
            RelativeHumidity => "relative_humidity",
            BarometricPressure => "barometric_pressure",
            GasResistance => "gas_resistance",
            Iaq => "iaq",
            Distance => "distance",
            Lux => "lux",
            WhiteLux => "white_lux",
            IrLux => "ir_lux",
            UvLux => "uv_lux",
            WindDirection => "wind_direction",
            WindSpeed => "wind_speed",
            WindGust => "wind_gust",
            WindLull => "wind_lull",
            Weight => "weight",
            Radiation => "radiation",
            Rainfall1h => "rainfall_1h",
            Rainfall24h => "rainfall_24h",
            SoilMoisture => "soil_moisture",
            SoilTemperature => "soil_temperature",
            Pm10Standard => "pm10_standard",
            Pm25Standard => "pm25_standard",
            Pm100Standard => "pm100_standard",
            Co2 => "co2",
            VocIdx => "voc_idx",
            NoxIdx => "nox_idx",
            Snr => "snr",
            Rssi => "rssi",
            HopsAway => "hops_away",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metrics that passed their validity rule, keyed by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSet(BTreeMap<Metric, f64>);

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `value` only when the field's validity rule accepts it. Returns whether it was kept.
    pub fn insert_checked(&mut self, metric: Metric, value: Option<f64>) -> bool {
        match value {
            Some(v) if metric.validity().accepts(v) => {
                self.0.insert(metric, v);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.0.get(&metric).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        self.0.iter().map(|(m, v)| (*m, *v))
    }

    pub fn has_category(&self, category: Category) -> bool {
        self.0.keys().any(|m| m.category() == category)
    }

    /// True when at least one sensor (non-radio) reading is present. Radio link metrics
    /// describe the hop to the receiver, not the node's sensors, so they never produce a
    /// telemetry history row on their own.
    pub fn has_sensor_readings(&self) -> bool {
        self.0.keys().any(|m| m.category() != Category::Radio)
    }

    /// Overwrite fields present in `other`; fields absent from `other` are left untouched.
    pub fn merge_from(&mut self, other: &MetricSet) {
        for (m, v) in other.iter() {
            self.0.insert(m, v);
        }
    }

    /// Subset holding only non-radio readings.
    pub fn sensor_readings(&self) -> MetricSet {
        MetricSet(
            self.0
                .iter()
                .filter(|(m, _)| m.category() != Category::Radio)
                .map(|(m, v)| (*m, *v))
                .collect(),
        )
    }

    pub fn add_device(&mut self, dm: &proto::DeviceMetrics) {
        self.insert_checked(Metric::BatteryLevel, dm.battery_level.map(f64::from));
        self.insert_checked(Metric::Voltage, dm.voltage.map(f64::from));
        self.insert_checked(Metric::ChannelUtilization, dm.channel_utilization.map(f64::from));
        self.insert_checked(Metric::AirUtilTx, dm.air_util_tx.map(f64::from));
        self.insert_checked(Metric::UptimeSeconds, dm.uptime_seconds.map(f64::from));
    }

    pub fn add_power(&mut self, pm: &proto::PowerMetrics) {
        self.insert_checked(Metric::Ch1Voltage, pm.ch1_voltage.map(f64::from));
        self.insert_checked(Metric::Ch1Current, pm.ch1_current.map(f64::from));
        self.insert_checked(Metric::Ch2Voltage, pm.ch2_voltage.map(f64::from));
        self.insert_checked(Metric::Ch2Current, pm.ch2_current.map(f64::from));
        self.insert_checked(Metric::Ch3Voltage, pm.ch3_voltage.map(f64::from));
        self.insert_checked(Metric::Ch3Current, pm.ch3_current.map(f64::from));
    }

    pub fn add_environment(&mut self, em: &proto::EnvironmentMetrics) {
        let f = |v: Option<f32>| v.map(f64::from);
        let u = |v: Option<u32>| v.map(f64::from);
        self.insert_checked(Metric::Temperature, f(em.temperature));
        self.insert_checked(Metric::RelativeHumidity, f(em.relative_humidity));
        self.insert_checked(Metric::BarometricPressure, f(em.barometric_pressure));
        self.insert_checked(Metric::GasResistance, f(em.gas_resistance));
        self.insert_checked(Metric::Iaq, u(em.iaq));
        self.insert_checked(Metric::Distance, f(em.distance));
        self.insert_checked(Metric::Lux, f(em.lux));
        self.insert_checked(Metric::WhiteLux, f(em.white_lux));
        self.insert_checked(Metric::IrLux, f(em.ir_lux));
        self.insert_checked(Metric::UvLux, f(em.uv_lux));
        self.insert_checked(Metric::WindDirection, u(em.wind_direction));
        self.insert_checked(Metric::WindSpeed, f(em.wind_speed));
        self.insert_checked(Metric::WindGust, f(em.wind_gust));
        self.insert_checked(Metric::WindLull, f(em.wind_lull));
        self.insert_checked(Metric::Weight, f(em.weight));
        self.insert_checked(Metric::Radiation, f(em.radiation));
        self.insert_checked(Metric::Rainfall1h, f(em.rainfall_1h));
        self.insert_checked(Metric::Rainfall24h, f(em.rainfall_24h));
        self.insert_checked(Metric::SoilMoisture, u(em.soil_moisture));
        self.insert_checked(Metric::SoilTemperature, f(em.soil_temperature));
    }

    pub fn add_air_quality(&mut self, aq: &proto::AirQualityMetrics) {
        self.insert_checked(Metric::Pm10Standard, aq.pm10_standard.map(f64::from));
        self.insert_checked(Metric::Pm25Standard, aq.pm25_standard.map(f64::from));
        self.insert_checked(Metric::Pm100Standard, aq.pm100_standard.map(f64::from));
        self.insert_checked(Metric::Co2, aq.co2.map(f64::from));
        self.insert_checked(Metric::VocIdx, aq.pm_voc_idx.map(f64::from));
        self.insert_checked(Metric::NoxIdx, aq.pm_nox_idx.map(f64::from));
    }

    /// Fold a telemetry packet into the set, whichever variant it carries.
    pub fn add_telemetry(&mut self, t: &proto::Telemetry) {
        use proto::telemetry::Variant;
        match &t.variant {
            Some(Variant::DeviceMetrics(dm)) => self.add_device(dm),
            Some(Variant::EnvironmentMetrics(em)) => self.add_environment(em),
            Some(Variant::AirQualityMetrics(aq)) => self.add_air_quality(aq),
            Some(Variant::PowerMetrics(pm)) => self.add_power(pm),
            None => {}
        }
    }
}
