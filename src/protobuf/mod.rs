//! Meshtastic protobuf messages
//!
//! Only the subset of the Meshtastic schema that the tracker reads is declared here, with
//! field tags matching the upstream `.proto` files so frames from real radios and gateways
//! decode unchanged. Unknown fields are skipped by prost on decode.
//!
//! Enum-typed fields that the tracker only stores or renders (hardware model, role, region,
//! location source) are kept as raw `i32` so that values newer than this schema survive.

/// Application port numbers carried in [`Data::portnum`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    UnknownApp = 0,
    TextMessageApp = 1,
    RemoteHardwareApp = 2,
    PositionApp = 3,
    NodeinfoApp = 4,
    RoutingApp = 5,
    AdminApp = 6,
    TextMessageCompressedApp = 7,
    WaypointApp = 8,
    AudioApp = 9,
    DetectionSensorApp = 10,
    ReplyApp = 32,
    IpTunnelApp = 33,
    PaxcounterApp = 34,
    SerialApp = 64,
    StoreForwardApp = 65,
    RangeTestApp = 66,
    TelemetryApp = 67,
    ZpsApp = 68,
    SimulatorApp = 69,
    TracerouteApp = 70,
    NeighborinfoApp = 71,
    AtakPlugin = 72,
    MapReportApp = 73,
    PowerstressApp = 74,
    PrivateApp = 256,
    AtakForwarder = 257,
    Max = 511,
}

/// MQTT envelope wrapping one mesh packet as published by a gateway.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceEnvelope {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    #[prost(string, tag = "2")]
    pub channel_id: String,
    #[prost(string, tag = "3")]
    pub gateway_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: Option<mesh_packet::PayloadVariant>,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(int32, tag = "11")]
    pub priority: i32,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    #[prost(bool, tag = "14")]
    pub via_mqtt: bool,
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
}

pub mod mesh_packet {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        #[prost(bytes, tag = "5")]
        Encrypted(Vec<u8>),
    }
}

/// Decoded application payload of a mesh packet.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
    #[prost(fixed32, tag = "8")]
    pub emoji: u32,
    #[prost(uint32, optional, tag = "9")]
    pub bitfield: Option<u32>,
}

/// `Position.location_source` value for a position entered by hand on the device.
pub const LOC_MANUAL: i32 = 1;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Position {
    #[prost(sfixed32, optional, tag = "1")]
    pub latitude_i: Option<i32>,
    #[prost(sfixed32, optional, tag = "2")]
    pub longitude_i: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub altitude: Option<i32>,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
    #[prost(int32, tag = "5")]
    pub location_source: i32,
    #[prost(int32, tag = "6")]
    pub altitude_source: i32,
    #[prost(fixed32, tag = "7")]
    pub timestamp: u32,
    #[prost(sint32, optional, tag = "9")]
    pub altitude_hae: Option<i32>,
    #[prost(uint32, tag = "19")]
    pub sats_in_view: u32,
    #[prost(uint32, tag = "23")]
    pub precision_bits: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(bytes = "vec", tag = "4")]
    pub macaddr: Vec<u8>,
    #[prost(int32, tag = "5")]
    pub hw_model: i32,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
    #[prost(int32, tag = "7")]
    pub role: i32,
    #[prost(bytes = "vec", tag = "8")]
    pub public_key: Vec<u8>,
}

/// Entry of a device's node database, pushed during the config handshake.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeInfo {
    #[prost(uint32, tag = "1")]
    pub num: u32,
    #[prost(message, optional, tag = "2")]
    pub user: Option<User>,
    #[prost(message, optional, tag = "3")]
    pub position: Option<Position>,
    #[prost(float, tag = "4")]
    pub snr: f32,
    #[prost(fixed32, tag = "5")]
    pub last_heard: u32,
    #[prost(message, optional, tag = "6")]
    pub device_metrics: Option<DeviceMetrics>,
    #[prost(uint32, tag = "7")]
    pub channel: u32,
    #[prost(bool, tag = "8")]
    pub via_mqtt: bool,
    #[prost(uint32, optional, tag = "9")]
    pub hops_away: Option<u32>,
    #[prost(bool, tag = "10")]
    pub is_favorite: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MyNodeInfo {
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
    #[prost(uint32, tag = "8")]
    pub reboot_count: u32,
    #[prost(uint32, tag = "11")]
    pub min_app_version: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FromRadio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(oneof = "from_radio::PayloadVariant", tags = "2, 3, 4, 5, 7, 8")]
    pub payload_variant: Option<from_radio::PayloadVariant>,
}

pub mod from_radio {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "2")]
        Packet(super::MeshPacket),
        #[prost(message, tag = "3")]
        MyInfo(super::MyNodeInfo),
        #[prost(message, tag = "4")]
        NodeInfo(super::NodeInfo),
        #[prost(message, tag = "5")]
        Config(super::Config),
        #[prost(uint32, tag = "7")]
        ConfigCompleteId(u32),
        #[prost(bool, tag = "8")]
        Rebooted(bool),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToRadio {
    #[prost(oneof = "to_radio::PayloadVariant", tags = "1, 3, 4, 7")]
    pub payload_variant: Option<to_radio::PayloadVariant>,
}

pub mod to_radio {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "1")]
        Packet(super::MeshPacket),
        #[prost(uint32, tag = "3")]
        WantConfigId(u32),
        #[prost(bool, tag = "4")]
        Disconnect(bool),
        #[prost(message, tag = "7")]
        Heartbeat(super::Heartbeat),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Heartbeat {
    #[prost(uint32, tag = "1")]
    pub nonce: u32,
}

/// Device configuration sections pushed during the config handshake.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Config {
    #[prost(oneof = "config::PayloadVariant", tags = "2, 6")]
    pub payload_variant: Option<config::PayloadVariant>,
}

pub mod config {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "2")]
        Position(PositionConfig),
        #[prost(message, tag = "6")]
        Lora(LoRaConfig),
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PositionConfig {
        #[prost(uint32, tag = "1")]
        pub position_broadcast_secs: u32,
        #[prost(bool, tag = "2")]
        pub position_broadcast_smart_enabled: bool,
        #[prost(bool, tag = "3")]
        pub fixed_position: bool,
        #[prost(bool, tag = "4")]
        pub gps_enabled: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct LoRaConfig {
        #[prost(bool, tag = "1")]
        pub use_preset: bool,
        #[prost(int32, tag = "2")]
        pub modem_preset: i32,
        #[prost(int32, tag = "7")]
        pub region: i32,
        #[prost(uint32, tag = "8")]
        pub hop_limit: u32,
        #[prost(bool, tag = "9")]
        pub tx_enabled: bool,
        #[prost(int32, tag = "10")]
        pub tx_power: i32,
        #[prost(uint32, tag = "11")]
        pub channel_num: u32,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Telemetry {
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(oneof = "telemetry::Variant", tags = "2, 3, 4, 5")]
    pub variant: Option<telemetry::Variant>,
}

pub mod telemetry {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "2")]
        DeviceMetrics(super::DeviceMetrics),
        #[prost(message, tag = "3")]
        EnvironmentMetrics(super::EnvironmentMetrics),
        #[prost(message, tag = "4")]
        AirQualityMetrics(super::AirQualityMetrics),
        #[prost(message, tag = "5")]
        PowerMetrics(super::PowerMetrics),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceMetrics {
    #[prost(uint32, optional, tag = "1")]
    pub battery_level: Option<u32>,
    #[prost(float, optional, tag = "2")]
    pub voltage: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub channel_utilization: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub air_util_tx: Option<f32>,
    #[prost(uint32, optional, tag = "5")]
    pub uptime_seconds: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvironmentMetrics {
    #[prost(float, optional, tag = "1")]
    pub temperature: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub relative_humidity: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub barometric_pressure: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub gas_resistance: Option<f32>,
    #[prost(float, optional, tag = "5")]
    pub voltage: Option<f32>,
    #[prost(float, optional, tag = "6")]
    pub current: Option<f32>,
    #[prost(uint32, optional, tag = "7")]
    pub iaq: Option<u32>,
    #[prost(float, optional, tag = "8")]
    pub distance: Option<f32>,
    #[prost(float, optional, tag = "9")]
    pub lux: Option<f32>,
    #[prost(float, optional, tag = "10")]
    pub white_lux: Option<f32>,
    #[prost(float, optional, tag = "11")]
    pub ir_lux: Option<f32>,
    #[prost(float, optional, tag = "12")]
    pub uv_lux: Option<f32>,
    #[prost(uint32, optional, tag = "13")]
    pub wind_direction: Option<u32>,
    #[prost(float, optional, tag = "14")]
    pub wind_speed: Option<f32>,
    #[prost(float, optional, tag = "15")]
    pub weight: Option<f32>,
    #[prost(float, optional, tag = "16")]
    pub wind_gust: Option<f32>,
    #[prost(float, optional, tag = "17")]
    pub wind_lull: Option<f32>,
    #[prost(float, optional, tag = "18")]
    pub radiation: Option<f32>,
    #[prost(float, optional, tag = "19")]
    pub rainfall_1h: Option<f32>,
    #[prost(float, optional, tag = "20")]
    pub rainfall_24h: Option<f32>,
    #[prost(uint32, optional, tag = "21")]
    pub soil_moisture: Option<u32>,
    #[prost(float, optional, tag = "22")]
    pub soil_temperature: Option<f32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PowerMetrics {
    #[prost(float, optional, tag = "1")]
    pub ch1_voltage: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub ch1_current: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub ch2_voltage: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub ch2_current: Option<f32>,
    #[prost(float, optional, tag = "5")]
    pub ch3_voltage: Option<f32>,
    #[prost(float, optional, tag = "6")]
    pub ch3_current: Option<f32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AirQualityMetrics {
    #[prost(uint32, optional, tag = "1")]
    pub pm10_standard: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub pm25_standard: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub pm100_standard: Option<u32>,
    #[prost(uint32, optional, tag = "13")]
    pub co2: Option<u32>,
    #[prost(float, optional, tag = "23")]
    pub pm_voc_idx: Option<f32>,
    #[prost(float, optional, tag = "24")]
    pub pm_nox_idx: Option<f32>,
}

/// Periodic summary a node publishes to the public map topic. Only its position is used.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MapReport {
    #[prost(string, tag = "1")]
    pub long_name: String,
    #[prost(string, tag = "2")]
    pub short_name: String,
    #[prost(int32, tag = "3")]
    pub role: i32,
    #[prost(int32, tag = "4")]
    pub hw_model: i32,
    #[prost(string, tag = "5")]
    pub firmware_version: String,
    #[prost(int32, tag = "6")]
    pub region: i32,
    #[prost(int32, tag = "7")]
    pub modem_preset: i32,
    #[prost(bool, tag = "8")]
    pub has_default_channel: bool,
    #[prost(sfixed32, tag = "9")]
    pub latitude_i: i32,
    #[prost(sfixed32, tag = "10")]
    pub longitude_i: i32,
    #[prost(int32, tag = "11")]
    pub altitude: i32,
    #[prost(uint32, tag = "12")]
    pub position_precision: u32,
    #[prost(uint32, tag = "13")]
    pub num_online_local_nodes: u32,
}
