//! # Configuration
//!
//! One TOML file, every field defaulted, validated on load. Sections:
//!
//! - [`StoreConfig`] - where the sled database lives
//! - [`LoggingConfig`] - level and log files
//! - [`MqttConfig`] - broker connection for the bus path
//! - [`DecryptionConfig`] - channel keys
//! - [`DevicesConfig`] - discovery, polling and failover tuning
//! - [`StalenessConfig`] - `last_heard` age thresholds for node status
//!
//! ```toml
//! [store]
//! data_dir = "./data"
//!
//! [mqtt]
//! enabled = true
//! host = "localhost"
//! port = 1883
//! username = "meshtracking"
//! password_file = "/etc/meshtrack/secrets"
//!
//! [decryption]
//! default_key = "default"
//! [decryption.channel_keys]
//! Ops = "0123456789abcdef0123456789abcdef"
//!
//! [devices]
//! poll_interval_secs = 300
//! manual_networks = ["192.168.10.0/24"]
//! ```
//!
//! The MQTT password is never required in the file: it may come from the environment
//! (`MESHTRACK_MQTT_PASSWORD`) or from a `KEY=VALUE` secrets file (key `MQTT_PASSWORD`).

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::ingest::crypto::{ChannelKey, KeyError, KeyTable};
use crate::model::NodeStatus;

pub const PASSWORD_ENV: &str = "MESHTRACK_MQTT_PASSWORD";
pub const PASSWORD_FILE_KEY: &str = "MQTT_PASSWORD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("missing required secret: {0}")]
    MissingSecret(&'static str),
    #[error("bad key for channel '{channel}': {source}")]
    BadKey {
        channel: String,
        #[source]
        source: KeyError,
    },
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub decryption: DecryptionConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub staleness: StalenessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
    /// Separate file for credential and key related warnings.
    #[serde(default)]
    pub security_file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: Some("meshtrack.log".to_string()),
            security_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_mqtt_username")]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_file: Option<String>,
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Bound of the transport-to-consumer queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_true() -> bool {
    true
}
fn default_mqtt_host() -> String {
    "localhost".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_mqtt_username() -> String {
    "meshtracking".to_string()
}
fn default_topics() -> Vec<String> {
    vec!["msh/#".to_string()]
}
fn default_client_id_prefix() -> String {
    "meshtrack".to_string()
}
fn default_keep_alive() -> u64 {
    30
}
fn default_queue_capacity() -> usize {
    1024
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: default_mqtt_username(),
            password: None,
            password_file: None,
            topics: default_topics(),
            client_id_prefix: default_client_id_prefix(),
            keep_alive_secs: default_keep_alive(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl MqttConfig {
    /// Resolve the broker password: environment, then inline value, then secrets file.
    pub async fn resolve_password(&self) -> Result<String, ConfigError> {
        self.resolve_password_with(std::env::var(PASSWORD_ENV).ok())
            .await
    }

    pub async fn resolve_password_with(&self, env: Option<String>) -> Result<String, ConfigError> {
        if let Some(p) = env.filter(|p| !p.is_empty()) {
            return Ok(p);
        }
        if let Some(p) = self.password.as_deref().filter(|p| !p.is_empty()) {
            return Ok(p.to_string());
        }
        if let Some(path) = &self.password_file {
            let content = fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
            if let Some(p) = secrets_lookup(&content, PASSWORD_FILE_KEY) {
                return Ok(p);
            }
        }
        Err(ConfigError::MissingSecret("MQTT password"))
    }
}

/// Value of `key` in a `KEY=VALUE` file. `#` lines are comments; surrounding quotes are stripped.
pub fn secrets_lookup(content: &str, key: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptionConfig {
    /// Key tried for channels without an entry below. `"none"` or `""` disables the fallback.
    #[serde(default = "default_key_name")]
    pub default_key: Option<String>,
    /// `channel_id` to key (`default`, `simpleN` or 32 hex characters).
    #[serde(default)]
    pub channel_keys: BTreeMap<String, String>,
}

fn default_key_name() -> Option<String> {
    Some("default".to_string())
}

impl Default for DecryptionConfig {
    fn default() -> Self {
        Self {
            default_key: default_key_name(),
            channel_keys: BTreeMap::new(),
        }
    }
}

impl DecryptionConfig {
    pub fn key_table(&self) -> Result<KeyTable, ConfigError> {
        let fallback = match self.default_key.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() && !value.eq_ignore_ascii_case("none") => {
                Some(ChannelKey::parse(value).map_err(|source| ConfigError::BadKey {
                    channel: "*".to_string(),
                    source,
                })?)
            }
            _ => None,
        };
        let mut table = KeyTable::new(fallback);
        for (channel, value) in &self.channel_keys {
            let key = ChannelKey::parse(value).map_err(|source| ConfigError::BadKey {
                channel: channel.clone(),
                source,
            })?;
            table.insert(channel, key);
        }
        Ok(table)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
    /// Devices are dropped from the registry once their failure count reaches this.
    #[serde(default = "default_max_fail")]
    pub max_fail_count: u32,
    /// Failures of the primary within a cycle that trigger immediate re-election.
    #[serde(default = "default_failover_threshold")]
    pub primary_failover_threshold: u32,
    /// Standby devices are polled once every this many cycles.
    #[serde(default = "default_standby_divisor")]
    pub standby_poll_divisor: u32,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_true")]
    pub usb_enabled: bool,
    #[serde(default = "default_true")]
    pub scan_enabled: bool,
    #[serde(default = "default_true")]
    pub auto_detect_networks: bool,
    /// Extra CIDR ranges to sweep, e.g. `192.168.10.0/24`.
    #[serde(default)]
    pub manual_networks: Vec<String>,
    /// JSON file of hand-registered devices, re-read every polling cycle.
    #[serde(default = "default_manual_registry")]
    pub manual_registry: String,
    #[serde(default = "default_serial_baud")]
    pub serial_baud: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Upper bound for one complete node-table download.
    #[serde(default = "default_config_timeout")]
    pub config_timeout_secs: u64,
    #[serde(default = "default_connect_check_timeout")]
    pub connect_check_timeout_ms: u64,
    #[serde(default = "default_nmap_timeout")]
    pub nmap_timeout_secs: u64,
}

fn default_discovery_interval() -> u64 {
    60
}
fn default_poll_interval() -> u64 {
    300
}
fn default_status_interval() -> u64 {
    60
}
fn default_max_fail() -> u32 {
    10
}
fn default_failover_threshold() -> u32 {
    3
}
fn default_standby_divisor() -> u32 {
    5
}
fn default_tcp_port() -> u16 {
    4403
}
fn default_manual_registry() -> String {
    "./data/manual_devices.json".to_string()
}
fn default_serial_baud() -> u32 {
    115_200
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_config_timeout() -> u64 {
    60
}
fn default_connect_check_timeout() -> u64 {
    2000
}
fn default_nmap_timeout() -> u64 {
    30
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            discovery_interval_secs: default_discovery_interval(),
            poll_interval_secs: default_poll_interval(),
            status_interval_secs: default_status_interval(),
            max_fail_count: default_max_fail(),
            primary_failover_threshold: default_failover_threshold(),
            standby_poll_divisor: default_standby_divisor(),
            tcp_port: default_tcp_port(),
            usb_enabled: true,
            scan_enabled: true,
            auto_detect_networks: true,
            manual_networks: Vec::new(),
            manual_registry: default_manual_registry(),
            serial_baud: default_serial_baud(),
            connect_timeout_secs: default_connect_timeout(),
            config_timeout_secs: default_config_timeout(),
            connect_check_timeout_ms: default_connect_check_timeout(),
            nmap_timeout_secs: default_nmap_timeout(),
        }
    }
}

/// `last_heard` age thresholds, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessConfig {
    #[serde(default = "default_online_secs")]
    pub online_secs: i64,
    #[serde(default = "default_recent_secs")]
    pub recent_secs: i64,
    #[serde(default = "default_offline_secs")]
    pub offline_secs: i64,
}

fn default_online_secs() -> i64 {
    30 * 60
}
fn default_recent_secs() -> i64 {
    2 * 3600
}
fn default_offline_secs() -> i64 {
    14 * 86_400
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            online_secs: default_online_secs(),
            recent_secs: default_recent_secs(),
            offline_secs: default_offline_secs(),
        }
    }
}

impl StalenessConfig {
    pub fn status_for(&self, last_heard: Option<DateTime<Utc>>, now: DateTime<Utc>) -> NodeStatus {
        let Some(heard) = last_heard else {
            return NodeStatus::Unknown;
        };
        // clock skew can put last_heard slightly ahead of now
        let age = (now - heard).num_seconds().max(0);
        if age < self.online_secs {
            NodeStatus::Online
        } else if age < self.recent_secs {
            NodeStatus::Recent
        } else if age < self.offline_secs {
            NodeStatus::Offline
        } else {
            NodeStatus::Dead
        }
    }
}

impl Config {
    /// Load and validate configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config
            .validate()
            .map_err(|e| anyhow!("Config file {}: {}", path, e))?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.devices;
        if d.standby_poll_divisor < 1 {
            return Err(ConfigError::Invalid(
                "devices.standby_poll_divisor must be at least 1".into(),
            ));
        }
        if d.primary_failover_threshold >= d.max_fail_count {
            return Err(ConfigError::Invalid(format!(
                "devices.primary_failover_threshold ({}) must be below max_fail_count ({})",
                d.primary_failover_threshold, d.max_fail_count
            )));
        }
        for (name, value) in [
            ("discovery_interval_secs", d.discovery_interval_secs),
            ("poll_interval_secs", d.poll_interval_secs),
            ("status_interval_secs", d.status_interval_secs),
            ("connect_timeout_secs", d.connect_timeout_secs),
            ("config_timeout_secs", d.config_timeout_secs),
            ("connect_check_timeout_ms", d.connect_check_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("devices.{} must be positive", name)));
            }
        }
        for cidr in &d.manual_networks {
            if crate::devices::discovery::parse_cidr(cidr).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "devices.manual_networks: '{}' is not an IPv4 CIDR",
                    cidr
                )));
            }
        }
        let s = &self.staleness;
        if !(0 < s.online_secs && s.online_secs < s.recent_secs && s.recent_secs < s.offline_secs) {
            return Err(ConfigError::Invalid(
                "staleness thresholds must be positive and increasing".into(),
            ));
        }
        if self.mqtt.enabled {
            if self.mqtt.topics.is_empty() {
                return Err(ConfigError::Invalid("mqtt.topics is empty".into()));
            }
            if self.mqtt.queue_capacity == 0 {
                return Err(ConfigError::Invalid("mqtt.queue_capacity must be positive".into()));
            }
        }
        self.decryption.key_table()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::crypto::ChannelKeys;
    use chrono::Duration;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.devices.tcp_port, 4403);
        assert_eq!(config.devices.standby_poll_divisor, 5);
        assert_eq!(config.mqtt.topics, vec!["msh/#".to_string()]);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [devices]
            poll_interval_secs = 120
            manual_networks = ["10.1.0.0/24"]
            "#,
        )
        .unwrap();
        assert_eq!(config.devices.poll_interval_secs, 120);
        assert_eq!(config.devices.max_fail_count, 10);
        assert_eq!(config.store.data_dir, "./data");
        config.validate().unwrap();
    }

    #[test]
    fn failover_threshold_must_be_below_ceiling() {
        let mut config = Config::default();
        config.devices.primary_failover_threshold = 10;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.devices.primary_failover_threshold = 3;
        config.devices.standby_poll_divisor = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_channel_key_is_rejected() {
        let mut config = Config::default();
        config
            .decryption
            .channel_keys
            .insert("Ops".into(), "abcd".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadKey { ref channel, .. }) if channel == "Ops"
        ));
    }

    #[test]
    fn key_table_uses_channel_entries_then_fallback() {
        let mut dec = DecryptionConfig::default();
        dec.channel_keys
            .insert("Ops".into(), "00112233445566778899aabbccddeeff".into());
        let table = dec.key_table().unwrap();
        assert_eq!(table.key_for("LongFast"), Some(ChannelKey::default_key()));
        assert_ne!(table.key_for("Ops"), Some(ChannelKey::default_key()));

        dec.default_key = None;
        assert_eq!(dec.key_table().unwrap().key_for("LongFast"), None);
    }

    #[test]
    fn fallback_key_can_be_disabled_from_toml() {
        for value in ["none", "NONE", ""] {
            let text = format!("[decryption]\ndefault_key = \"{}\"\n", value);
            let config: Config = toml::from_str(&text).unwrap();
            config.validate().unwrap();
            let table = config.decryption.key_table().unwrap();
            assert_eq!(table.key_for("LongFast"), None, "default_key = {:?}", value);
        }
        let config: Config = toml::from_str("[decryption]\n").unwrap();
        assert_eq!(
            config.decryption.key_table().unwrap().key_for("LongFast"),
            Some(ChannelKey::default_key())
        );
    }

    #[test]
    fn status_thresholds() {
        let s = StalenessConfig::default();
        let now = Utc::now();
        assert_eq!(s.status_for(None, now), NodeStatus::Unknown);
        assert_eq!(s.status_for(Some(now - Duration::minutes(29)), now), NodeStatus::Online);
        assert_eq!(s.status_for(Some(now - Duration::minutes(30)), now), NodeStatus::Recent);
        assert_eq!(s.status_for(Some(now - Duration::hours(3)), now), NodeStatus::Offline);
        assert_eq!(s.status_for(Some(now - Duration::days(14)), now), NodeStatus::Dead);
        assert_eq!(s.status_for(Some(now + Duration::seconds(5)), now), NodeStatus::Online);
    }

    #[test]
    fn secrets_file_lookup() {
        let content = "# comment\nOTHER=1\nMQTT_PASSWORD=\"s3cret\"\n";
        assert_eq!(secrets_lookup(content, "MQTT_PASSWORD").as_deref(), Some("s3cret"));
        assert_eq!(secrets_lookup("MQTT_PASSWORD=\n", "MQTT_PASSWORD"), None);
    }

    #[tokio::test]
    async fn password_resolution_order() {
        let mut mqtt = MqttConfig::default();
        assert!(matches!(
            mqtt.resolve_password_with(None).await,
            Err(ConfigError::MissingSecret(_))
        ));
        assert_eq!(mqtt.resolve_password_with(Some("env".into())).await.unwrap(), "env");
        mqtt.password = Some("inline".into());
        // the environment wins over the config file
        assert_eq!(mqtt.resolve_password_with(Some("env".into())).await.unwrap(), "env");
        assert_eq!(mqtt.resolve_password_with(Some(String::new())).await.unwrap(), "inline");
        assert_eq!(mqtt.resolve_password_with(None).await.unwrap(), "inline");
    }

    #[tokio::test]
    async fn password_from_secrets_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets");
        std::fs::write(&path, "MQTT_PASSWORD=fromfile\n").unwrap();
        let mqtt = MqttConfig {
            password_file: Some(path.to_string_lossy().into_owned()),
            ..MqttConfig::default()
        };
        assert_eq!(mqtt.resolve_password_with(None).await.unwrap(), "fromfile");
    }
}
