use chrono::{Duration, TimeZone, Utc};

use meshtrack::config::{Config, StalenessConfig};
use meshtrack::model::{
    NodeId, NodeStatus, NodeUpdate, PositionReport, PositionSource, Provenance,
};
use meshtrack::reconcile::PositionDecision;
use meshtrack::storage::{NodeStore, StoreError};

fn report(lat: f64, lon: f64) -> PositionReport {
    PositionReport {
        latitude: lat,
        longitude: lon,
        altitude: None,
        time: None,
        manual_fix: false,
    }
}

fn with_position(id: u32, lat: f64, lon: f64) -> NodeUpdate {
    let mut u = NodeUpdate::new(NodeId(id));
    u.position = Some(report(lat, lon));
    u
}

fn self_poll(region: &str) -> Provenance {
    let mut p = Provenance::poll("USB-ttyUSB0", Utc::now());
    p.self_report = true;
    p.device_fixed_position = true;
    p.region = Some(region.to_string());
    p
}

#[test]
fn fixed_self_report_survives_third_parties() {
    let dir = tempfile::tempdir().unwrap();
    let store = NodeStore::open(dir.path()).unwrap();

    let out = store.apply_update(&with_position(1, 40.0, -105.0), &self_poll("US")).unwrap();
    assert_eq!(out.position, PositionDecision::Accepted);

    // another poller and the bus both report a drifted fix
    let other = Provenance::poll("WiFi-10.0.0.9", Utc::now());
    let out = store.apply_update(&with_position(1, 40.01, -105.01), &other).unwrap();
    assert_eq!(out.position, PositionDecision::RejectedFixed);
    let out = store
        .apply_update(&with_position(1, 40.02, -105.02), &Provenance::bus("msh/US/2/e/LongFast/!1", Utc::now()))
        .unwrap();
    assert_eq!(out.position, PositionDecision::RejectedFixed);

    let node = store.get_node(NodeId(1)).unwrap().unwrap();
    let pos = node.position.unwrap();
    assert_eq!(pos.source, PositionSource::Fixed);
    assert_eq!(pos.latitude, 40.0);
    assert_eq!(node.region.as_deref(), Some("US"));
    assert_eq!(store.positions_for(NodeId(1), None).unwrap().len(), 1);

    // the owner itself may still move it
    let out = store.apply_update(&with_position(1, 41.0, -105.0), &self_poll("US")).unwrap();
    assert_eq!(out.position, PositionDecision::Accepted);
}

#[test]
fn jitter_is_not_a_new_trail_point() {
    let dir = tempfile::tempdir().unwrap();
    let store = NodeStore::open(dir.path()).unwrap();
    let bus = Provenance::bus("msh/t", Utc::now());
    store.apply_update(&with_position(2, 10.0, 10.0), &bus).unwrap();
    let out = store.apply_update(&with_position(2, 10.00005, 10.00005), &bus).unwrap();
    assert_eq!(out.position, PositionDecision::RejectedJitter);
    assert_eq!(store.positions_for(NodeId(2), None).unwrap().len(), 1);
}

#[test]
fn last_heard_never_moves_backwards() {
    let dir = tempfile::tempdir().unwrap();
    let store = NodeStore::open(dir.path()).unwrap();
    let newer = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
    let older = newer - Duration::hours(3);

    let mut u = NodeUpdate::new(NodeId(3));
    u.heard_at = Some(newer);
    store.apply_update(&u, &Provenance::bus("msh/a", Utc::now())).unwrap();
    u.heard_at = Some(older);
    store.apply_update(&u, &Provenance::poll("USB-ttyACM0", Utc::now())).unwrap();

    let node = store.get_node(NodeId(3)).unwrap().unwrap();
    assert_eq!(node.last_heard, Some(newer));
    assert_eq!(node.last_radio_contact, Some(older));
}

#[test]
fn manual_override_tags_and_notes() {
    let dir = tempfile::tempdir().unwrap();
    let store = NodeStore::open(dir.path()).unwrap();
    let id = NodeId(4);

    assert!(matches!(
        store.set_manual_position(id, 1.0, 1.0, None, None),
        Err(StoreError::NotFound(_))
    ));
    store.apply_update(&with_position(4, 50.0, 8.0), &Provenance::bus("msh/a", Utc::now())).unwrap();
    assert!(matches!(
        store.set_manual_position(id, 91.0, 0.0, None, None),
        Err(StoreError::InvalidInput(_))
    ));

    let node = store
        .set_manual_position(id, 50.5, 8.5, Some(100.0), Some("Water tower".into()))
        .unwrap();
    assert_eq!(node.position_source(), Some(PositionSource::Manual));
    assert_eq!(node.displayed_position().unwrap().latitude, 50.5);

    // automated reports keep flowing into the reported slot underneath
    store.apply_update(&with_position(4, 51.0, 9.0), &Provenance::bus("msh/a", Utc::now())).unwrap();
    let node = store.get_node(id).unwrap().unwrap();
    assert_eq!(node.displayed_position().unwrap().latitude, 50.5);
    assert_eq!(node.position.as_ref().unwrap().latitude, 51.0);

    let node = store.clear_manual_position(id).unwrap();
    assert_eq!(node.displayed_position().unwrap().latitude, 51.0);
    assert!(matches!(store.clear_manual_position(id), Err(StoreError::InvalidInput(_))));

    let trail = store.positions_for(id, None).unwrap();
    assert_eq!(
        trail.iter().map(|s| s.source).collect::<Vec<_>>(),
        vec![PositionSource::Mqtt, PositionSource::Manual, PositionSource::Mqtt]
    );

    store.add_tag(id, " solar ").unwrap();
    store.add_tag(id, "relay").unwrap();
    let node = store.add_tag(id, "solar").unwrap();
    assert_eq!(node.tags, vec!["solar", "relay"]);
    assert!(matches!(store.add_tag(id, "  "), Err(StoreError::InvalidInput(_))));
    assert!(matches!(store.remove_tag(id, "roof"), Err(StoreError::NotFound(_))));
    assert_eq!(store.remove_tag(id, "solar").unwrap().tags, vec!["relay"]);
    assert_eq!(store.set_notes(id, Some("  on the ridge ")).unwrap().notes.as_deref(), Some("on the ridge"));
}

#[test]
fn manual_position_and_trail_row_commit_together() {
    let dir = tempfile::tempdir().unwrap();
    let store = NodeStore::open(dir.path()).unwrap();
    let id = NodeId(5);

    assert!(store.set_manual_position(id, 10.0, 10.0, None, None).is_err());
    assert!(store.positions_for(id, None).unwrap().is_empty());
    assert!(store.get_node(id).unwrap().is_none());

    store.apply_update(&NodeUpdate::new(id), &Provenance::bus("msh/a", Utc::now())).unwrap();
    let node = store
        .set_manual_position(id, 10.5, 11.5, Some(3.0), Some("Mast".into()))
        .unwrap();
    let manual = node.manual_position.clone().unwrap();
    assert_eq!(node.last_updated, manual.set_at);

    let reread = store.get_node(id).unwrap().unwrap();
    assert_eq!(reread.manual_position, node.manual_position);
    let trail = store.positions_for(id, None).unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].source, PositionSource::Manual);
    assert_eq!(trail[0].timestamp, manual.set_at);
    assert_eq!(trail[0].altitude, Some(3.0));
}

#[test]
fn summary_counts_by_status_and_source() {
    let dir = tempfile::tempdir().unwrap();
    let store = NodeStore::open(dir.path()).unwrap();
    let now = Utc::now();
    for (id, age_min) in [(10u32, 5i64), (11, 90), (12, 60 * 24 * 30)] {
        let mut u = NodeUpdate::new(NodeId(id));
        u.heard_at = Some(now - Duration::minutes(age_min));
        store.apply_update(&u, &Provenance::bus("msh/a", now)).unwrap();
    }
    store.apply_update(&with_position(13, 0.5, 0.5), &Provenance::poll("USB-x", now)).unwrap();

    let staleness = StalenessConfig::default();
    assert_eq!(staleness.status_for(None, now), NodeStatus::Unknown);
    let summary = store.summary(&staleness, now).unwrap();
    assert_eq!(summary.nodes, 4);
    assert_eq!(summary.by_status.get("online"), Some(&1));
    assert_eq!(summary.by_status.get("recent"), Some(&1));
    assert_eq!(summary.by_status.get("dead"), Some(&1));
    assert_eq!(summary.by_source.get("mqtt"), Some(&3));
    assert_eq!(summary.by_source.get("radio"), Some(&1));
    assert_eq!(summary.with_position, 1);
    assert_eq!(summary.position_samples, 1);
}

#[test]
fn store_reopens_with_data() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = NodeStore::open(dir.path()).unwrap();
        store.apply_update(&with_position(20, 1.0, 2.0), &Provenance::bus("msh/a", Utc::now())).unwrap();
        store.flush().unwrap();
    }
    let store = NodeStore::open(dir.path()).unwrap();
    assert!(store.get_node(NodeId(20)).unwrap().is_some());
}

#[tokio::test]
async fn config_file_and_secrets_file() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = dir.path().join("mqtt.env");
    tokio::fs::write(&secrets, "# broker\nMQTT_PASSWORD=\"s3cret\"\n").await.unwrap();
    let path = dir.path().join("config.toml");
    tokio::fs::write(
        &path,
        format!(
            r#"
[mqtt]
host = "broker.local"
password_file = "{}"

[decryption]
channel_keys = {{ Private = "simple3" }}

[devices]
standby_poll_divisor = 3
"#,
            secrets.display()
        ),
    )
    .await
    .unwrap();

    let config = Config::load(path.to_str().unwrap()).await.unwrap();
    assert_eq!(config.mqtt.host, "broker.local");
    assert_eq!(config.devices.standby_poll_divisor, 3);
    assert_eq!(config.mqtt.resolve_password_with(None).await.unwrap(), "s3cret");
    // the environment wins over the file
    assert_eq!(
        config.mqtt.resolve_password_with(Some("from-env".into())).await.unwrap(),
        "from-env"
    );

    tokio::fs::write(&path, "[decryption]\nchannel_keys = { Bad = \"abcd\" }\n").await.unwrap();
    assert!(Config::load(path.to_str().unwrap()).await.is_err());
}

#[tokio::test]
async fn init_writes_loadable_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");
    Config::create_default(path.to_str().unwrap()).await.unwrap();
    let config = Config::load(path.to_str().unwrap()).await.unwrap();
    assert_eq!(config.devices.poll_interval_secs, 300);
    assert!(config.mqtt.enabled);
}
