//! Task orchestration for `meshtrack start`.
//!
//! [`Tracker`] owns the store, the device registry and one `watch` shutdown channel. `run`
//! spawns discovery, polling, status reporting and (when enabled) the bus transport plus its
//! consumer, then waits for Ctrl-C, flips the signal and joins every task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::{Config, PASSWORD_ENV};
use crate::devices::discovery::{Discovery, DiscoverySettings};
use crate::devices::scheduler::status_lines;
use crate::devices::{PollScheduler, RadioLink, Registry, SchedulerSettings};
use crate::ingest::bus::{self, BusSettings};
use crate::ingest::BusDecoder;
use crate::meshtastic::transport::LinkOptions;
use crate::metrics;
use crate::storage::NodeStore;

pub struct Tracker {
    config: Config,
    store: NodeStore,
    registry: Arc<Registry>,
    bus: Option<BusSettings>,
    shutdown_tx: watch::Sender<bool>,
}

impl Tracker {
    /// Open the store and resolve secrets. A missing MQTT password with the bus enabled is an
    /// error here, before any task starts.
    pub async fn new(config: Config) -> Result<Self> {
        let store = NodeStore::open(&config.store.data_dir)
            .with_context(|| format!("opening store at {}", config.store.data_dir))?;

        let bus = if config.mqtt.enabled {
            if config.mqtt.password.is_some() {
                warn!(
                    target: "security",
                    "MQTT password is stored inline in the config file; prefer {} or mqtt.password_file",
                    PASSWORD_ENV
                );
            }
            let password = config
                .mqtt
                .resolve_password()
                .await
                .context("MQTT is enabled but no password is configured")?;
            Some(BusSettings {
                host: config.mqtt.host.clone(),
                port: config.mqtt.port,
                username: config.mqtt.username.clone(),
                password,
                client_id: format!("{}-{:04x}", config.mqtt.client_id_prefix, rand::random::<u16>()),
                topics: config.mqtt.topics.clone(),
                keep_alive: Duration::from_secs(config.mqtt.keep_alive_secs),
            })
        } else {
            None
        };

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            store,
            registry: Arc::new(Registry::new()),
            bus,
            shutdown_tx,
        })
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Spawn every task. Returns their handles; flip [`Tracker::shutdown`] to stop them.
    pub fn spawn(&self) -> Result<Vec<JoinHandle<()>>> {
        let devices = &self.config.devices;
        let mut handles = Vec::new();

        let discovery = Discovery::new(self.registry.clone(), DiscoverySettings::from_config(devices));
        handles.push(tokio::spawn(discovery.run(
            Duration::from_secs(devices.discovery_interval_secs),
            self.shutdown_tx.subscribe(),
        )));

        let scheduler = PollScheduler::new(
            self.registry.clone(),
            self.store.clone(),
            RadioLink::new(LinkOptions::from_config(devices)),
            SchedulerSettings::from_config(devices),
        );
        handles.push(tokio::spawn(scheduler.run(
            Duration::from_secs(devices.poll_interval_secs),
            self.shutdown_tx.subscribe(),
        )));

        handles.push(tokio::spawn(report_status(
            self.registry.clone(),
            self.store.clone(),
            Duration::from_secs(devices.status_interval_secs),
            self.shutdown_tx.subscribe(),
        )));

        if let Some(settings) = &self.bus {
            let keys = self
                .config
                .decryption
                .key_table()
                .context("building channel key table")?;
            let (tx, rx) = mpsc::channel(self.config.mqtt.queue_capacity);
            handles.push(tokio::spawn(bus::consume(
                BusDecoder::new(Arc::new(keys)),
                self.store.clone(),
                rx,
                self.shutdown_tx.subscribe(),
            )));
            self.spawn_transport(settings.clone(), tx, &mut handles);
        } else {
            info!("MQTT disabled; running direct-poll path only");
        }
        Ok(handles)
    }

    #[cfg(feature = "mqtt")]
    fn spawn_transport(
        &self,
        settings: BusSettings,
        tx: mpsc::Sender<bus::BusFrame>,
        handles: &mut Vec<JoinHandle<()>>,
    ) {
        handles.push(tokio::spawn(bus::run_transport(
            settings,
            tx,
            self.shutdown_tx.subscribe(),
        )));
    }

    #[cfg(not(feature = "mqtt"))]
    fn spawn_transport(
        &self,
        _settings: BusSettings,
        _tx: mpsc::Sender<bus::BusFrame>,
        _handles: &mut Vec<JoinHandle<()>>,
    ) {
        warn!("MQTT is enabled in config but this build lacks the 'mqtt' feature");
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run until Ctrl-C, then stop every task and flush the store.
    pub async fn run(self) -> Result<()> {
        let handles = self.spawn()?;
        info!(
            "Tracker running: {} task(s), polling every {}s",
            handles.len(),
            self.config.devices.poll_interval_secs
        );
        tokio::signal::ctrl_c()
            .await
            .context("waiting for Ctrl-C")?;
        info!("Shutdown requested");
        self.shutdown();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Task ended abnormally: {}", e);
            }
        }
        self.store.flush().context("final store flush")?;
        info!("Stopped");
        Ok(())
    }
}

/// Log the registry status and the counters every `cadence`, flushing the store each time.
pub async fn report_status(
    registry: Arc<Registry>,
    store: NodeStore,
    cadence: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // first tick fires immediately; nothing to report yet
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for line in status_lines(&registry) {
                    info!("{}", line);
                }
                let snap = metrics::snapshot();
                info!(
                    "Frames: {} received, {} plain, {} decrypted, {} discarded; polls {} ok / {} failed",
                    snap.frames_received,
                    snap.frames_plaintext,
                    snap.frames_decrypted,
                    snap.frames_discarded,
                    snap.polls_ok,
                    snap.polls_failed
                );
                if let Err(e) = store.flush() {
                    warn!("Store flush failed: {}", e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    log::debug!("status task stopped at {}", Utc::now().to_rfc3339());
}
