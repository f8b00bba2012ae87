//! # Meshtrack - Node Tracker for Meshtastic Networks
//!
//! Meshtrack keeps one reconciled record per mesh node, fed from two independent paths:
//! the shared MQTT bus (encrypted or plaintext `ServiceEnvelope` frames from any gateway)
//! and direct polling of radios attached over USB serial or reachable over TCP.
//!
//! ## Features
//!
//! - **Bus decoding**: envelope parsing, AES-128-CTR channel decryption with per-channel keys,
//!   port-based classification into position, identity, telemetry, text and map reports.
//! - **Direct polling**: USB enumeration and subnet sweeps discover radios; one primary is
//!   polled every cycle, standbys on a reduced cadence, with failover on sustained failure.
//! - **Reconciliation**: conflicting, out-of-order updates merge into one record without
//!   losing authoritative data (fixed self-reported positions, radio provenance).
//! - **History**: append-only position trails and telemetry readings in an embedded store.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshtrack::config::Config;
//! use meshtrack::service::Tracker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let tracker = Tracker::new(config).await?;
//!     tracker.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`ingest`] - bus frame decoding, decryption, classification and the MQTT consumer
//! - [`devices`] - device registry, discovery, polling and primary/standby scheduling
//! - [`meshtastic`] - device stream framing and the node-table handshake
//! - [`reconcile`] - the merge rules applied to every node update
//! - [`storage`] - sled-backed node, history and message persistence
//! - [`config`] - configuration loading, defaults and validation
//! - [`protobuf`] - the Meshtastic message subset this crate reads
//!
//! ## Architecture
//!
//! ```text
//!   MQTT bus                         radios (serial / TCP)
//!      │                                     │
//! ┌──────────┐                       ┌───────────────┐
//! │  ingest  │                       │    devices    │ ← discovery, registry,
//! │ (decode) │                       │ (poll + elect)│   scheduler
//! └──────────┘                       └───────────────┘
//!      │                                     │
//!      └──────────────┐     ┌────────────────┘
//!               ┌───────────────┐
//!               │   reconcile   │ ← pure merge rules
//!               └───────────────┘
//!                       │
//!               ┌───────────────┐
//!               │    storage    │ ← sled transactions
//!               └───────────────┘
//! ```

pub mod config;
pub mod devices;
pub mod ingest;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod model;
pub mod protobuf;
pub mod reconcile;
pub mod sensors;
pub mod service;
pub mod storage;
