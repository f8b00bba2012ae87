//! # Bus ingestion
//!
//! Turns raw MQTT payloads into [`Ingested`] items for the reconciliation engine:
//!
//! ```text
//! frame bytes ─► envelope::decode_frame ─► (crypto::decrypt) ─► classify::classify ─► Ingested
//! ```
//!
//! Decoding, decryption and classification are pure; the only I/O on this path is the
//! MQTT transport and the store write, both in [`bus`].

pub mod bus;
pub mod classify;
pub mod crypto;
pub mod envelope;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{NodeId, NodeUpdate, TextMessageRecord, MESSAGE_SCHEMA_VERSION};
use crate::sensors::Metric;
use classify::Classified;
use crypto::ChannelKeys;
use envelope::DecodedFrame;

/// Why a bus frame was dropped. All of these are expected on a shared bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameDiscard {
    #[error("frame is not a service envelope")]
    Malformed,
    #[error("envelope carries no packet")]
    NoPacket,
    #[error("packet has neither decoded nor encrypted payload")]
    Empty,
    #[error("no key configured for channel")]
    NoKey,
    #[error("payload did not decrypt to a valid message")]
    DecryptFailed,
    #[error("unhandled port {0}")]
    UnknownPort(i32),
}

/// Result of processing one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    Node(NodeUpdate),
    Text(TextMessageRecord),
}

/// Decoder for the bus path, holding the channel key lookup.
#[derive(Clone)]
pub struct BusDecoder {
    keys: Arc<dyn ChannelKeys>,
}

impl BusDecoder {
    pub fn new(keys: Arc<dyn ChannelKeys>) -> Self {
        Self { keys }
    }

    /// Decode, decrypt and classify one frame.
    pub fn process(
        &self,
        frame: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<(DecodedFrame, Classified, Ingested), FrameDiscard> {
        let decoded = envelope::decode_frame(frame, self.keys.as_ref())?;
        let classified = classify::classify(&decoded.payload)?;
        let ingested = to_ingested(&decoded, &classified, received_at);
        Ok((decoded, classified, ingested))
    }
}

/// Shape a classified bus frame into a node update or a message row.
pub fn to_ingested(
    frame: &DecodedFrame,
    classified: &Classified,
    received_at: DateTime<Utc>,
) -> Ingested {
    let node_id = NodeId(frame.from);
    let mut update = NodeUpdate::new(node_id);
    match classified {
        Classified::Text(text) => {
            return Ingested::Text(TextMessageRecord {
                schema_version: MESSAGE_SCHEMA_VERSION,
                from: node_id,
                to: NodeId(frame.to),
                channel: frame.channel,
                packet_id: frame.packet_id,
                timestamp: received_at,
                text: text.clone(),
                gateway_id: non_empty(&frame.gateway_id),
                channel_id: non_empty(&frame.channel_id),
            })
        }
        Classified::Position(p) | Classified::MapReport(p) => update.position = p.clone(),
        Classified::Identity(id) => update.identity = id.clone(),
        Classified::Telemetry { metrics, .. } => update.metrics.merge_from(metrics),
        // only the text is dropped; the link metrics below still count
        Classified::UndecodableText => {}
    }

    update.heard_at = Some(received_at);
    update
        .metrics
        .insert_checked(Metric::Snr, Some(f64::from(frame.rx_snr)));
    update
        .metrics
        .insert_checked(Metric::Rssi, Some(f64::from(frame.rx_rssi)));
    update
        .metrics
        .insert_checked(Metric::HopsAway, frame.hops_away().map(f64::from));
    Ingested::Node(update)
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
