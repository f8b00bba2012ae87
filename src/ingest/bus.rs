//! Bus transport and the frame consumer.
//!
//! The MQTT event loop only copies publishes into a bounded queue; one consumer task drains
//! it in arrival order and does the decode, classify and store write. A full queue makes the
//! transport wait, so a slow store delays frames instead of losing them.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, watch};

use super::{BusDecoder, FrameDiscard, Ingested};
use crate::logutil::{escape_log, truncate_for_log};
use crate::metrics;
use crate::model::Provenance;
use crate::reconcile::PositionDecision;
use crate::storage::{NodeStore, StoreError};

/// One publish taken off the bus.
#[derive(Debug, Clone)]
pub struct BusFrame {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

/// What happened to one frame.
#[derive(Debug)]
pub enum FrameOutcome {
    Discarded(FrameDiscard),
    Node {
        created: bool,
        position: PositionDecision,
        telemetry: bool,
    },
    /// `inserted` is false for a duplicate (same sender, recipient, channel and packet id).
    Message { inserted: bool },
    StoreFailed(StoreError),
}

/// Decode one frame and write whatever it yields.
pub fn handle_frame(decoder: &BusDecoder, store: &NodeStore, frame: &BusFrame) -> FrameOutcome {
    metrics::inc_frames_received();
    let (decoded, classified, ingested) = match decoder.process(&frame.payload, frame.received_at) {
        Ok(parts) => parts,
        Err(discard) => {
            metrics::inc_frames_discarded();
            trace!("discarded frame on {}: {}", escape_log(&frame.topic), discard);
            return FrameOutcome::Discarded(discard);
        }
    };
    metrics::inc_frames_decoded(decoded.was_encrypted);
    debug!(
        "{} from !{:08x} via {} ({})",
        classified.kind(),
        decoded.from,
        escape_log(&frame.topic),
        if decoded.was_encrypted { "decrypted" } else { "plain" }
    );

    match ingested {
        Ingested::Text(msg) => match store.insert_message(&msg) {
            Ok(inserted) => {
                metrics::inc_message_stored(inserted);
                if inserted {
                    info!("[{}] {}: {}", msg.channel, msg.from, truncate_for_log(&msg.text, 120));
                }
                FrameOutcome::Message { inserted }
            }
            Err(e) => {
                metrics::inc_store_failures();
                error!("Storing message from {} failed: {}", msg.from, e);
                FrameOutcome::StoreFailed(e)
            }
        },
        Ingested::Node(update) => {
            let prov = Provenance::bus(&frame.topic, frame.received_at);
            match store.apply_update(&update, &prov) {
                Ok(outcome) => {
                    metrics::record_update(
                        outcome.created,
                        outcome.position.accepted(),
                        outcome.telemetry.is_some(),
                    );
                    if outcome.created {
                        info!("New node {} seen on the bus", update.node_id);
                    }
                    FrameOutcome::Node {
                        created: outcome.created,
                        position: outcome.position,
                        telemetry: outcome.telemetry.is_some(),
                    }
                }
                Err(e) => {
                    metrics::inc_store_failures();
                    error!("Store write for {} failed: {}", update.node_id, e);
                    FrameOutcome::StoreFailed(e)
                }
            }
        }
    }
}

/// Drain the queue until every sender is gone or shutdown is signalled.
pub async fn consume(
    decoder: BusDecoder,
    store: NodeStore,
    mut frames: mpsc::Receiver<BusFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = frames.recv() => {
                let Some(frame) = next else { break };
                handle_frame(&decoder, &store, &frame);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("bus consumer stopped");
}

/// Queue a frame, waiting for room when the consumer is behind. Returns false once the
/// consumer is gone.
pub async fn enqueue(tx: &mpsc::Sender<BusFrame>, frame: BusFrame) -> bool {
    match tx.send(frame).await {
        Ok(()) => true,
        Err(mpsc::error::SendError(frame)) => {
            debug!("bus consumer stopped, frame on {} not queued", escape_log(&frame.topic));
            false
        }
    }
}

/// Connection settings resolved from config, password included.
#[derive(Debug, Clone)]
pub struct BusSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub topics: Vec<String>,
    pub keep_alive: Duration,
}

#[cfg(feature = "mqtt")]
pub use transport::run_transport;

#[cfg(feature = "mqtt")]
mod transport {
    use super::*;
    use rumqttc::{AsyncClient, ConnectionError, Event, MqttOptions, Packet, QoS};

    const RECONNECT_DELAY: Duration = Duration::from_secs(5);

    /// Run the MQTT event loop, feeding publishes into `tx`. Reconnects after errors; returns
    /// on shutdown.
    pub async fn run_transport(
        settings: BusSettings,
        tx: mpsc::Sender<BusFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut opts = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        opts.set_keep_alive(settings.keep_alive);
        opts.set_credentials(&settings.username, &settings.password);
        opts.set_max_packet_size(64 * 1024, 64 * 1024);
        let (client, mut eventloop) = AsyncClient::new(opts, 16);

        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker {}:{}", settings.host, settings.port);
                        for topic in &settings.topics {
                            if let Err(e) = client.try_subscribe(topic, QoS::AtMostOnce) {
                                warn!("Subscribe to {} failed: {}", topic, e);
                            } else {
                                info!("Subscribed to {}", topic);
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let frame = BusFrame {
                            topic: publish.topic,
                            payload: publish.payload,
                            received_at: Utc::now(),
                        };
                        if !enqueue(&tx, frame).await {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(ConnectionError::ConnectionRefused(code)) => {
                        warn!(target: "security", "MQTT broker refused the connection: {:?}", code);
                        tokio::select! {
                            _ = tokio::time::sleep(RECONNECT_DELAY * 6) => {}
                            _ = shutdown.changed() => {}
                        }
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("MQTT connection error: {} (retrying in {}s)", e, RECONNECT_DELAY.as_secs());
                        tokio::select! {
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                            _ = shutdown.changed() => {}
                        }
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = client.try_disconnect() {
            debug!("MQTT disconnect: {}", e);
        }
        debug!("bus transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::crypto::{self, ChannelKey, KeyTable};
    use crate::ingest::envelope;
    use crate::model::NodeId;
    use crate::protobuf::{self as proto, mesh_packet::PayloadVariant, PortNum};
    use prost::Message;
    use std::sync::Arc;

    fn frame(payload: Vec<u8>) -> BusFrame {
        BusFrame {
            topic: "msh/US/2/e/LongFast/!0badcafe".to_string(),
            payload: Bytes::from(payload),
            received_at: Utc::now(),
        }
    }

    fn text_packet(from: u32, id: u32, text: &str) -> Vec<u8> {
        let data = proto::Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: text.as_bytes().to_vec(),
            ..Default::default()
        };
        let ct = crypto::encrypt(&ChannelKey::default_key(), id, from, &data.encode_to_vec());
        envelope::encode_frame(
            proto::MeshPacket {
                from,
                to: 0xffff_ffff,
                id,
                payload_variant: Some(PayloadVariant::Encrypted(ct)),
                ..Default::default()
            },
            "LongFast",
            "!0badcafe",
        )
    }

    #[test]
    fn duplicate_text_is_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::open(dir.path()).unwrap();
        let decoder = BusDecoder::new(Arc::new(KeyTable::default()));
        let f = frame(text_packet(0x42, 9, "hello"));
        assert!(matches!(
            handle_frame(&decoder, &store, &f),
            FrameOutcome::Message { inserted: true }
        ));
        assert!(matches!(
            handle_frame(&decoder, &store, &f),
            FrameOutcome::Message { inserted: false }
        ));
        assert_eq!(store.recent_messages(10).unwrap().len(), 1);
        // text does not create a node record
        assert!(store.get_node(NodeId(0x42)).unwrap().is_none());
    }

    #[test]
    fn garbage_is_discarded_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::open(dir.path()).unwrap();
        let decoder = BusDecoder::new(Arc::new(KeyTable::default()));
        let outcome = handle_frame(&decoder, &store, &frame(vec![0xff, 0x00, 0x13]));
        assert!(matches!(outcome, FrameOutcome::Discarded(_)));
        assert!(store.list_nodes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_queue_waits_for_the_consumer() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(enqueue(&tx, frame(vec![1])).await);
        let pending = tokio::spawn(async move { enqueue(&tx, frame(vec![2])).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        assert_eq!(rx.recv().await.unwrap().payload.as_ref(), &[1]);
        assert!(pending.await.unwrap());
        assert_eq!(rx.recv().await.unwrap().payload.as_ref(), &[2]);
    }

    #[tokio::test]
    async fn enqueue_reports_a_stopped_consumer() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(!enqueue(&tx, frame(vec![1])).await);
    }
}
