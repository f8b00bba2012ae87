//! The node-table handshake, free of any I/O.
//!
//! Send [`ConfigSession::request_frame`], then feed every received byte chunk to
//! [`ConfigSession::feed`] until it reports completion. The device answers a
//! `want_config_id` with its own node info, config sections and node database, and ends
//! the dump with `config_complete_id` echoing the request id. Frames that are not
//! `FromRadio` messages are skipped.

use chrono::{DateTime, Utc};
use log::{debug, trace};
use prost::Message;

use super::framer::{encode_frame, FrameTooLarge, StreamFramer};
use super::NodeTable;
use crate::logutil::hex_snippet;
use crate::protobuf::{self as proto, config, from_radio, to_radio};

pub struct ConfigSession {
    request_id: u32,
    framer: StreamFramer,
    table: NodeTable,
    complete: bool,
    frames: usize,
    undecodable: usize,
}

impl ConfigSession {
    /// Start a session with a random non-zero request id.
    pub fn new() -> Self {
        let mut id: u32 = rand::random();
        if id == 0 {
            id = 1;
        }
        Self::with_request_id(id)
    }

    pub fn with_request_id(request_id: u32) -> Self {
        Self {
            request_id,
            framer: StreamFramer::new(),
            table: NodeTable::default(),
            complete: false,
            frames: 0,
            undecodable: 0,
        }
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Framed `ToRadio { want_config_id }`.
    pub fn request_frame(&self) -> Result<Vec<u8>, FrameTooLarge> {
        let msg = proto::ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::WantConfigId(self.request_id)),
        };
        encode_frame(&msg.encode_to_vec())
    }

    /// Framed `ToRadio { disconnect }`, sent as a courtesy before closing.
    pub fn disconnect_frame() -> Result<Vec<u8>, FrameTooLarge> {
        let msg = proto::ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Disconnect(true)),
        };
        encode_frame(&msg.encode_to_vec())
    }

    /// Feed raw bytes. Returns `true` once the dump is complete.
    pub fn feed(&mut self, bytes: &[u8], now: DateTime<Utc>) -> bool {
        self.framer.push(bytes);
        while !self.complete {
            let Some(frame) = self.framer.next_frame() else {
                break;
            };
            self.frames += 1;
            match proto::FromRadio::decode(frame.as_slice()) {
                Ok(msg) => self.handle(msg, now),
                Err(e) => {
                    self.undecodable += 1;
                    trace!("undecodable frame ({}): {}", e, hex_snippet(&frame, 16));
                }
            }
        }
        self.complete
    }

    pub fn handle(&mut self, msg: proto::FromRadio, now: DateTime<Utc>) {
        match msg.payload_variant {
            Some(from_radio::PayloadVariant::MyInfo(info)) => {
                debug!("device node number !{:08x}", info.my_node_num);
                self.table.my_node_num = Some(info.my_node_num);
            }
            Some(from_radio::PayloadVariant::NodeInfo(ni)) => {
                let entry = self.table.entry_mut(ni.num);
                entry.info = ni;
            }
            Some(from_radio::PayloadVariant::Config(cfg)) => match cfg.payload_variant {
                Some(config::PayloadVariant::Position(p)) => {
                    self.table.fixed_position = p.fixed_position;
                }
                Some(config::PayloadVariant::Lora(l)) => {
                    self.table.region_code = Some(l.region);
                }
                None => {}
            },
            Some(from_radio::PayloadVariant::ConfigCompleteId(id)) => {
                if id == self.request_id {
                    self.complete = true;
                } else {
                    debug!(
                        "ignoring config_complete_id 0x{:08x} (waiting for 0x{:08x})",
                        id, self.request_id
                    );
                }
            }
            Some(from_radio::PayloadVariant::Packet(pkt)) => self.table.merge_packet(&pkt, now),
            Some(from_radio::PayloadVariant::Rebooted(_)) => {
                debug!("device reported a reboot during the handshake");
            }
            None => {}
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Frames seen so far and how many of them did not decode.
    pub fn frame_counts(&self) -> (usize, usize) {
        (self.frames, self.undecodable)
    }

    pub fn table(&self) -> &NodeTable {
        &self.table
    }

    /// The collected table, only once the dump completed.
    pub fn finish(self) -> Option<NodeTable> {
        self.complete.then_some(self.table)
    }
}

impl Default for ConfigSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(msg: proto::FromRadio) -> Vec<u8> {
        encode_frame(&msg.encode_to_vec()).unwrap()
    }

    fn from_radio(v: from_radio::PayloadVariant) -> proto::FromRadio {
        proto::FromRadio {
            id: 0,
            payload_variant: Some(v),
        }
    }

    #[test]
    fn request_frame_carries_id() {
        let s = ConfigSession::with_request_id(0x1234);
        let frame = s.request_frame().unwrap();
        let mut f = StreamFramer::new();
        f.push(&frame);
        let msg = proto::ToRadio::decode(f.next_frame().unwrap().as_slice()).unwrap();
        assert_eq!(
            msg.payload_variant,
            Some(to_radio::PayloadVariant::WantConfigId(0x1234))
        );
        assert_ne!(ConfigSession::new().request_id(), 0);
    }

    #[test]
    fn collects_table_until_matching_complete_id() {
        let now = Utc::now();
        let mut s = ConfigSession::with_request_id(77);
        let mut stream = Vec::new();
        stream.extend(framed(from_radio(from_radio::PayloadVariant::MyInfo(
            proto::MyNodeInfo {
                my_node_num: 0xa1,
                ..Default::default()
            },
        ))));
        stream.extend(framed(from_radio(from_radio::PayloadVariant::Config(
            proto::Config {
                payload_variant: Some(config::PayloadVariant::Lora(config::LoRaConfig {
                    region: 3,
                    ..Default::default()
                })),
            },
        ))));
        stream.extend(framed(from_radio(from_radio::PayloadVariant::Config(
            proto::Config {
                payload_variant: Some(config::PayloadVariant::Position(
                    config::PositionConfig {
                        fixed_position: true,
                        ..Default::default()
                    },
                )),
            },
        ))));
        for num in [0xa1, 0xb2] {
            stream.extend(framed(from_radio(from_radio::PayloadVariant::NodeInfo(
                proto::NodeInfo {
                    num,
                    ..Default::default()
                },
            ))));
        }
        // stale completion from an earlier request
        stream.extend(framed(from_radio(
            from_radio::PayloadVariant::ConfigCompleteId(5),
        )));
        assert!(!s.feed(&stream, now));
        assert!(!s.feed(&framed(from_radio(from_radio::PayloadVariant::ConfigCompleteId(77)))[..3], now));
        assert!(s.feed(
            &framed(from_radio(from_radio::PayloadVariant::ConfigCompleteId(77)))[3..],
            now
        ));
        assert!(s.is_complete());

        let table = s.finish().unwrap();
        assert_eq!(table.my_node_num, Some(0xa1));
        assert_eq!(table.region_name().as_deref(), Some("EU_868"));
        assert!(table.fixed_position);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn incomplete_session_yields_nothing() {
        let mut s = ConfigSession::with_request_id(9);
        s.feed(
            &framed(from_radio(from_radio::PayloadVariant::NodeInfo(
                proto::NodeInfo {
                    num: 3,
                    ..Default::default()
                },
            ))),
            Utc::now(),
        );
        assert_eq!(s.table().len(), 1);
        assert!(s.finish().is_none());
    }
}
