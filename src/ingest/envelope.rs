//! Bus frame decoding: `ServiceEnvelope` bytes to a [`DecodedFrame`].

use bytes::Bytes;
use log::trace;
use prost::Message;

use super::crypto::{self, ChannelKeys};
use super::FrameDiscard;
use crate::protobuf::{self as proto, mesh_packet::PayloadVariant, PortNum};

/// Routing metadata and inner message of one bus frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub from: u32,
    pub to: u32,
    pub packet_id: u32,
    pub channel: u32,
    pub gateway_id: String,
    pub channel_id: String,
    pub rx_snr: f32,
    pub rx_rssi: i32,
    pub hop_limit: u32,
    pub hop_start: u32,
    pub rx_time: u32,
    pub via_mqtt: bool,
    /// Payload arrived encrypted and was decrypted with a channel key.
    pub was_encrypted: bool,
    pub payload: proto::Data,
}

impl DecodedFrame {
    /// Hops the packet travelled before the gateway heard it, when the firmware reports it.
    pub fn hops_away(&self) -> Option<u32> {
        (self.hop_start > 0 && self.hop_start >= self.hop_limit)
            .then(|| self.hop_start - self.hop_limit)
    }

    pub fn port(&self) -> Option<PortNum> {
        PortNum::try_from(self.payload.portnum).ok()
    }
}

/// Decode one frame. Every failure is a [`FrameDiscard`]; none of them are errors worth
/// surfacing, a shared bus carries plenty of traffic this node cannot read.
pub fn decode_frame(frame: &[u8], keys: &dyn ChannelKeys) -> Result<DecodedFrame, FrameDiscard> {
    let envelope = proto::ServiceEnvelope::decode(Bytes::copy_from_slice(frame))
        .map_err(|_| FrameDiscard::Malformed)?;
    let packet = envelope.packet.ok_or(FrameDiscard::NoPacket)?;

    let (payload, was_encrypted) = match packet.payload_variant {
        Some(PayloadVariant::Decoded(data)) => (data, false),
        Some(PayloadVariant::Encrypted(ref blob)) if !blob.is_empty() => {
            let key = keys
                .key_for(&envelope.channel_id)
                .ok_or(FrameDiscard::NoKey)?;
            let plain = crypto::decrypt(&key, packet.id, packet.from, blob);
            let data = proto::Data::decode(plain.as_slice()).map_err(|_| {
                trace!(
                    "decrypt of packet {:08x} from !{:08x} on '{}' did not parse",
                    packet.id,
                    packet.from,
                    envelope.channel_id
                );
                FrameDiscard::DecryptFailed
            })?;
            // a wrong key usually still "parses"; port 0 gives it away
            if data.portnum == PortNum::UnknownApp as i32 {
                return Err(FrameDiscard::DecryptFailed);
            }
            (data, true)
        }
        _ => return Err(FrameDiscard::Empty),
    };

    Ok(DecodedFrame {
        from: packet.from,
        to: packet.to,
        packet_id: packet.id,
        channel: packet.channel,
        gateway_id: envelope.gateway_id,
        channel_id: envelope.channel_id,
        rx_snr: packet.rx_snr,
        rx_rssi: packet.rx_rssi,
        hop_limit: packet.hop_limit,
        hop_start: packet.hop_start,
        rx_time: packet.rx_time,
        via_mqtt: packet.via_mqtt,
        was_encrypted,
        payload,
    })
}

/// Build an envelope frame. Used by tests and the `decode` debugging command's round trip.
pub fn encode_frame(packet: proto::MeshPacket, channel_id: &str, gateway_id: &str) -> Vec<u8> {
    proto::ServiceEnvelope {
        packet: Some(packet),
        channel_id: channel_id.to_string(),
        gateway_id: gateway_id.to_string(),
    }
    .encode_to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::crypto::{ChannelKey, KeyTable};

    fn data(port: PortNum, payload: &[u8]) -> proto::Data {
        proto::Data {
            portnum: port as i32,
            payload: payload.to_vec(),
            ..Default::default()
        }
    }

    fn packet(from: u32, id: u32, variant: PayloadVariant) -> proto::MeshPacket {
        proto::MeshPacket {
            from,
            to: 0xffff_ffff,
            id,
            hop_start: 3,
            hop_limit: 1,
            rx_snr: 6.25,
            payload_variant: Some(variant),
            ..Default::default()
        }
    }

    #[test]
    fn plaintext_frame_decodes() {
        let frame = encode_frame(
            packet(0x1234, 9, PayloadVariant::Decoded(data(PortNum::TextMessageApp, b"hi"))),
            "LongFast",
            "!gateway1",
        );
        let out = decode_frame(&frame, &KeyTable::default()).unwrap();
        assert!(!out.was_encrypted);
        assert_eq!(out.from, 0x1234);
        assert_eq!(out.gateway_id, "!gateway1");
        assert_eq!(out.hops_away(), Some(2));
        assert_eq!(out.port(), Some(PortNum::TextMessageApp));
    }

    #[test]
    fn encrypted_frame_decrypts_with_default_key() {
        let inner = data(PortNum::PositionApp, &[1, 2, 3]).encode_to_vec();
        let ct = crypto::encrypt(&ChannelKey::default_key(), 77, 0xabcd, &inner);
        let frame = encode_frame(
            packet(0xabcd, 77, PayloadVariant::Encrypted(ct)),
            "LongFast",
            "!gw",
        );
        let out = decode_frame(&frame, &KeyTable::default()).unwrap();
        assert!(out.was_encrypted);
        assert_eq!(out.payload.portnum, PortNum::PositionApp as i32);
        assert_eq!(out.payload.payload, vec![1, 2, 3]);
    }

    #[test]
    fn wrong_key_is_a_silent_discard() {
        let inner = data(PortNum::PositionApp, &[1, 2, 3]).encode_to_vec();
        let ct = crypto::encrypt(&ChannelKey::new([9u8; 16]), 77, 0xabcd, &inner);
        let frame = encode_frame(packet(0xabcd, 77, PayloadVariant::Encrypted(ct)), "Secret", "!gw");
        assert_eq!(
            decode_frame(&frame, &KeyTable::default()).unwrap_err(),
            FrameDiscard::DecryptFailed
        );
    }

    #[test]
    fn port_zero_after_decrypt_is_a_wrong_key() {
        let inner = data(PortNum::UnknownApp, &[4, 5]).encode_to_vec();
        let ct = crypto::encrypt(&ChannelKey::default_key(), 3, 0x99, &inner);
        let frame = encode_frame(packet(0x99, 3, PayloadVariant::Encrypted(ct)), "LongFast", "!gw");
        assert_eq!(
            decode_frame(&frame, &KeyTable::default()).unwrap_err(),
            FrameDiscard::DecryptFailed
        );
    }

    #[test]
    fn channel_without_key_is_discarded() {
        let frame = encode_frame(
            packet(1, 2, PayloadVariant::Encrypted(vec![1, 2, 3, 4])),
            "Private",
            "!gw",
        );
        let err = decode_frame(&frame, &KeyTable::new(None)).unwrap_err();
        assert_eq!(err, FrameDiscard::NoKey);
    }

    #[test]
    fn frame_without_payload_is_discarded() {
        let mut p = packet(1, 2, PayloadVariant::Encrypted(vec![]));
        p.payload_variant = None;
        let frame = encode_frame(p, "LongFast", "!gw");
        assert_eq!(
            decode_frame(&frame, &KeyTable::default()).unwrap_err(),
            FrameDiscard::Empty
        );
        assert_eq!(
            decode_frame(&[0xff, 0xff, 0xff], &KeyTable::default()).unwrap_err(),
            FrameDiscard::Malformed
        );
    }
}
