//! Stream framer for the Meshtastic device link (serial and TCP alike).
//!
//! Every protobuf travels as:
//!
//!   `0x94 0xC3 <len_hi> <len_lo> <protobuf bytes>`
//!
//! The framer can be fed arbitrary chunks and yields whole frames when available. Bytes
//! outside a frame (boot log text, line noise) are skipped by scanning for the next `0x94`;
//! a header declaring an empty or oversize frame drops one byte and rescans.
use bytes::{Buf, BytesMut};
use thiserror::Error;

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
pub const HEADER_LEN: usize = 4;

/// Largest protobuf the firmware sends or accepts in one frame.
pub const MAX_FRAME_LEN: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_LEN)]
pub struct FrameTooLarge(pub usize);

/// Wrap one protobuf in a stream header.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameTooLarge> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(START1);
    out.push(START2);
    out.push(((payload.len() >> 8) & 0xFF) as u8);
    out.push((payload.len() & 0xFF) as u8);
    out.extend_from_slice(payload);
    Ok(out)
}

pub struct StreamFramer {
    buf: BytesMut,
    skipped: u64,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            skipped: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes discarded while resynchronising so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn drop_front(&mut self, n: usize) {
        self.buf.advance(n);
        self.skipped += n as u64;
    }

    /// Next complete frame payload, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            // realign to a header start
            match self.buf.iter().position(|&b| b == START1) {
                Some(0) => {}
                Some(pos) => self.drop_front(pos),
                None => {
                    let n = self.buf.len();
                    self.drop_front(n);
                    return None;
                }
            }
            if self.buf.len() < 2 {
                return None;
            }
            if self.buf[1] != START2 {
                self.drop_front(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            let declared = ((self.buf[2] as usize) << 8) | (self.buf[3] as usize);
            if declared == 0 || declared > MAX_FRAME_LEN {
                self.drop_front(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + declared {
                return None;
            }
            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(declared).to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_split_across_chunks() {
        let framed = encode_frame(&[1, 2, 3, 4, 5]).unwrap();
        let mut f = StreamFramer::new();
        f.push(&framed[..3]);
        assert_eq!(f.next_frame(), None);
        f.push(&framed[3..6]);
        assert_eq!(f.next_frame(), None);
        f.push(&framed[6..]);
        assert_eq!(f.next_frame(), Some(vec![1, 2, 3, 4, 5]));
        assert_eq!(f.next_frame(), None);
        assert_eq!(f.skipped(), 0);
    }

    #[test]
    fn skips_log_text_between_frames() {
        let mut stream = b"INFO | booting\r\n".to_vec();
        stream.extend(encode_frame(b"abc").unwrap());
        stream.extend(b"\x94garbage");
        stream.extend(encode_frame(b"de").unwrap());
        let mut f = StreamFramer::new();
        f.push(&stream);
        assert_eq!(f.next_frame(), Some(b"abc".to_vec()));
        assert_eq!(f.next_frame(), Some(b"de".to_vec()));
        assert_eq!(f.next_frame(), None);
        assert!(f.skipped() >= 16);
    }

    #[test]
    fn oversize_and_empty_headers_resync() {
        let mut stream = vec![START1, START2, 0x02, 0x01];
        stream.extend([START1, START2, 0x00, 0x00]);
        stream.extend(encode_frame(&[9]).unwrap());
        let mut f = StreamFramer::new();
        f.push(&stream);
        assert_eq!(f.next_frame(), Some(vec![9]));
        assert_eq!(f.buffered(), 0);
    }

    #[test]
    fn encode_rejects_oversize() {
        assert_eq!(
            encode_frame(&vec![0u8; MAX_FRAME_LEN + 1]),
            Err(FrameTooLarge(MAX_FRAME_LEN + 1))
        );
        let ok = encode_frame(&vec![7u8; MAX_FRAME_LEN]).unwrap();
        assert_eq!(&ok[..4], &[START1, START2, 0x02, 0x00]);
    }
}
