//! Channel payload decryption.
//!
//! Meshtastic encrypts the `Data` payload of a packet with AES-128 in counter mode. The
//! 16-byte initial counter block is built from the packet identity:
//!
//! ```text
//! bytes  0..8   packet id, little endian u64
//! bytes  8..12  sender node number, little endian u32
//! bytes 12..16  block counter, big endian u32, starting at 0
//! ```
//!
//! CTR mode is symmetric, so [`apply_keystream`] both encrypts and decrypts.

use std::collections::HashMap;
use std::fmt;

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use thiserror::Error;

type Aes128Ctr = ctr::Ctr32BE<Aes128>;

/// Well-known key of the default `LongFast` channel (PSK index 1, published as `AQ==`).
pub const DEFAULT_PSK: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69, 0x01,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("channel key must be 32 hex characters, got {0} characters")]
    BadLength(usize),
    #[error("channel key is not valid hex: {0}")]
    BadHex(String),
    #[error("simple key index must be between 1 and 255: {0}")]
    BadSimpleIndex(String),
}

/// A 128-bit channel key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChannelKey([u8; 16]);

impl ChannelKey {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn default_key() -> Self {
        Self(DEFAULT_PSK)
    }

    /// Parse a configured key: `default`, `simple<N>` (the default key with its last byte
    /// advanced by N-1, as the firmware derives its numbered PSKs) or 32 hex characters.
    pub fn parse(text: &str) -> Result<Self, KeyError> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("default") {
            return Ok(Self::default_key());
        }
        if let Some(idx) = text.strip_prefix("simple") {
            let n: u8 = idx
                .parse()
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| KeyError::BadSimpleIndex(text.to_string()))?;
            let mut key = DEFAULT_PSK;
            key[15] = key[15].wrapping_add(n - 1);
            return Ok(Self(key));
        }
        if text.len() != 32 {
            return Err(KeyError::BadLength(text.len()));
        }
        let bytes = hex::decode(text).map_err(|e| KeyError::BadHex(e.to_string()))?;
        let mut key = [0u8; 16];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print key material
        write!(f, "ChannelKey(..{:02x})", self.0[15])
    }
}

/// Key lookup by channel name (the envelope's `channel_id`).
pub trait ChannelKeys: Send + Sync {
    fn key_for(&self, channel_id: &str) -> Option<ChannelKey>;
}

impl<F> ChannelKeys for F
where
    F: Fn(&str) -> Option<ChannelKey> + Send + Sync,
{
    fn key_for(&self, channel_id: &str) -> Option<ChannelKey> {
        self(channel_id)
    }
}

/// Configured per-channel keys with a fallback for every other channel.
#[derive(Debug, Clone)]
pub struct KeyTable {
    fallback: Option<ChannelKey>,
    channels: HashMap<String, ChannelKey>,
}

impl KeyTable {
    pub fn new(fallback: Option<ChannelKey>) -> Self {
        Self {
            fallback,
            channels: HashMap::new(),
        }
    }

    pub fn with_channel(mut self, channel_id: &str, key: ChannelKey) -> Self {
        self.channels.insert(channel_id.to_string(), key);
        self
    }

    pub fn insert(&mut self, channel_id: &str, key: ChannelKey) {
        self.channels.insert(channel_id.to_string(), key);
    }
}

impl Default for KeyTable {
    fn default() -> Self {
        Self::new(Some(ChannelKey::default_key()))
    }
}

impl ChannelKeys for KeyTable {
    fn key_for(&self, channel_id: &str) -> Option<ChannelKey> {
        self.channels.get(channel_id).copied().or(self.fallback)
    }
}

/// Initial counter block for one packet.
///
/// Bytes 12..16 start at zero and are advanced by [`Aes128Ctr`] as a big-endian counter,
/// the way the radio firmware does it. A little-endian counter produces the same first
/// block only, so payloads longer than 16 bytes would decrypt differently.
pub fn nonce(packet_id: u32, from: u32) -> [u8; 16] {
    let mut n = [0u8; 16];
    n[0..8].copy_from_slice(&u64::from(packet_id).to_le_bytes());
    n[8..12].copy_from_slice(&from.to_le_bytes());
    n
}

/// XOR `buf` in place with the keystream for `(packet_id, from)`.
pub fn apply_keystream(key: &ChannelKey, packet_id: u32, from: u32, buf: &mut [u8]) {
    let iv = nonce(packet_id, from);
    let mut cipher = Aes128Ctr::new(key.as_bytes().into(), &iv.into());
    cipher.apply_keystream(buf);
}

pub fn decrypt(key: &ChannelKey, packet_id: u32, from: u32, ciphertext: &[u8]) -> Vec<u8> {
    let mut out = ciphertext.to_vec();
    apply_keystream(key, packet_id, from, &mut out);
    out
}

pub fn encrypt(key: &ChannelKey, packet_id: u32, from: u32, plaintext: &[u8]) -> Vec<u8> {
    decrypt(key, packet_id, from, plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_layout_matches_firmware() {
        let n = nonce(0x0102_0304, 0xaabb_ccdd);
        assert_eq!(&n[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&n[4..8], &[0, 0, 0, 0]);
        assert_eq!(&n[8..12], &[0xdd, 0xcc, 0xbb, 0xaa]);
        assert_eq!(&n[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn block_counter_is_big_endian() {
        use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};

        let key = ChannelKey::default_key();
        let keystream = encrypt(&key, 42, 0x0102_0304, &[0u8; 32]);
        let aes = Aes128::new(key.as_bytes().into());
        let mut counter = nonce(42, 0x0102_0304);
        for (i, chunk) in keystream.chunks(16).enumerate() {
            counter[12..16].copy_from_slice(&(i as u32).to_be_bytes());
            let mut block = GenericArray::from(counter);
            aes.encrypt_block(&mut block);
            assert_eq!(chunk, block.as_slice(), "block {}", i);
        }
    }

    #[test]
    fn encrypt_then_decrypt_restores_plaintext() {
        let key = ChannelKey::default_key();
        let plain: Vec<u8> = (0u8..=70).collect(); // spans several blocks
        let ct = encrypt(&key, 1234, 0xdeadbeef, &plain);
        assert_ne!(ct, plain);
        assert_eq!(decrypt(&key, 1234, 0xdeadbeef, &ct), plain);
        // a different packet id yields a different keystream
        assert_ne!(decrypt(&key, 1235, 0xdeadbeef, &ct), plain);
    }

    #[test]
    fn parses_named_and_hex_keys() {
        assert_eq!(ChannelKey::parse("default").unwrap(), ChannelKey::default_key());
        assert_eq!(ChannelKey::parse("simple1").unwrap(), ChannelKey::default_key());
        let s3 = ChannelKey::parse("simple3").unwrap();
        assert_eq!(s3.as_bytes()[15], 0x03);
        let hexed = ChannelKey::parse("d4f1bb3a20290759f0bcffabcf4e6901").unwrap();
        assert_eq!(hexed, ChannelKey::default_key());
        assert_eq!(ChannelKey::parse("abcd"), Err(KeyError::BadLength(4)));
        assert!(matches!(ChannelKey::parse("simple0"), Err(KeyError::BadSimpleIndex(_))));
        assert!(matches!(
            ChannelKey::parse("zz000000000000000000000000000000"),
            Err(KeyError::BadHex(_))
        ));
    }

    #[test]
    fn key_table_prefers_channel_key_then_fallback() {
        let private = ChannelKey::new([7u8; 16]);
        let table = KeyTable::default().with_channel("Ops", private);
        assert_eq!(table.key_for("Ops"), Some(private));
        assert_eq!(table.key_for("LongFast"), Some(ChannelKey::default_key()));
        assert_eq!(KeyTable::new(None).key_for("LongFast"), None);
    }

    #[test]
    fn closures_are_key_lookups() {
        let lookup = |ch: &str| (ch == "LongFast").then(ChannelKey::default_key);
        assert!(lookup.key_for("LongFast").is_some());
        assert!(lookup.key_for("Other").is_none());
    }
}
