//! Cluster key routing.
//!
//! Keys map to one of [`SLOT_COUNT`] slots via CRC16 (XMODEM variant, polynomial `0x1021`). When
//! a key contains a non-empty hash tag (`{...}`), only the tag is hashed, so related keys such as
//! `{user1000}.following` and `{user1000}.followers` land on the same node.

use std::fmt;
use std::sync::OnceLock;

use bytes::Bytes;

/// Number of routing slots in a cluster.
pub const SLOT_COUNT: u16 = 16384;

const CRC16_TABLE: [u16; 256] = crc16_table();

const fn crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

pub fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |crc, &byte| {
        (crc << 8) ^ CRC16_TABLE[(((crc >> 8) as u8) ^ byte) as usize]
    })
}

/// The part of `key` that is hashed: the bytes between the first `{` and the next `}` when that
/// span is non-empty, the whole key otherwise.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };

    match key[open + 1..].iter().position(|&b| b == b'}') {
        Some(len) if len > 0 => &key[open + 1..open + 1 + len],
        _ => key,
    }
}

pub fn hash_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}

/// An immutable key that computes its slot lazily, once.
#[derive(Clone)]
pub struct Key {
    bytes: Bytes,
    slot: OnceLock<u16>,
}

impl Key {
    pub fn new(bytes: impl Into<Bytes>) -> Key {
        Key {
            bytes: bytes.into(),
            slot: OnceLock::new(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn slot(&self) -> u16 {
        *self.slot.get_or_init(|| hash_slot(&self.bytes))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Key {}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Key")
            .field(&String::from_utf8_lossy(&self.bytes))
            .finish()
    }
}

impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Key::new(Bytes::copy_from_slice(key.as_bytes()))
    }
}

impl From<String> for Key {
    fn from(key: String) -> Self {
        Key::new(key)
    }
}

impl From<Bytes> for Key {
    fn from(key: Bytes) -> Self {
        Key::new(key)
    }
}

impl From<Key> for Bytes {
    fn from(key: Key) -> Self {
        key.bytes
    }
}
