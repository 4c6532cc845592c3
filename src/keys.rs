// src/keys.rs

use crate::models::ChunkRange;
use thiserror::Error;

/// Every key in a chunk store is exactly this long: a tag byte and two `i64`s.
pub const KEY_LEN: usize = 17;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key length is {0}, expected {KEY_LEN}")]
    Length(usize),
    #[error("unknown key tag {0:#04x}")]
    UnknownTag(u8),
    #[error("negative range endpoint in key: {begin}-{end}")]
    Negative { begin: i64, end: i64 },
    #[error("key range end {end} is before begin {begin}")]
    Inverted { begin: i64, end: i64 },
}

/// What a key's presence means in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// The chunk has not been downloaded yet.
    Pending,
    /// The chunk's bytes, keyed by its range.
    Data,
    /// Plan record: file size and chunk size of a committed plan.
    Count,
}

impl KeyKind {
    pub fn tag(self) -> u8 {
        match self {
            KeyKind::Pending => b'T',
            KeyKind::Data => b'D',
            KeyKind::Count => b'N',
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, KeyError> {
        match tag {
            b'T' => Ok(KeyKind::Pending),
            b'D' => Ok(KeyKind::Data),
            b'N' => Ok(KeyKind::Count),
            other => Err(KeyError::UnknownTag(other)),
        }
    }
}

/// A decoded store key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub kind: KeyKind,
    pub range: ChunkRange,
}

impl ChunkKey {
    pub fn pending(range: ChunkRange) -> Self {
        Self { kind: KeyKind::Pending, range }
    }

    pub fn data(range: ChunkRange) -> Self {
        Self { kind: KeyKind::Data, range }
    }

    /// The single plan record of a store.
    pub fn count() -> Self {
        Self {
            kind: KeyKind::Count,
            range: ChunkRange::ZERO,
        }
    }

    /// Same range, different tag. Turns a pending marker into its data key.
    pub fn with_kind(self, kind: KeyKind) -> Self {
        Self { kind, ..self }
    }

    pub fn encode(&self) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        key[0] = self.kind.tag();
        key[1..9].copy_from_slice(&self.range.begin_i64().to_be_bytes());
        key[9..17].copy_from_slice(&self.range.end_i64().to_be_bytes());
        key
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != KEY_LEN {
            return Err(KeyError::Length(bytes.len()));
        }
        let kind = KeyKind::from_tag(bytes[0])?;
        let begin = read_i64(&bytes[1..9]);
        let end = read_i64(&bytes[9..17]);
        if begin < 0 || end < 0 {
            return Err(KeyError::Negative { begin, end });
        }
        if end < begin {
            return Err(KeyError::Inverted { begin, end });
        }
        Ok(Self {
            kind,
            range: ChunkRange {
                begin: begin as u64,
                end: end as u64,
            },
        })
    }
}

/// Reads the tag of a raw key without validating the rest of it.
pub fn peek_kind(bytes: &[u8]) -> Option<KeyKind> {
    bytes.first().and_then(|tag| KeyKind::from_tag(*tag).ok())
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    i64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_key_layout() {
        let key = ChunkKey::pending(ChunkRange::new(40, 79).unwrap()).encode();
        assert_eq!(key[0], b'T');
        assert_eq!(&key[1..9], &40i64.to_be_bytes());
        assert_eq!(&key[9..17], &79i64.to_be_bytes());
    }

    #[test]
    fn swapping_kind_keeps_range() {
        let pending = ChunkKey::pending(ChunkRange::new(0, 4095).unwrap());
        let data = pending.with_kind(KeyKind::Data);
        assert_eq!(data.encode()[0], b'D');
        assert_eq!(&data.encode()[1..], &pending.encode()[1..]);
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(ChunkKey::decode(b"T123"), Err(KeyError::Length(4)));
        assert_eq!(ChunkKey::decode(&[]), Err(KeyError::Length(0)));
    }

    #[test]
    fn rejects_inverted_range() {
        let mut key = [0u8; KEY_LEN];
        key[0] = b'T';
        key[1..9].copy_from_slice(&10i64.to_be_bytes());
        key[9..17].copy_from_slice(&9i64.to_be_bytes());
        assert_eq!(
            ChunkKey::decode(&key),
            Err(KeyError::Inverted { begin: 10, end: 9 })
        );
    }

    #[test]
    fn rejects_negative_and_unknown_tag() {
        let mut key = [0u8; KEY_LEN];
        key[0] = b'T';
        key[1..9].copy_from_slice(&(-1i64).to_be_bytes());
        assert!(matches!(ChunkKey::decode(&key), Err(KeyError::Negative { .. })));

        key[0] = b'X';
        assert_eq!(ChunkKey::decode(&key), Err(KeyError::UnknownTag(b'X')));
    }

    #[test]
    fn peek_reads_only_the_tag() {
        assert_eq!(peek_kind(b"D"), Some(KeyKind::Data));
        assert_eq!(peek_kind(b"?"), None);
        assert_eq!(peek_kind(b""), None);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn any_kind() -> impl Strategy<Value = KeyKind> {
            prop_oneof![
                Just(KeyKind::Pending),
                Just(KeyKind::Data),
                Just(KeyKind::Count)
            ]
        }

        proptest! {
            #[test]
            fn encode_decode_encode_is_stable(
                kind in any_kind(),
                begin in 0u64..=(i64::MAX as u64),
                len in 0u64..1_000_000,
            ) {
                let end = begin.saturating_add(len).min(i64::MAX as u64);
                let key = ChunkKey { kind, range: ChunkRange::new(begin, end).unwrap() };
                let bytes = key.encode();
                let decoded = ChunkKey::decode(&bytes)?;
                prop_assert_eq!(decoded, key);
                prop_assert_eq!(decoded.encode(), bytes);
            }
        }
    }
}
