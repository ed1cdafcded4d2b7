use std::time::{SystemTime, UNIX_EPOCH};

use btcidx_primitives::encoding::{Decoder, Encoder};
use btcidx_primitives::{BlockHeader, Hash256, HEADER_SIZE};

use crate::ChainDbError;

/// Version prefix carried by every persisted value.
pub const RECORD_VERSION: u8 = 1;

/// Missing-block key: big-endian height, a zero separator, then the block
/// hash. Sorts ascending by height then hash, so an in-order scan yields
/// the oldest missing block first.
pub const MISSING_KEY_SIZE: usize = 8 + 1 + 32;

pub fn height_hash_key(height: u64, hash: &Hash256) -> [u8; MISSING_KEY_SIZE] {
    let mut key = [0u8; MISSING_KEY_SIZE];
    key[0..8].copy_from_slice(&height.to_be_bytes());
    key[9..].copy_from_slice(hash);
    key
}

pub fn key_to_height_hash(key: &[u8]) -> Result<(u64, Hash256), ChainDbError> {
    if key.len() != MISSING_KEY_SIZE {
        return Err(ChainDbError::Corrupt(format!(
            "invalid missing-block key size: {}",
            key.len()
        )));
    }
    let mut height_bytes = [0u8; 8];
    height_bytes.copy_from_slice(&key[0..8]);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&key[9..]);
    Ok((u64::from_be_bytes(height_bytes), hash))
}

/// A block identified by hash and, where known, height. The height from a
/// peer `inv` announcement is a placeholder zero until the header record
/// resolves it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockId {
    pub height: u64,
    pub hash: Hash256,
}

/// Canonical header record: created once, never mutated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderRecord {
    pub hash: Hash256,
    pub height: u64,
    pub created_at: u64,
    pub header: BlockHeader,
}

impl HeaderRecord {
    pub fn new(height: u64, header: BlockHeader) -> Self {
        Self {
            hash: header.hash(),
            height,
            created_at: unix_now_secs(),
            header,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(1 + 32 + 8 + 8 + HEADER_SIZE);
        encoder.write_u8(RECORD_VERSION);
        encoder.write_hash(&self.hash);
        encoder.write_u64_le(self.height);
        encoder.write_u64_le(self.created_at);
        self.header.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChainDbError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8().map_err(corrupt)?;
        if version != RECORD_VERSION {
            return Err(ChainDbError::Corrupt(format!(
                "unknown header record version: {version}"
            )));
        }
        let hash = decoder.read_hash().map_err(corrupt)?;
        let height = decoder.read_u64_le().map_err(corrupt)?;
        let created_at = decoder.read_u64_le().map_err(corrupt)?;
        let header = BlockHeader::consensus_decode(&mut decoder).map_err(corrupt)?;
        Ok(Self {
            hash,
            height,
            created_at,
            header,
        })
    }
}

/// Long-lived address book entry. The key concatenates host and port
/// without a separator, so the value carries both, length-prefixed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerRecord {
    pub host: String,
    pub port: u16,
    pub last_seen: u64,
    pub created_at: u64,
}

impl PeerRecord {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            last_seen: 0,
            created_at: unix_now_secs(),
        }
    }

    pub fn key(host: &str, port: u16) -> Vec<u8> {
        let port = port.to_string();
        let mut key = Vec::with_capacity(host.len() + port.len());
        key.extend_from_slice(host.as_bytes());
        key.extend_from_slice(port.as_bytes());
        key
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(1 + 2 + self.host.len() + 2 + 8 + 8);
        encoder.write_u8(RECORD_VERSION);
        encoder.write_u16_le(self.host.len() as u16);
        encoder.write_bytes(self.host.as_bytes());
        encoder.write_u16_le(self.port);
        encoder.write_u64_le(self.last_seen);
        encoder.write_u64_le(self.created_at);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChainDbError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8().map_err(corrupt)?;
        if version != RECORD_VERSION {
            return Err(ChainDbError::Corrupt(format!(
                "unknown peer record version: {version}"
            )));
        }
        let host_len = decoder.read_u16_le().map_err(corrupt)? as usize;
        let host_bytes = decoder.read_bytes(host_len).map_err(corrupt)?;
        let host = String::from_utf8(host_bytes.to_vec())
            .map_err(|_| ChainDbError::Corrupt("peer host is not utf-8".to_string()))?;
        let port = decoder.read_u16_le().map_err(corrupt)?;
        let last_seen = decoder.read_u64_le().map_err(corrupt)?;
        let created_at = decoder.read_u64_le().map_err(corrupt)?;
        Ok(Self {
            host,
            port,
            last_seen,
            created_at,
        })
    }
}

pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

fn corrupt(err: btcidx_primitives::encoding::DecodeError) -> ChainDbError {
    ChainDbError::Corrupt(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [0x11; 32],
            merkle_root: [0x22; 32],
            time: 1231006505,
            bits: 0x1d00ffff,
            nonce: 7,
        }
    }

    #[test]
    fn missing_key_sorts_by_height_then_hash() {
        let low = height_hash_key(1, &[0xff; 32]);
        let high = height_hash_key(2, &[0x00; 32]);
        assert!(low.as_slice() < high.as_slice());

        let (height, hash) = key_to_height_hash(&high).expect("parse");
        assert_eq!(height, 2);
        assert_eq!(hash, [0x00; 32]);
    }

    #[test]
    fn header_record_roundtrip() {
        let record = HeaderRecord {
            hash: sample_header().hash(),
            height: 42,
            created_at: 1700000000,
            header: sample_header(),
        };
        let decoded = HeaderRecord::decode(&record.encode()).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn header_record_rejects_unknown_version() {
        let mut bytes = HeaderRecord::new(1, sample_header()).encode();
        bytes[0] = 9;
        assert!(matches!(
            HeaderRecord::decode(&bytes),
            Err(ChainDbError::Corrupt(_))
        ));
    }

    #[test]
    fn peer_record_roundtrip() {
        let record = PeerRecord {
            host: "203.0.113.7".to_string(),
            port: 8333,
            last_seen: 1700000001,
            created_at: 1700000000,
        };
        let decoded = PeerRecord::decode(&record.encode()).expect("decode");
        assert_eq!(decoded, record);
        assert_eq!(
            PeerRecord::key(&record.host, record.port),
            b"203.0.113.78333".to_vec()
        );
    }
}
