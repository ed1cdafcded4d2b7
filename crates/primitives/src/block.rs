use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::{sha256d, Hash256};

/// Serialized size of a block header on the wire.
pub const HEADER_SIZE: usize = 80;

/// An 80-byte Bitcoin block header: version, previous block hash, merkle
/// root, timestamp, difficulty bits, and nonce, all little-endian.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.consensus_encode(&mut encoder);
        let bytes = encoder.into_inner();
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&bytes);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        Self::consensus_decode(&mut decoder)
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_to_hex;

    // Bitcoin mainnet genesis header, field by field.
    const GENESIS_HEADER_HEX: &str = concat!(
        "01000000",
        "0000000000000000000000000000000000000000000000000000000000000000",
        "3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a",
        "29ab5f49",
        "ffff001d",
        "1dac2b7c",
    );

    fn hex_to_bytes(hex: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(hex.len() / 2);
        let raw = hex.as_bytes();
        for pair in raw.chunks(2) {
            let high = (pair[0] as char).to_digit(16).expect("hex") as u8;
            let low = (pair[1] as char).to_digit(16).expect("hex") as u8;
            bytes.push(high << 4 | low);
        }
        bytes
    }

    #[test]
    fn genesis_header_decode_and_hash() {
        let bytes = hex_to_bytes(GENESIS_HEADER_HEX);
        assert_eq!(bytes.len(), HEADER_SIZE);
        let header = BlockHeader::from_bytes(&bytes).expect("decode");
        assert_eq!(header.version, 1);
        assert_eq!(header.prev_block, [0u8; 32]);
        assert_eq!(header.time, 1231006505);
        assert_eq!(header.bits, 0x1d00ffff);
        assert_eq!(header.nonce, 2083236893);
        assert_eq!(
            hash_to_hex(&header.hash()),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(header.to_bytes().as_slice(), bytes.as_slice());
    }

    #[test]
    fn short_header_rejected() {
        assert!(BlockHeader::from_bytes(&[0u8; 79]).is_err());
    }
}
