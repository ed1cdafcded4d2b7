use sha2::{Digest, Sha256};

pub type Hash256 = [u8; 32];

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Hex in display order (reversed byte order, as block explorers print it).
pub fn hash_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push(hex_digit(byte >> 4));
        out.push(hex_digit(byte & 0x0f));
    }
    out
}

/// Parses display-order hex back into internal byte order.
pub fn hash_from_hex(hex: &str) -> Option<Hash256> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    let bytes = hex.as_bytes();
    for i in 0..32 {
        let high = (bytes[i * 2] as char).to_digit(16)? as u8;
        let low = (bytes[i * 2 + 1] as char).to_digit(16)? as u8;
        out[31 - i] = high << 4 | low;
    }
    Some(out)
}

fn hex_digit(value: u8) -> char {
    match value {
        0..=9 => (b'0' + value) as char,
        _ => (b'a' + (value - 10)) as char,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_empty() {
        let digest = sha256d(b"");
        assert_eq!(
            hash_to_hex(&digest),
            "56944c5d3f98413ef45cf54545538103cc9f298e0575820ad3591376e2e0f65d"
        );
    }

    #[test]
    fn hex_roundtrip() {
        let hex = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash = hash_from_hex(hex).expect("parse");
        assert_eq!(hash_to_hex(&hash), hex);
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert!(hash_from_hex("abcd").is_none());
        assert!(hash_from_hex(&"zz".repeat(32)).is_none());
    }
}
