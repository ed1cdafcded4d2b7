//! Block header type, hashing, and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;

pub use block::{BlockHeader, HEADER_SIZE};
pub use hash::{hash_from_hex, hash_to_hex, sha256, sha256d, Hash256};
