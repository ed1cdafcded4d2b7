//! Typed chain store over the key-value engine: block headers, the
//! height-ordered missing-blocks queue, block bodies, the peer address
//! book, and schema metadata.

use std::fmt;

use btcidx_storage::StoreError;

pub mod db;
pub mod records;

pub use db::ChainDb;
pub use records::{BlockId, HeaderRecord, PeerRecord};

#[derive(Debug)]
pub enum ChainDbError {
    /// The requested record does not exist. Expected in many control
    /// paths (first boot, block arriving before its header).
    NotFound,
    /// The first header of an insert batch is already present.
    Duplicate,
    /// An insert batch was empty.
    EmptyBatch,
    /// A persisted record failed to decode, or an internal lock was
    /// poisoned.
    Corrupt(String),
    Store(StoreError),
}

impl fmt::Display for ChainDbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainDbError::NotFound => write!(f, "not found"),
            ChainDbError::Duplicate => write!(f, "duplicate"),
            ChainDbError::EmptyBatch => write!(f, "empty batch"),
            ChainDbError::Corrupt(message) => write!(f, "corrupt: {message}"),
            ChainDbError::Store(err) => write!(f, "store: {err}"),
        }
    }
}

impl std::error::Error for ChainDbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChainDbError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ChainDbError {
    fn from(err: StoreError) -> Self {
        ChainDbError::Store(err)
    }
}
