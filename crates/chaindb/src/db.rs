use std::sync::{Arc, Mutex, MutexGuard};

use btcidx_primitives::{hash_to_hex, Hash256};
use btcidx_storage::{Column, KeyValueStore, WriteBatch};
use rand::seq::SliceRandom;

use crate::records::{
    height_hash_key, key_to_height_hash, BlockId, HeaderRecord, PeerRecord,
};
use crate::ChainDbError;

const BEST_TIP_KEY: &[u8] = b"last";
const SCHEMA_VERSION_KEY: &[u8] = b"version";

pub const SCHEMA_VERSION: u32 = 1;

/// Write locking order across the chain namespaces:
///   BlockHeaders
///   BlocksMissing
///   Blocks
/// Batches are committed in the reverse order. If a crash leaves only the
/// earlier-committed namespaces on disk, the next run sees a block whose
/// missing marker survived and either re-fetches or re-inserts it, both
/// harmless; the opposite order would orphan a cleared marker.
pub struct ChainDb<S> {
    store: Arc<S>,
    headers_lock: Mutex<()>,
    missing_lock: Mutex<()>,
    blocks_lock: Mutex<()>,
    peers_lock: Mutex<()>,
}

impl<S: KeyValueStore> ChainDb<S> {
    /// Wraps an open store, writing the schema version on first use and
    /// refusing to operate on a store from a different schema.
    pub fn new(store: Arc<S>) -> Result<Self, ChainDbError> {
        match store.get(Column::Metadata, SCHEMA_VERSION_KEY)? {
            None => {
                store.put(
                    Column::Metadata,
                    SCHEMA_VERSION_KEY,
                    &SCHEMA_VERSION.to_be_bytes(),
                )?;
            }
            Some(bytes) => {
                let found = decode_schema_version(&bytes)?;
                if found != SCHEMA_VERSION {
                    return Err(ChainDbError::Corrupt(format!(
                        "schema version mismatch: store has {found}, expected {SCHEMA_VERSION}"
                    )));
                }
            }
        }
        Ok(Self {
            store,
            headers_lock: Mutex::new(()),
            missing_lock: Mutex::new(()),
            blocks_lock: Mutex::new(()),
            peers_lock: Mutex::new(()),
        })
    }

    pub fn version(&self) -> u32 {
        SCHEMA_VERSION
    }

    pub fn metadata_get(&self, key: &[u8]) -> Result<Vec<u8>, ChainDbError> {
        self.store
            .get(Column::Metadata, key)?
            .ok_or(ChainDbError::NotFound)
    }

    pub fn metadata_put(&self, key: &[u8], value: &[u8]) -> Result<(), ChainDbError> {
        self.store.put(Column::Metadata, key, value)?;
        Ok(())
    }

    /// Inserts a connected batch of header records, one missing-block
    /// marker per non-genesis entry, and advances the `"last"` sentinel to
    /// the batch tail. Returns `Duplicate` when the first record is
    /// already present, leaving the store untouched.
    pub fn headers_insert(&self, records: &[HeaderRecord]) -> Result<(), ChainDbError> {
        let tip = records.last().ok_or(ChainDbError::EmptyBatch)?;

        let _headers_guard = lock(&self.headers_lock)?;
        let _missing_guard = lock(&self.missing_lock)?;

        if self
            .store
            .get(Column::BlockHeaders, &records[0].hash)?
            .is_some()
        {
            return Err(ChainDbError::Duplicate);
        }

        let mut headers_batch = WriteBatch::new();
        let mut missing_batch = WriteBatch::new();
        for record in records {
            // Height 0 is genesis, which never gets a missing marker.
            if record.height > 0 {
                missing_batch.put(
                    Column::BlocksMissing,
                    height_hash_key(record.height, &record.hash),
                    Vec::new(),
                );
            }
            headers_batch.put(Column::BlockHeaders, record.hash, record.encode());
        }
        headers_batch.put(Column::BlockHeaders, BEST_TIP_KEY, tip.encode());

        // Reverse-order commit: missing markers land before the headers
        // that reference them.
        self.store.write_batch(&missing_batch)?;
        self.store.write_batch(&headers_batch)?;
        Ok(())
    }

    pub fn header_by_hash(&self, hash: &Hash256) -> Result<HeaderRecord, ChainDbError> {
        let bytes = self
            .store
            .get(Column::BlockHeaders, hash)?
            .ok_or(ChainDbError::NotFound)?;
        HeaderRecord::decode(&bytes)
    }

    /// The best tip, approximated as the most recently inserted batch
    /// tail. Empty on a fresh store; the caller bootstraps genesis.
    pub fn headers_best(&self) -> Result<Vec<HeaderRecord>, ChainDbError> {
        match self.store.get(Column::BlockHeaders, BEST_TIP_KEY)? {
            Some(bytes) => Ok(vec![HeaderRecord::decode(&bytes)?]),
            None => Ok(Vec::new()),
        }
    }

    /// The first `limit` missing blocks in height order. This is the block
    /// scheduler's work queue.
    pub fn blocks_missing(&self, limit: usize) -> Result<Vec<BlockId>, ChainDbError> {
        let entries = self
            .store
            .scan_prefix_limit(Column::BlocksMissing, &[], limit)?;
        let mut ids = Vec::with_capacity(entries.len());
        for (key, _) in entries {
            let (height, hash) = key_to_height_hash(&key)?;
            ids.push(BlockId { height, hash });
        }
        Ok(ids)
    }

    /// Persists a block body and clears its missing marker. Returns the
    /// block's height, resolved from the header record; a block without a
    /// header is `NotFound` and nothing is written.
    pub fn block_insert(&self, hash: &Hash256, block: &[u8]) -> Result<u64, ChainDbError> {
        let _headers_guard = lock(&self.headers_lock)?;
        let _missing_guard = lock(&self.missing_lock)?;
        let _blocks_guard = lock(&self.blocks_lock)?;

        let record_bytes = self
            .store
            .get(Column::BlockHeaders, hash)?
            .ok_or(ChainDbError::NotFound)?;
        let record = HeaderRecord::decode(&record_bytes)?;

        let mut missing_batch = WriteBatch::new();
        if record.height > 0 {
            let missing_key = height_hash_key(record.height, hash);
            if self.store.get(Column::BlocksMissing, &missing_key)?.is_some() {
                missing_batch.delete(Column::BlocksMissing, missing_key);
            } else {
                // Not fatal; the block was already inserted or never marked.
                eprintln!(
                    "block insert: no missing marker for {} at height {}",
                    hash_to_hex(hash),
                    record.height
                );
            }
        }

        let mut blocks_batch = WriteBatch::new();
        blocks_batch.put(Column::Blocks, *hash, block.to_vec());

        // Reverse-order commit: the body lands before its marker clears.
        self.store.write_batch(&blocks_batch)?;
        if !missing_batch.is_empty() {
            self.store.write_batch(&missing_batch)?;
        }
        Ok(record.height)
    }

    pub fn block_by_hash(&self, hash: &Hash256) -> Result<Vec<u8>, ChainDbError> {
        self.store
            .get(Column::Blocks, hash)?
            .ok_or(ChainDbError::NotFound)
    }

    /// Total missing-block markers; a diagnostic read.
    pub fn missing_count(&self) -> Result<u64, ChainDbError> {
        let mut count = 0u64;
        self.store
            .for_each_prefix(Column::BlocksMissing, &[], &mut |_, _| {
                count += 1;
                Ok(())
            })?;
        Ok(count)
    }

    /// Upserts address book entries. An existing record keeps its
    /// `created_at`; `last_seen` only moves forward.
    pub fn peers_insert(&self, peers: &[PeerRecord]) -> Result<(), ChainDbError> {
        if peers.is_empty() {
            return Ok(());
        }
        let _peers_guard = lock(&self.peers_lock)?;
        let mut batch = WriteBatch::new();
        for peer in peers {
            let key = PeerRecord::key(&peer.host, peer.port);
            let merged = match self.store.get(Column::Peers, &key)? {
                Some(bytes) => {
                    let existing = PeerRecord::decode(&bytes)?;
                    PeerRecord {
                        host: peer.host.clone(),
                        port: peer.port,
                        last_seen: existing.last_seen.max(peer.last_seen),
                        created_at: existing.created_at,
                    }
                }
                None => peer.clone(),
            };
            batch.put(Column::Peers, key, merged.encode());
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    pub fn peer_delete(&self, host: &str, port: u16) -> Result<(), ChainDbError> {
        let _peers_guard = lock(&self.peers_lock)?;
        self.store
            .delete(Column::Peers, &PeerRecord::key(host, port))?;
        Ok(())
    }

    /// Up to `count` peers chosen uniformly at random.
    pub fn peers_random(&self, count: usize) -> Result<Vec<PeerRecord>, ChainDbError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let entries = self.store.scan_prefix(Column::Peers, &[])?;
        let mut peers = Vec::with_capacity(entries.len());
        for (_, value) in entries {
            peers.push(PeerRecord::decode(&value)?);
        }
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(count);
        Ok(peers)
    }

    /// Good and bad peer counts. A peer is good once a handshake has
    /// stamped its `last_seen`.
    pub fn peers_stats(&self) -> Result<(usize, usize), ChainDbError> {
        let mut good = 0usize;
        let mut bad = 0usize;
        self.store
            .for_each_prefix(Column::Peers, &[], &mut |_, value| {
                match PeerRecord::decode(value) {
                    Ok(record) if record.last_seen > 0 => good += 1,
                    _ => bad += 1,
                }
                Ok(())
            })?;
        Ok((good, bad))
    }
}

fn lock(mutex: &Mutex<()>) -> Result<MutexGuard<'_, ()>, ChainDbError> {
    mutex
        .lock()
        .map_err(|_| ChainDbError::Corrupt("write lock poisoned".to_string()))
}

fn decode_schema_version(bytes: &[u8]) -> Result<u32, ChainDbError> {
    let array: [u8; 4] = bytes
        .try_into()
        .map_err(|_| ChainDbError::Corrupt("invalid schema version encoding".to_string()))?;
    Ok(u32::from_be_bytes(array))
}
