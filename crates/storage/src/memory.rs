use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteOp, ALL_COLUMNS};

/// BTreeMap-backed store. Keeps the same ordered-iteration contract as the
/// on-disk backend, which the missing-blocks queue relies on.
pub struct MemoryStore {
    columns: Mutex<HashMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut columns = HashMap::new();
        for column in ALL_COLUMNS {
            columns.insert(column, BTreeMap::new());
        }
        Self {
            columns: Mutex::new(columns),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let columns = self.columns.lock().map_err(|_| poisoned())?;
        Ok(columns
            .get(&column)
            .and_then(|tree| tree.get(key))
            .cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.lock().map_err(|_| poisoned())?;
        if let Some(tree) = columns.get_mut(&column) {
            tree.insert(key.to_vec(), value.to_vec());
        }
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.lock().map_err(|_| poisoned())?;
        if let Some(tree) = columns.get_mut(&column) {
            tree.remove(key);
        }
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.scan_prefix_limit(column, prefix, usize::MAX)
    }

    fn scan_prefix_limit(
        &self,
        column: Column,
        prefix: &[u8],
        limit: usize,
    ) -> Result<ScanResult, StoreError> {
        let columns = self.columns.lock().map_err(|_| poisoned())?;
        let mut results = Vec::new();
        if let Some(tree) = columns.get(&column) {
            for (key, value) in tree.range(prefix.to_vec()..) {
                if !key.starts_with(prefix) || results.len() >= limit {
                    break;
                }
                results.push((key.clone(), value.clone()));
            }
        }
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let columns = self.columns.lock().map_err(|_| poisoned())?;
        if let Some(tree) = columns.get(&column) {
            for (key, value) in tree.range(prefix.to_vec()..) {
                if !key.starts_with(prefix) {
                    break;
                }
                visitor(key, value)?;
            }
        }
        Ok(())
    }

    fn write_batch(&self, batch: &crate::WriteBatch) -> Result<(), StoreError> {
        let mut columns = self.columns.lock().map_err(|_| poisoned())?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    if let Some(tree) = columns.get_mut(column) {
                        tree.insert(key.as_slice().to_vec(), value.clone());
                    }
                }
                WriteOp::Delete { column, key } => {
                    if let Some(tree) = columns.get_mut(column) {
                        tree.remove(key.as_slice());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WriteBatch;

    #[test]
    fn scan_is_ordered() {
        let store = MemoryStore::new();
        store.put(Column::BlocksMissing, &[0, 2], b"b").expect("put");
        store.put(Column::BlocksMissing, &[0, 1], b"a").expect("put");
        store.put(Column::BlocksMissing, &[1, 0], b"c").expect("put");

        let all = store.scan_prefix(Column::BlocksMissing, &[]).expect("scan");
        let keys: Vec<Vec<u8>> = all.into_iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec![vec![0, 1], vec![0, 2], vec![1, 0]]);

        let limited = store
            .scan_prefix_limit(Column::BlocksMissing, &[0], 1)
            .expect("scan");
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].0, vec![0, 1]);
    }

    #[test]
    fn batch_applies_all_ops() {
        let store = MemoryStore::new();
        store.put(Column::Blocks, b"gone", b"x").expect("put");

        let mut batch = WriteBatch::new();
        batch.put(Column::Blocks, b"new".as_slice(), b"y".to_vec());
        batch.delete(Column::Blocks, b"gone".as_slice());
        store.write_batch(&batch).expect("commit");

        assert_eq!(store.get(Column::Blocks, b"new").expect("get"), Some(b"y".to_vec()));
        assert_eq!(store.get(Column::Blocks, b"gone").expect("get"), None);
    }

    #[test]
    fn columns_are_isolated() {
        let store = MemoryStore::new();
        store.put(Column::Blocks, b"k", b"v").expect("put");
        assert_eq!(store.get(Column::BlockHeaders, b"k").expect("get"), None);
    }
}
