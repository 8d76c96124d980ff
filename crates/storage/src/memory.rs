use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::{KeyValueStore, PrefixVisitor, ScanResult, StoreError, Table, WriteBatch, WriteOp, ALL_TABLES};

/// In-memory store used by tests and the `memory` backend.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut tables = BTreeMap::new();
        for table in ALL_TABLES {
            tables.insert(table, BTreeMap::new());
        }
        Self {
            tables: Mutex::new(tables),
        }
    }
}

fn lock_poisoned() -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let tables = self.tables.lock().map_err(|_| lock_poisoned())?;
        Ok(tables
            .get(&table)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().map_err(|_| lock_poisoned())?;
        tables
            .entry(table)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, table: Table, key: &[u8]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().map_err(|_| lock_poisoned())?;
        if let Some(entries) = tables.get_mut(&table) {
            entries.remove(key);
        }
        Ok(())
    }

    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let tables = self.tables.lock().map_err(|_| lock_poisoned())?;
        let mut results = Vec::new();
        if let Some(entries) = tables.get(&table) {
            for (key, value) in entries.range(prefix.to_vec()..) {
                if !key.starts_with(prefix) {
                    break;
                }
                results.push((key.clone(), value.clone()));
            }
        }
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        table: Table,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        for (key, value) in self.scan_prefix(table, prefix)? {
            visitor(&key, &value)?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().map_err(|_| lock_poisoned())?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { table, key, value } => {
                    tables
                        .entry(*table)
                        .or_default()
                        .insert(key.as_slice().to_vec(), value.clone());
                }
                WriteOp::Delete { table, key } => {
                    if let Some(entries) = tables.get_mut(table) {
                        entries.remove(key.as_slice());
                    }
                }
            }
        }
        Ok(())
    }
}
