//! In-memory backend for sessions without a storage path.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{KvBackend, Mutation, StoreError, Table};

#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<Table, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a table.
    pub fn len(&self, table: Table) -> usize {
        self.tables
            .read()
            .map(|t| t.get(&table).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        Ok(tables.get(&table).and_then(|t| t.get(key)).cloned())
    }

    fn scan_prefix(&self, table: Table, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        let Some(entries) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, batch: Vec<Mutation>) -> Result<(), StoreError> {
        // Single write lock for the whole batch keeps it atomic for readers.
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        for mutation in batch {
            match mutation {
                Mutation::Put { table, key, value } => {
                    tables.entry(table).or_default().insert(key, value);
                }
                Mutation::Delete { table, key } => {
                    if let Some(entries) = tables.get_mut(&table) {
                        entries.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}
