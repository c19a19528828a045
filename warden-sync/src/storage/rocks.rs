//! RocksDB-backed storage.
//!
//! Column families:
//! - `locks`: active lock records (JSON)
//! - `revisions`: revision counters (u64 big-endian), never deleted
//! - `ledger`: subordinate ledger entries (bincode)
//!
//! Batches map onto a single `WriteBatch`, so a commit lands entirely or not
//! at all.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBWithThreadMode, Direction,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{KvBackend, Mutation, StoreError, Table};

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 16MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every batch (default: true; commits are rare and must survive crashes)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("warden_data"),
            block_cache_size: 16 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

pub struct RocksBackend {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksBackend {
    /// Open the database, creating it and its column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Table::ALL
            .iter()
            .map(|table| ColumnFamilyDescriptor::new(table.name(), Self::cf_options(*table, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened lock store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(table: Table, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match table {
            Table::Locks | Table::Ledger => {
                // Small values, point lookups plus prefix scans on open
                opts.set_max_write_buffer_number(2);
            }
            Table::Revisions => {
                // 8-byte values, rarely written
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup((config.block_cache_size / (1024 * 1024)).max(1) as u64);
            }
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, table: Table) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(table.name())
            .ok_or_else(|| StoreError::Database(format!("column family '{}' not found", table.name())))
    }
}

impl KvBackend for RocksBackend {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(table)?;
        Ok(self.db.get_cf(&cf, key.as_bytes())?)
    }

    fn scan_prefix(&self, table: Table, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let cf = self.cf(table)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(format!("non-UTF-8 key: {e}")))?;
            entries.push((key, value.to_vec()));
        }
        Ok(entries)
    }

    fn write(&self, batch: Vec<Mutation>) -> Result<(), StoreError> {
        let mut write_batch = WriteBatch::default();
        for mutation in &batch {
            match mutation {
                Mutation::Put { table, key, value } => {
                    write_batch.put_cf(&self.cf(*table)?, key.as_bytes(), value);
                }
                Mutation::Delete { table, key } => {
                    write_batch.delete_cf(&self.cf(*table)?, key.as_bytes());
                }
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(write_batch, &write_opts)?;
        Ok(())
    }
}
