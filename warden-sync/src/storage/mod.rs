//! Persistence for lock records, revision counters and subordinate ledgers.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐   batch    ┌───────────────────────────────┐
//! │ AuthorityStore │ ─────────► │ KvBackend                     │
//! │ RevisionLedger │            │  table "locks"     id → record│
//! └────────────────┘            │  table "revisions" id → u64 BE│
//!                               │  table "ledger"    id → entry │
//!                               └──────────┬────────────────────┘
//!                                          │
//!                          ┌───────────────┴──────────────┐
//!                          ▼                              ▼
//!                   RocksBackend (durable)        MemoryBackend
//! ```
//!
//! Every write goes through [`KvBackend::write`], which applies a whole
//! batch or nothing. Keys are domain-prefixed strings (`setting:` or
//! `ctrl:`) so both mirrors share one database without collisions.

pub mod memory;
pub mod rocks;

use thiserror::Error;

pub use memory::MemoryBackend;
pub use rocks::{RocksBackend, StoreConfig};

/// Logical tables. Each maps to one RocksDB column family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Locks,
    Revisions,
    Ledger,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Locks, Table::Revisions, Table::Ledger];

    pub fn name(self) -> &'static str {
        match self {
            Table::Locks => "locks",
            Table::Revisions => "revisions",
            Table::Ledger => "ledger",
        }
    }
}

/// One write in an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Put {
        table: Table,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        table: Table,
        key: String,
    },
}

/// Key-value storage with atomic batches.
pub trait KvBackend: Send + Sync {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, table: Table, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Apply every mutation or none of them.
    fn write(&self, batch: Vec<Mutation>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("storage lock poisoned")]
    Poisoned,
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Encode a revision counter as 8 big-endian bytes.
pub(crate) fn encode_revision(revision: u64) -> Vec<u8> {
    revision.to_be_bytes().to_vec()
}

pub(crate) fn decode_revision(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Deserialization(format!("revision has {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(buf))
}
