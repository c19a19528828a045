//! Subordinate-local revision ledger.
//!
//! Records the last revision (and value fingerprint) a subordinate applied
//! for each soft-governed identifier. Soft pushes are gated on it, so a
//! given `(id, revision)` is applied at most once even under duplicate
//! delivery, reconnects and redundant refreshes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};
use warden_core::GovernedId;

use crate::domain::Domain;
use crate::storage::{KvBackend, Mutation, StoreError, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub revision: u64,
    pub value_hash: u64,
}

impl LedgerEntry {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(entry)
    }
}

pub struct RevisionLedger<D: Domain> {
    backend: Arc<dyn KvBackend>,
    entries: RwLock<HashMap<String, LedgerEntry>>,
    _domain: PhantomData<D>,
}

impl<D: Domain> RevisionLedger<D> {
    /// Load this domain's entries from `backend`.
    pub fn open(backend: Arc<dyn KvBackend>) -> Result<Self, StoreError> {
        let mut entries = HashMap::new();
        for (key, bytes) in backend.scan_prefix(Table::Ledger, D::KEY_PREFIX)? {
            match LedgerEntry::decode(&bytes) {
                Ok(entry) => {
                    entries.insert(key, entry);
                }
                Err(e) => log::warn!("Skipping unreadable {} ledger entry {key}: {e}", D::NAME),
            }
        }
        log::debug!("Loaded {} {} ledger entries", entries.len(), D::NAME);

        Ok(Self {
            backend,
            entries: RwLock::new(entries),
            _domain: PhantomData,
        })
    }

    pub fn entry(&self, id: &GovernedId) -> Option<LedgerEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(&D::storage_key(id)).copied()
    }

    /// True when the recorded revision for `id` is at least `revision`.
    pub fn is_handled(&self, id: &GovernedId, revision: u64) -> bool {
        self.entry(id).is_some_and(|e| e.revision >= revision)
    }

    /// Fallback for pushes without a revision: was this exact value the last
    /// one recorded?
    pub fn is_value_handled(&self, id: &GovernedId, value: &D::Value) -> bool {
        self.entry(id)
            .is_some_and(|e| e.value_hash == D::fingerprint(value))
    }

    /// Record `value` as applied. The stored revision never decreases; a
    /// missing revision keeps the previous one.
    pub fn mark_handled(
        &self,
        id: &GovernedId,
        revision: Option<u64>,
        value: &D::Value,
    ) -> Result<LedgerEntry, StoreError> {
        let key = D::storage_key(id);
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;

        let previous = entries.get(&key).map_or(0, |e| e.revision);
        let entry = LedgerEntry {
            revision: revision.map_or(previous, |r| r.max(previous)),
            value_hash: D::fingerprint(value),
        };

        self.backend.write(vec![Mutation::Put {
            table: Table::Ledger,
            key: key.clone(),
            value: entry.encode()?,
        }])?;
        entries.insert(key, entry);
        Ok(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
