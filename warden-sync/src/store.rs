//! Authority-side lock store.
//!
//! Holds one [`LockRecord`] per governed identifier with active enforcement,
//! plus a revision counter map that outlives record deletion. The authority
//! is the only writer; subordinates read through [`RecordSource`].
//!
//! Writes are staged on copies of the in-memory maps, persisted as one
//! batch, and swapped in only after the batch lands. A failed write leaves
//! both the backend and the in-memory view untouched.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};
use warden_core::{
    GovernedId, LockRecord, LockState, Operation, PendingOperation, Targets, ValueRegistry,
};

use crate::domain::{Domain, Push};
use crate::queue::OperationQueue;
use crate::storage::{decode_revision, encode_revision, KvBackend, Mutation, StoreError, Table};

/// Read access to the authority's records.
///
/// In a live session this is the host's replicated world storage; tests and
/// single-process hosts share the [`AuthorityStore`] itself.
pub trait RecordSource<D: Domain>: Send + Sync {
    fn record(&self, id: &GovernedId) -> Option<LockRecord<D::Value>>;
    fn all_records(&self) -> Vec<LockRecord<D::Value>>;
}

pub type SharedStore<D> = Arc<RwLock<AuthorityStore<D>>>;

/// What a commit changed and what it wants broadcast.
#[derive(Debug, Clone)]
pub struct CommitOutcome<V> {
    pub stored: Vec<GovernedId>,
    pub removed: Vec<GovernedId>,
    pub pushes: Vec<Push<V>>,
}

impl<V> Default for CommitOutcome<V> {
    fn default() -> Self {
        Self {
            stored: Vec::new(),
            removed: Vec::new(),
            pushes: Vec::new(),
        }
    }
}

impl<V> CommitOutcome<V> {
    /// Whether subordinates need a refresh.
    pub fn store_changed(&self) -> bool {
        !self.stored.is_empty() || !self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Records dropped because the authority's live value diverged.
    pub removed: Vec<GovernedId>,
    /// Soft records whose `requiresReload` flag was refreshed.
    pub refreshed: Vec<GovernedId>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.refreshed.is_empty()
    }
}

pub struct AuthorityStore<D: Domain> {
    backend: Arc<dyn KvBackend>,
    records: HashMap<GovernedId, LockRecord<D::Value>>,
    revisions: HashMap<GovernedId, u64>,
    _domain: PhantomData<D>,
}

impl<D: Domain> AuthorityStore<D> {
    /// Load this domain's records and revision counters.
    pub fn open(backend: Arc<dyn KvBackend>) -> Result<Self, StoreError> {
        let mut records = HashMap::new();
        for (key, bytes) in backend.scan_prefix(Table::Locks, D::KEY_PREFIX)? {
            match serde_json::from_slice::<LockRecord<D::Value>>(&bytes) {
                Ok(record) => {
                    records.insert(record.governed_id(), record);
                }
                Err(e) => log::warn!("Skipping unreadable {} record {key}: {e}", D::NAME),
            }
        }

        let mut revisions = HashMap::new();
        for (key, bytes) in backend.scan_prefix(Table::Revisions, D::KEY_PREFIX)? {
            let Ok(id) = GovernedId::parse(&key[D::KEY_PREFIX.len()..]) else {
                log::warn!("Skipping revision with malformed key {key}");
                continue;
            };
            revisions.insert(id, decode_revision(&bytes)?);
        }

        log::info!(
            "Opened {} store: {} records, {} revision counters",
            D::NAME,
            records.len(),
            revisions.len()
        );

        Ok(Self {
            backend,
            records,
            revisions,
            _domain: PhantomData,
        })
    }

    pub fn into_shared(self) -> SharedStore<D> {
        Arc::new(RwLock::new(self))
    }

    pub fn get(&self, id: &GovernedId) -> Option<&LockRecord<D::Value>> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &LockRecord<D::Value>> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Current revision counter for `id`, 0 if it was never soft-enabled.
    pub fn revision(&self, id: &GovernedId) -> u64 {
        self.revisions.get(id).copied().unwrap_or(0)
    }

    pub fn lock_state(&self, id: &GovernedId) -> LockState {
        self.records
            .get(id)
            .map_or(LockState::None, LockRecord::lock_state)
    }

    /// Apply queued operations as one atomic batch.
    ///
    /// `all_subordinates` decides whether a lock's target set is global.
    pub fn commit(
        &mut self,
        ops: &[PendingOperation<D::Value>],
        all_subordinates: &Targets,
    ) -> Result<CommitOutcome<D::Value>, StoreError> {
        let mut outcome = CommitOutcome::default();
        if ops.is_empty() {
            return Ok(outcome);
        }
        if let Some(op) = ops.iter().find(|op| !op.id.is_valid()) {
            return Err(StoreError::InvalidKey(op.id.as_key()));
        }

        let mut records = self.records.clone();
        let mut revisions = self.revisions.clone();
        let mut batch = Vec::new();

        for op in ops {
            let key = D::storage_key(&op.id);
            match &op.operation {
                Operation::Lock { targets } if targets.is_empty() => {
                    if records.remove(&op.id).is_some() {
                        batch.push(Mutation::Delete {
                            table: Table::Locks,
                            key,
                        });
                        outcome.removed.push(op.id.clone());
                    }
                }
                Operation::Lock { .. } | Operation::LockAll => {
                    let target_ids = match &op.operation {
                        Operation::Lock { targets } if !targets.is_superset(all_subordinates) => {
                            Some(targets.clone())
                        }
                        _ => None,
                    };
                    let record =
                        LockRecord::hard(&op.id, op.value.clone(), op.requires_reload, target_ids);
                    batch.push(put_record(key, &record)?);
                    records.insert(op.id.clone(), record);
                    outcome.stored.push(op.id.clone());
                }
                Operation::Soft { enable: false } => {
                    if records.get(&op.id).is_some_and(LockRecord::is_soft) {
                        records.remove(&op.id);
                        batch.push(Mutation::Delete {
                            table: Table::Locks,
                            key,
                        });
                        outcome.removed.push(op.id.clone());
                    }
                }
                Operation::Soft { enable: true } => {
                    let revision = revisions.get(&op.id).copied().unwrap_or(0) + 1;
                    revisions.insert(op.id.clone(), revision);
                    batch.push(Mutation::Put {
                        table: Table::Revisions,
                        key: key.clone(),
                        value: encode_revision(revision),
                    });

                    let record =
                        LockRecord::soft(&op.id, op.value.clone(), op.requires_reload, revision);
                    batch.push(put_record(key, &record)?);
                    records.insert(op.id.clone(), record);
                    outcome.stored.push(op.id.clone());
                    outcome.pushes.push(Push {
                        id: op.id.clone(),
                        value: op.value.clone(),
                        soft: true,
                        revision: Some(revision),
                        targets: None,
                        requires_reload: op.requires_reload,
                    });
                }
                Operation::Push { .. } | Operation::PushAll => {
                    let targets = match &op.operation {
                        Operation::Push { targets } if targets.is_empty() => {
                            log::debug!("Skipping push of {} with no targets", op.id);
                            continue;
                        }
                        Operation::Push { targets } if !targets.is_superset(all_subordinates) => {
                            Some(targets.clone())
                        }
                        _ => None,
                    };
                    outcome.pushes.push(Push {
                        id: op.id.clone(),
                        value: op.value.clone(),
                        soft: false,
                        revision: None,
                        targets,
                        requires_reload: op.requires_reload,
                    });
                }
            }
        }

        if !batch.is_empty() {
            if let Err(e) = self.backend.write(batch) {
                log::error!("{} commit of {} operations failed: {e}", D::NAME, ops.len());
                return Err(e);
            }
        }

        self.records = records;
        self.revisions = revisions;
        log::info!(
            "Committed {} {} operations ({} stored, {} removed, {} pushes)",
            ops.len(),
            D::NAME,
            outcome.stored.len(),
            outcome.removed.len(),
            outcome.pushes.len()
        );
        Ok(outcome)
    }

    /// Compare every record to the authority's live value.
    ///
    /// Records with a queued Lock or Soft operation are left for the next
    /// flush. A record whose live value diverged (or whose setting is gone)
    /// is deleted: authority edits cancel enforcement.
    pub fn reconcile(
        &mut self,
        queue: &OperationQueue<D::Value>,
        registry: &dyn ValueRegistry<D::Value>,
    ) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();
        let mut records = self.records.clone();
        let mut batch = Vec::new();

        for (id, record) in &self.records {
            if queue.has_conflict(id) {
                continue;
            }

            let diverged = match registry.get(id) {
                Some(live) => !D::same_value(&live, &record.value),
                None => true,
            };
            if diverged {
                records.remove(id);
                batch.push(Mutation::Delete {
                    table: Table::Locks,
                    key: D::storage_key(id),
                });
                report.removed.push(id.clone());
                continue;
            }

            let requires_reload = registry.requires_reload(id);
            if record.is_soft() && record.requires_reload != requires_reload {
                let mut refreshed = record.clone();
                refreshed.requires_reload = requires_reload;
                batch.push(put_record(D::storage_key(id), &refreshed)?);
                records.insert(id.clone(), refreshed);
                report.refreshed.push(id.clone());
            }
        }

        if batch.is_empty() {
            return Ok(report);
        }
        if let Err(e) = self.backend.write(batch) {
            log::error!("{} reconcile failed: {e}", D::NAME);
            return Err(e);
        }

        for id in &report.removed {
            log::info!("Authority value of {id} diverged; lock released");
        }
        self.records = records;
        Ok(report)
    }

    /// Drop a soft record at a subordinate's request. Returns whether a
    /// record was removed; hard records and unknown ids are left alone.
    pub fn clear_soft(&mut self, id: &GovernedId) -> Result<bool, StoreError> {
        if !self.records.get(id).is_some_and(LockRecord::is_soft) {
            log::debug!("Ignoring soft-clear for {id}: no soft record");
            return Ok(false);
        }

        self.backend.write(vec![Mutation::Delete {
            table: Table::Locks,
            key: D::storage_key(id),
        }])?;
        self.records.remove(id);
        log::info!("Soft record for {id} cleared by subordinate edit");
        Ok(true)
    }
}

fn put_record<V: serde::Serialize>(key: String, record: &LockRecord<V>) -> Result<Mutation, StoreError> {
    let value =
        serde_json::to_vec(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(Mutation::Put {
        table: Table::Locks,
        key,
        value,
    })
}

impl<D: Domain> RecordSource<D> for RwLock<AuthorityStore<D>> {
    fn record(&self, id: &GovernedId) -> Option<LockRecord<D::Value>> {
        let store = self.read().unwrap_or_else(|e| e.into_inner());
        store.get(id).cloned()
    }

    fn all_records(&self) -> Vec<LockRecord<D::Value>> {
        let store = self.read().unwrap_or_else(|e| e.into_inner());
        store.records().cloned().collect()
    }
}
