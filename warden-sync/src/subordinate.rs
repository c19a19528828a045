//! The subordinate role for one domain.
//!
//! A subordinate never writes the authority's store. It applies records and
//! pushes to its local registry, records soft applications in its own
//! [`RevisionLedger`], and reports local edits through the guard.

use std::sync::Arc;
use warden_core::{GovernedId, Notice, Notifier, SubordinateId, ValueRegistry};

use crate::channel::SyncChannel;
use crate::domain::{Domain, Inbound, Push};
use crate::error::SyncError;
use crate::guard::{GuardInterceptor, Verdict};
use crate::ledger::RevisionLedger;
use crate::store::RecordSource;

pub struct Subordinate<D: Domain> {
    peer_id: SubordinateId,
    records: Arc<dyn RecordSource<D>>,
    ledger: RevisionLedger<D>,
    guard: GuardInterceptor<D>,
    registry: Arc<dyn ValueRegistry<D::Value>>,
    channel: Arc<SyncChannel>,
    notifier: Arc<dyn Notifier>,
}

impl<D: Domain> Subordinate<D> {
    pub fn new(
        peer_id: SubordinateId,
        records: Arc<dyn RecordSource<D>>,
        ledger: RevisionLedger<D>,
        registry: Arc<dyn ValueRegistry<D::Value>>,
        channel: Arc<SyncChannel>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            peer_id,
            records,
            ledger,
            guard: GuardInterceptor::new(peer_id),
            registry,
            channel,
            notifier,
        }
    }

    pub fn peer_id(&self) -> SubordinateId {
        self.peer_id
    }

    pub fn ledger(&self) -> &RevisionLedger<D> {
        &self.ledger
    }

    /// Re-read every record and converge on it. Hard records targeting this
    /// subordinate overwrite differing local values; soft records apply once
    /// per revision. Returns the number of values written.
    pub fn refresh(&self) -> Result<usize, SyncError> {
        let mut applied = 0;
        for record in self.records.all_records() {
            let id = record.governed_id();
            if record.is_soft() {
                let revision = record.revision.unwrap_or(0);
                if self.ledger.is_handled(&id, revision) {
                    continue;
                }
                self.write_if_changed(&id, &record.value, record.requires_reload)?;
                self.ledger.mark_handled(&id, Some(revision), &record.value)?;
                applied += 1;
            } else if record.applies_to(&self.peer_id)
                && self.write_if_changed(&id, &record.value, record.requires_reload)?
            {
                applied += 1;
            }
        }
        if applied > 0 {
            log::info!("Refresh applied {applied} {} values", D::NAME);
        }
        Ok(applied)
    }

    /// Apply a push addressed to this subordinate. Soft pushes are gated on
    /// the ledger so a revision is applied at most once. Returns whether the
    /// push was applied.
    pub fn apply_push(&self, push: Push<D::Value>) -> Result<bool, SyncError> {
        if !push.applies_to(&self.peer_id) {
            return Ok(false);
        }

        if !push.soft {
            return self.write_if_changed(&push.id, &push.value, push.requires_reload);
        }

        let handled = match push.revision {
            Some(revision) => self.ledger.is_handled(&push.id, revision),
            None => self.ledger.is_value_handled(&push.id, &push.value),
        };
        if handled {
            log::debug!("Soft push for {} already handled", push.id);
            return Ok(false);
        }

        self.write_if_changed(&push.id, &push.value, push.requires_reload)?;
        self.ledger.mark_handled(&push.id, push.revision, &push.value)?;
        Ok(true)
    }

    /// Report a local write that has already landed in the registry.
    pub fn on_local_write(
        &self,
        id: &GovernedId,
        attempted: &D::Value,
    ) -> Result<Verdict<D::Value>, SyncError> {
        let record = self.records.record(id);
        let verdict = self.guard.inspect(record.as_ref(), attempted);

        match &verdict {
            Verdict::Allow => {}
            Verdict::Revert { restore } => {
                self.registry.set(id, restore.clone())?;
                self.notifier.notify(Notice::Locked(id.clone()));
            }
            Verdict::Advisory { revision } => {
                // Our own application of the soft value echoes back here.
                let echo = self.ledger.entry(id).is_some_and(|entry| {
                    Some(entry.revision) == *revision
                        && entry.value_hash == D::fingerprint(attempted)
                });
                if echo {
                    return Ok(Verdict::Allow);
                }
                self.ledger.mark_handled(id, *revision, attempted)?;
                self.channel
                    .publish(self.peer_id, D::soft_clear_message(id))?;
                log::info!("Local edit of soft-governed {id}; asked authority to clear");
            }
        }
        Ok(verdict)
    }

    pub fn handle(&self, inbound: Inbound<D::Value>) -> Result<(), SyncError> {
        match inbound {
            Inbound::Refresh => {
                self.refresh()?;
            }
            Inbound::Push(push) => {
                self.apply_push(push)?;
            }
            Inbound::SoftClear(id) => {
                log::debug!("Subordinate ignoring soft-clear for {id}");
            }
        }
        Ok(())
    }

    /// Returns whether the registry was written.
    fn write_if_changed(
        &self,
        id: &GovernedId,
        value: &D::Value,
        requires_reload: bool,
    ) -> Result<bool, SyncError> {
        match self.registry.get(id) {
            Some(current) if D::same_value(&current, value) => return Ok(false),
            Some(_) => {}
            None => {
                log::debug!("{id} is not registered locally; skipping");
                return Ok(false);
            }
        }
        self.registry.set(id, value.clone())?;
        if requires_reload {
            self.notifier.notify(Notice::ReloadRequired(id.clone()));
        }
        Ok(true)
    }
}
