//! Subordinate-side write guard.
//!
//! The host reports every local write to a governed identifier after it has
//! landed. The guard decides, from the authority's record, whether the write
//! stands, stands as an advisory override, or must be rolled back.

use std::marker::PhantomData;
use warden_core::{LockMode, LockRecord, SubordinateId};

use crate::domain::Domain;

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict<V> {
    /// No enforcement applies.
    Allow,
    /// Soft record: keep the local edit, record it in the ledger and ask the
    /// authority to drop the record.
    Advisory { revision: Option<u64> },
    /// Hard record targeting this subordinate: restore `restore`.
    Revert { restore: V },
}

pub struct GuardInterceptor<D: Domain> {
    subordinate: SubordinateId,
    _domain: PhantomData<D>,
}

impl<D: Domain> GuardInterceptor<D> {
    pub fn new(subordinate: SubordinateId) -> Self {
        Self {
            subordinate,
            _domain: PhantomData,
        }
    }

    pub fn inspect(
        &self,
        record: Option<&LockRecord<D::Value>>,
        attempted: &D::Value,
    ) -> Verdict<D::Value> {
        let Some(record) = record else {
            return Verdict::Allow;
        };

        match record.mode {
            LockMode::Soft => Verdict::Advisory {
                revision: record.revision,
            },
            LockMode::Hard if !record.applies_to(&self.subordinate) => Verdict::Allow,
            LockMode::Hard if D::same_value(attempted, &record.value) => Verdict::Allow,
            LockMode::Hard => Verdict::Revert {
                restore: record.value.clone(),
            },
        }
    }
}
