//! Lock records and queued operations.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{GovernedId, SubordinateId, Targets};

/// Enforcement mode of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Local writes on targeted subordinates are reverted.
    Hard,
    /// One-time advisory push; local edits are never reverted.
    Soft,
}

/// Lock icon state for a single identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockState {
    #[default]
    None,
    HardAll,
    HardPartial,
    Soft,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LockState::None => "none",
            LockState::HardAll => "hard-all",
            LockState::HardPartial => "hard-partial",
            LockState::Soft => "soft",
        };
        f.write_str(label)
    }
}

/// Active enforcement for one governed identifier.
///
/// `target_ids` omitted means every subordinate. `revision` is only set for
/// soft records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord<V> {
    pub id: String,
    pub namespace: String,
    pub key: String,
    pub value: V,
    #[serde(default)]
    pub requires_reload: bool,
    pub mode: LockMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ids: Option<Targets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

impl<V> LockRecord<V> {
    pub fn hard(
        id: &GovernedId,
        value: V,
        requires_reload: bool,
        target_ids: Option<Targets>,
    ) -> Self {
        Self {
            id: id.as_key(),
            namespace: id.namespace.clone(),
            key: id.key.clone(),
            value,
            requires_reload,
            mode: LockMode::Hard,
            target_ids,
            revision: None,
        }
    }

    pub fn soft(id: &GovernedId, value: V, requires_reload: bool, revision: u64) -> Self {
        Self {
            id: id.as_key(),
            namespace: id.namespace.clone(),
            key: id.key.clone(),
            value,
            requires_reload,
            mode: LockMode::Soft,
            target_ids: None,
            revision: Some(revision),
        }
    }

    pub fn governed_id(&self) -> GovernedId {
        GovernedId::new(self.namespace.clone(), self.key.clone())
    }

    pub fn is_soft(&self) -> bool {
        self.mode == LockMode::Soft
    }

    /// Whether enforcement of this record applies to `subordinate`.
    pub fn applies_to(&self, subordinate: &SubordinateId) -> bool {
        match &self.target_ids {
            None => true,
            Some(targets) => targets.contains(subordinate),
        }
    }

    pub fn lock_state(&self) -> LockState {
        match (self.mode, &self.target_ids) {
            (LockMode::Soft, _) => LockState::Soft,
            (LockMode::Hard, None) => LockState::HardAll,
            (LockMode::Hard, Some(_)) => LockState::HardPartial,
        }
    }
}

/// Discriminant used to key the operation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Lock,
    Soft,
    Push,
}

impl OpKind {
    /// Lock and Soft exclude each other for the same identifier.
    pub fn opposite(self) -> Option<OpKind> {
        match self {
            OpKind::Lock => Some(OpKind::Soft),
            OpKind::Soft => Some(OpKind::Lock),
            OpKind::Push => None,
        }
    }
}

/// The intent carried by a pending operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Hard lock. Empty targets means unlock.
    Lock { targets: Targets },
    /// Hard lock for every subordinate, including ones not yet known.
    LockAll,
    /// Enable or disable soft mode.
    Soft { enable: bool },
    /// One-shot value push; never creates a record.
    Push { targets: Targets },
    /// One-shot push to every subordinate.
    PushAll,
}

/// An authority intent waiting for the next flush.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation<V> {
    pub id: GovernedId,
    /// Snapshot of the authority's value when the operation was queued.
    pub value: V,
    pub requires_reload: bool,
    pub operation: Operation,
}

impl<V> PendingOperation<V> {
    pub fn kind(&self) -> OpKind {
        match self.operation {
            Operation::Lock { .. } | Operation::LockAll => OpKind::Lock,
            Operation::Soft { .. } => OpKind::Soft,
            Operation::Push { .. } | Operation::PushAll => OpKind::Push,
        }
    }

    /// A lock with no targets, or a soft disable.
    pub fn is_unlock(&self) -> bool {
        match &self.operation {
            Operation::Lock { targets } => targets.is_empty(),
            Operation::Soft { enable } => !enable,
            Operation::LockAll | Operation::Push { .. } | Operation::PushAll => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_hard_record_wire_shape() {
        let id = GovernedId::new("moduleA", "volume");
        let record = LockRecord::hard(&id, json!(0.5), false, None);
        let encoded = serde_json::to_value(&record).unwrap();

        assert_eq!(encoded["id"], "moduleA.volume");
        assert_eq!(encoded["mode"], "hard");
        assert_eq!(encoded["requiresReload"], false);
        assert!(encoded.get("targetIds").is_none());
        assert!(encoded.get("revision").is_none());
    }

    #[test]
    fn test_soft_record_carries_revision() {
        let id = GovernedId::new("moduleA", "theme");
        let record = LockRecord::soft(&id, json!("dark"), true, 3);
        assert_eq!(record.revision, Some(3));
        assert_eq!(record.lock_state(), LockState::Soft);
        assert!(record.applies_to(&Uuid::new_v4()));
    }

    #[test]
    fn test_partial_record_targets() {
        let id = GovernedId::new("moduleA", "volume");
        let included = Uuid::new_v4();
        let excluded = Uuid::new_v4();
        let record = LockRecord::hard(&id, json!(1), false, Some([included].into()));

        assert_eq!(record.lock_state(), LockState::HardPartial);
        assert!(record.applies_to(&included));
        assert!(!record.applies_to(&excluded));
    }

    #[test]
    fn test_record_decode_defaults() {
        let raw = r#"{"id":"a.b","namespace":"a","key":"b","value":7,"mode":"hard"}"#;
        let record: LockRecord<serde_json::Value> = serde_json::from_str(raw).unwrap();
        assert!(!record.requires_reload);
        assert_eq!(record.lock_state(), LockState::HardAll);
    }

    #[test]
    fn test_op_kind_exclusivity() {
        assert_eq!(OpKind::Lock.opposite(), Some(OpKind::Soft));
        assert_eq!(OpKind::Soft.opposite(), Some(OpKind::Lock));
        assert_eq!(OpKind::Push.opposite(), None);
    }

    #[test]
    fn test_unlock_detection() {
        let id = GovernedId::new("a", "b");
        let op = |operation| PendingOperation {
            id: id.clone(),
            value: json!(null),
            requires_reload: false,
            operation,
        };
        assert!(op(Operation::Lock { targets: Targets::new() }).is_unlock());
        assert!(op(Operation::Soft { enable: false }).is_unlock());
        assert!(!op(Operation::Soft { enable: true }).is_unlock());
        assert!(!op(Operation::Push { targets: Targets::new() }).is_unlock());
        assert!(!op(Operation::LockAll).is_unlock());
        assert!(!op(Operation::PushAll).is_unlock());
        assert_eq!(op(Operation::LockAll).kind(), OpKind::Lock);
        assert_eq!(op(Operation::PushAll).kind(), OpKind::Push);
    }

    #[test]
    fn test_lock_state_display() {
        assert_eq!(LockState::HardPartial.to_string(), "hard-partial");
        assert_eq!(LockState::default(), LockState::None);
    }
}
