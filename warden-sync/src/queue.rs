//! Authority-side buffer of pending lock, soft and push intents.
//!
//! Gestures only enqueue; nothing reaches the store until the authority's
//! "apply changes" action flushes the queue into [`AuthorityStore::commit`].
//! Upserts are keyed by `(id, kind)` and Lock/Soft evict each other, so any
//! burst of gestures resolves to at most one Lock-or-Soft plus one Push per
//! identifier, last write wins.
//!
//! [`AuthorityStore::commit`]: crate::store::AuthorityStore::commit

use warden_core::{GovernedId, OpKind, PendingOperation};

#[derive(Debug, Clone)]
pub struct OperationQueue<V> {
    ops: Vec<PendingOperation<V>>,
}

impl<V> Default for OperationQueue<V> {
    fn default() -> Self {
        Self { ops: Vec::new() }
    }
}

impl<V> OperationQueue<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert by `(id, kind)` and purge the opposite mode for the same id.
    pub fn enqueue(&mut self, op: PendingOperation<V>) {
        let kind = op.kind();
        let opposite = kind.opposite();
        self.ops.retain(|queued| {
            queued.id != op.id || (queued.kind() != kind && Some(queued.kind()) != opposite)
        });
        self.ops.push(op);
    }

    pub fn get(&self, id: &GovernedId, kind: OpKind) -> Option<&PendingOperation<V>> {
        self.ops.iter().find(|op| &op.id == id && op.kind() == kind)
    }

    /// A queued lock with empty targets, or a queued soft disable.
    pub fn is_unlock_queued(&self, id: &GovernedId) -> bool {
        self.ops.iter().any(|op| &op.id == id && op.is_unlock())
    }

    /// Whether a Lock or Soft operation is waiting for `id`. Pushes never
    /// conflict with stored records.
    pub fn has_conflict(&self, id: &GovernedId) -> bool {
        self.ops
            .iter()
            .any(|op| &op.id == id && op.kind() != OpKind::Push)
    }

    /// Remove and return everything queued, in enqueue order.
    pub fn take(&mut self) -> Vec<PendingOperation<V>> {
        std::mem::take(&mut self.ops)
    }

    /// Put back operations from a failed flush. Anything queued since the
    /// flush started is newer and wins over the restored entry.
    pub fn restore(&mut self, ops: Vec<PendingOperation<V>>) {
        let newer = std::mem::take(&mut self.ops);
        self.ops = ops;
        for op in newer {
            self.enqueue(op);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingOperation<V>> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}
