//! The authority role for one domain.
//!
//! Owns the [`OperationQueue`] and is the only writer of the
//! [`AuthorityStore`]. UI gestures queue intents; [`Authority::flush`]
//! commits them atomically and broadcasts the result.

use std::sync::{Arc, Mutex, MutexGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use warden_core::{
    CoreError, GovernedId, LockAction, LockState, OpKind, Operation, PeerId, PendingOperation,
    SettingScope, SubordinateDirectory, Targets, ValueRegistry,
};

use crate::channel::{RefreshDebouncer, SyncChannel};
use crate::domain::{Domain, Inbound};
use crate::error::SyncError;
use crate::queue::OperationQueue;
use crate::store::{AuthorityStore, CommitOutcome, ReconcileReport, SharedStore};

pub struct Authority<D: Domain> {
    peer_id: PeerId,
    store: SharedStore<D>,
    queue: Mutex<OperationQueue<D::Value>>,
    channel: Arc<SyncChannel>,
    refresh: RefreshDebouncer,
    registry: Arc<dyn ValueRegistry<D::Value>>,
    directory: Arc<dyn SubordinateDirectory>,
}

impl<D: Domain> Authority<D> {
    pub fn new(
        peer_id: PeerId,
        store: SharedStore<D>,
        registry: Arc<dyn ValueRegistry<D::Value>>,
        directory: Arc<dyn SubordinateDirectory>,
        channel: Arc<SyncChannel>,
        refresh_debounce: Duration,
    ) -> Self {
        let refresh = RefreshDebouncer::new(
            channel.clone(),
            peer_id,
            D::refresh_message(),
            refresh_debounce,
        );
        Self {
            peer_id,
            store,
            queue: Mutex::new(OperationQueue::new()),
            channel,
            refresh,
            registry,
            directory,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn store(&self) -> SharedStore<D> {
        self.store.clone()
    }

    /// Queue a hard lock. Empty `targets` queues an unlock.
    pub fn queue_lock(&self, id: &GovernedId, targets: Targets) -> Result<(), SyncError> {
        self.enqueue(id, Operation::Lock { targets })
    }

    /// Queue a hard lock covering every subordinate, resolved at commit so
    /// subordinates joining later are covered too.
    pub fn queue_lock_all(&self, id: &GovernedId) -> Result<(), SyncError> {
        self.enqueue(id, Operation::LockAll)
    }

    pub fn queue_soft(&self, id: &GovernedId, enable: bool) -> Result<(), SyncError> {
        self.enqueue(id, Operation::Soft { enable })
    }

    pub fn queue_push(&self, id: &GovernedId, targets: Targets) -> Result<(), SyncError> {
        self.enqueue(id, Operation::Push { targets })
    }

    pub fn queue_push_all(&self, id: &GovernedId) -> Result<(), SyncError> {
        self.enqueue(id, Operation::PushAll)
    }

    /// Translate a resolved gesture into queue operations. `targets` is the
    /// selection made in the target picker, when there is one.
    pub fn apply_action(
        &self,
        id: &GovernedId,
        action: LockAction,
        targets: Option<Targets>,
    ) -> Result<(), SyncError> {
        match action {
            LockAction::ToggleLockAll => {
                if self.pending_lock_state(id) == LockState::HardAll {
                    self.queue_lock(id, Targets::new())
                } else {
                    self.queue_lock_all(id)
                }
            }
            LockAction::ChooseTargets => self.queue_lock(id, targets.unwrap_or_default()),
            LockAction::ToggleSoft => {
                let enabled = self.pending_lock_state(id) == LockState::Soft;
                self.queue_soft(id, !enabled)
            }
            LockAction::PushOnce => match targets {
                Some(targets) => self.queue_push(id, targets),
                None => self.queue_push_all(id),
            },
        }
    }

    /// Commit everything queued, then broadcast. A failed commit keeps the
    /// queue so the caller can flush again.
    pub fn flush(&self) -> Result<CommitOutcome<D::Value>, SyncError> {
        let ops = self.lock_queue()?.take();
        if ops.is_empty() {
            return Ok(CommitOutcome::default());
        }

        let all_subordinates = self.directory.subordinate_ids();
        let committed = self
            .lock_store()
            .and_then(|mut store| Ok(store.commit(&ops, &all_subordinates)?));
        let outcome = match committed {
            Ok(outcome) => outcome,
            Err(e) => {
                self.lock_queue()?.restore(ops);
                return Err(e);
            }
        };

        for push in outcome.pushes.iter().cloned() {
            if let Err(e) = self.channel.publish(self.peer_id, D::push_message(push)) {
                log::warn!("Failed to publish {} push: {e}", D::NAME);
            }
        }
        if outcome.store_changed() {
            self.refresh.request();
        }
        Ok(outcome)
    }

    /// Lock state as stored.
    pub fn current_lock_state(&self, id: &GovernedId) -> LockState {
        self.read_store(|store| store.lock_state(id))
    }

    /// Lock state as it will be after the next flush.
    pub fn pending_lock_state(&self, id: &GovernedId) -> LockState {
        let current = self.current_lock_state(id);
        let queue = match self.queue.lock() {
            Ok(queue) => queue,
            Err(_) => return current,
        };
        let Some(op) = queue.iter().find(|op| &op.id == id && op.kind() != OpKind::Push) else {
            return current;
        };

        match &op.operation {
            Operation::LockAll => LockState::HardAll,
            Operation::Lock { targets } if targets.is_empty() => LockState::None,
            Operation::Lock { targets } if targets.is_superset(&self.directory.subordinate_ids()) => {
                LockState::HardAll
            }
            Operation::Lock { .. } => LockState::HardPartial,
            Operation::Soft { enable: true } => LockState::Soft,
            Operation::Soft { enable: false } if current == LockState::Soft => LockState::None,
            Operation::Soft { enable: false } | Operation::Push { .. } | Operation::PushAll => {
                current
            }
        }
    }

    pub fn is_unlock_queued(&self, id: &GovernedId) -> bool {
        self.queue
            .lock()
            .map(|queue| queue.is_unlock_queued(id))
            .unwrap_or(false)
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    /// Drop records whose authority value diverged.
    pub fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        let report = {
            let queue = self.lock_queue()?;
            let mut store = self.lock_store()?;
            store.reconcile(&queue, self.registry.as_ref())?
        };
        if !report.is_empty() {
            self.refresh.request();
        }
        Ok(report)
    }

    /// The host observed the authority changing `id` itself. Returns whether
    /// enforcement on `id` was released.
    pub fn on_authority_edit(&self, id: &GovernedId) -> Result<bool, SyncError> {
        let report = self.reconcile()?;
        Ok(report.removed.contains(id))
    }

    pub fn handle(&self, sender: PeerId, inbound: Inbound<D::Value>) -> Result<(), SyncError> {
        match inbound {
            Inbound::SoftClear(id) => {
                if self.lock_store()?.clear_soft(&id)? {
                    log::info!("{sender} overrode soft {} value {id}", D::NAME);
                    self.refresh.request();
                }
            }
            Inbound::Refresh | Inbound::Push(_) => {
                log::debug!("Authority ignoring {} message from {sender}", D::NAME);
            }
        }
        Ok(())
    }

    /// Reconcile every `interval` until the task is aborted.
    pub fn spawn_reconcile_loop(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.reconcile() {
                    log::error!("{} reconcile pass failed: {e}", D::NAME);
                }
            }
        })
    }

    fn enqueue(&self, id: &GovernedId, operation: Operation) -> Result<(), SyncError> {
        if !id.is_valid() {
            return Err(CoreError::MalformedId(id.as_key()).into());
        }
        let (value, requires_reload) = self.snapshot(id)?;
        self.lock_queue()?.enqueue(PendingOperation {
            id: id.clone(),
            value,
            requires_reload,
            operation,
        });
        Ok(())
    }

    /// Current value and reload flag for a governable id.
    fn snapshot(&self, id: &GovernedId) -> Result<(D::Value, bool), CoreError> {
        match self.registry.scope(id) {
            Some(SettingScope::Client) => {}
            Some(scope) => {
                return Err(CoreError::NotGovernable {
                    id: id.clone(),
                    scope,
                })
            }
            None => return Err(CoreError::UnknownSetting(id.clone())),
        }
        let value = self
            .registry
            .get(id)
            .ok_or_else(|| CoreError::UnknownSetting(id.clone()))?;
        Ok((value, self.registry.requires_reload(id)))
    }

    fn lock_queue(&self) -> Result<MutexGuard<'_, OperationQueue<D::Value>>, SyncError> {
        self.queue.lock().map_err(|_| SyncError::Poisoned)
    }

    fn lock_store(&self) -> Result<RwLockWriteGuard<'_, AuthorityStore<D>>, SyncError> {
        self.store.write().map_err(|_| SyncError::Poisoned)
    }

    fn read_store<T>(&self, f: impl FnOnce(&AuthorityStore<D>) -> T) -> T {
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        f(&store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Settings;
    use crate::protocol::SyncMessage;
    use crate::storage::{KvBackend, MemoryBackend, Mutation, StoreError, Table};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use warden_core::{Member, MemoryRegistry};

    /// Memory backend whose writes can be switched off.
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        failing: AtomicBool,
    }

    impl KvBackend for FlakyBackend {
        fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(table, key)
        }
        fn scan_prefix(
            &self,
            table: Table,
            prefix: &str,
        ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
            self.inner.scan_prefix(table, prefix)
        }
        fn write(&self, batch: Vec<Mutation>) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Database("disk full".into()));
            }
            self.inner.write(batch)
        }
    }

    struct Fixture {
        authority: Authority<Settings>,
        registry: Arc<MemoryRegistry<serde_json::Value>>,
        channel: Arc<SyncChannel>,
        players: Vec<Member>,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryBackend::new()), true)
    }

    fn fixture_with(backend: Arc<dyn KvBackend>, with_players: bool) -> Fixture {
        let channel = Arc::new(SyncChannel::new(64));
        let gm = Member::authority("gm");
        let players = vec![Member::subordinate("p1"), Member::subordinate("p2")];
        channel.upsert_member(gm.clone());
        if with_players {
            for player in &players {
                channel.upsert_member(player.clone());
            }
        }

        let registry = Arc::new(MemoryRegistry::new());
        registry.register(volume(), SettingScope::Client, json!(0.5), false);
        registry.register(theme(), SettingScope::Client, json!("dark"), true);
        registry.register(GovernedId::new("core", "world"), SettingScope::World, json!(1), false);

        let store = AuthorityStore::<Settings>::open(backend).unwrap().into_shared();
        let authority = Authority::new(
            gm.id,
            store,
            registry.clone(),
            channel.clone(),
            channel.clone(),
            Duration::ZERO,
        );
        Fixture {
            authority,
            registry,
            channel,
            players,
        }
    }

    fn volume() -> GovernedId {
        GovernedId::new("moduleA", "volume")
    }

    fn theme() -> GovernedId {
        GovernedId::new("moduleA", "theme")
    }

    #[test]
    fn test_world_scope_not_governable() {
        let f = fixture();
        let err = f
            .authority
            .queue_soft(&GovernedId::new("core", "world"), true)
            .unwrap_err();
        assert!(matches!(err, SyncError::Core(CoreError::NotGovernable { .. })));
        assert!(matches!(
            f.authority.queue_soft(&GovernedId::new("x", "missing"), true),
            Err(SyncError::Core(CoreError::UnknownSetting(_)))
        ));
    }

    #[test]
    fn test_toggle_lock_all_round_trip() {
        let f = fixture();
        f.authority.apply_action(&volume(), LockAction::ToggleLockAll, None).unwrap();
        assert_eq!(f.authority.pending_lock_state(&volume()), LockState::HardAll);
        assert_eq!(f.authority.current_lock_state(&volume()), LockState::None);

        f.authority.flush().unwrap();
        assert_eq!(f.authority.current_lock_state(&volume()), LockState::HardAll);

        f.authority.apply_action(&volume(), LockAction::ToggleLockAll, None).unwrap();
        assert!(f.authority.is_unlock_queued(&volume()));
        f.authority.flush().unwrap();
        assert_eq!(f.authority.current_lock_state(&volume()), LockState::None);
    }

    #[test]
    fn test_choose_targets_partial() {
        let f = fixture();
        let only = [f.players[0].id].into();
        f.authority
            .apply_action(&volume(), LockAction::ChooseTargets, Some(only))
            .unwrap();
        assert_eq!(f.authority.pending_lock_state(&volume()), LockState::HardPartial);
        f.authority.flush().unwrap();
        assert_eq!(f.authority.current_lock_state(&volume()), LockState::HardPartial);
    }

    #[test]
    fn test_soft_flush_publishes_revisioned_push() {
        let f = fixture();
        let mut sub = f.channel.subscribe(f.players[0].id);

        f.authority.apply_action(&theme(), LockAction::ToggleSoft, None).unwrap();
        let outcome = f.authority.flush().unwrap();
        assert_eq!(outcome.pushes.len(), 1);

        let push = sub.try_recv().unwrap();
        match push.message {
            SyncMessage::Push(push) => {
                assert!(push.soft);
                assert_eq!(push.revision, Some(1));
                assert!(push.requires_reload);
            }
            other => panic!("expected push, got {other:?}"),
        }
        assert_eq!(sub.try_recv().unwrap().message, SyncMessage::Refresh);
    }

    #[test]
    fn test_push_once_leaves_store_empty() {
        let f = fixture();
        let mut sub = f.channel.subscribe(f.players[1].id);
        f.authority.apply_action(&volume(), LockAction::PushOnce, None).unwrap();
        let outcome = f.authority.flush().unwrap();

        assert!(!outcome.store_changed());
        assert_eq!(f.authority.current_lock_state(&volume()), LockState::None);
        assert!(matches!(sub.try_recv().unwrap().message, SyncMessage::Push(_)));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let f = fixture();
        let mut sub = f.channel.subscribe(f.players[0].id);
        let outcome = f.authority.flush().unwrap();
        assert!(!outcome.store_changed());
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_authority_edit_auto_unlocks() {
        let f = fixture();
        f.authority.queue_lock(&volume(), f.channel.subordinate_ids()).unwrap();
        f.authority.flush().unwrap();

        f.registry.set(&volume(), json!(0.9)).unwrap();
        assert!(f.authority.on_authority_edit(&volume()).unwrap());
        assert_eq!(f.authority.current_lock_state(&volume()), LockState::None);
    }

    #[test]
    fn test_soft_clear_drops_soft_record_only() {
        let f = fixture();
        f.authority.queue_soft(&theme(), true).unwrap();
        f.authority.queue_lock(&volume(), f.channel.subordinate_ids()).unwrap();
        f.authority.flush().unwrap();

        let sender = f.players[0].id;
        f.authority.handle(sender, Inbound::SoftClear(theme())).unwrap();
        f.authority.handle(sender, Inbound::SoftClear(theme())).unwrap();
        f.authority.handle(sender, Inbound::SoftClear(volume())).unwrap();

        assert_eq!(f.authority.current_lock_state(&theme()), LockState::None);
        assert_eq!(f.authority.current_lock_state(&volume()), LockState::HardAll);
    }

    #[test]
    fn test_lock_all_with_no_subordinates_locks() {
        let f = fixture_with(Arc::new(MemoryBackend::new()), false);
        assert!(f.channel.subordinate_ids().is_empty());

        f.authority.apply_action(&volume(), LockAction::ToggleLockAll, None).unwrap();
        assert_eq!(f.authority.pending_lock_state(&volume()), LockState::HardAll);
        assert!(!f.authority.is_unlock_queued(&volume()));

        f.authority.flush().unwrap();
        assert_eq!(f.authority.current_lock_state(&volume()), LockState::HardAll);

        // A subordinate joining afterwards is covered by the same record
        f.channel.upsert_member(f.players[0].clone());
        let store = f.authority.store();
        let store = store.read().unwrap();
        let record = store.get(&volume()).unwrap();
        assert_eq!(record.target_ids, None);
        assert!(record.applies_to(&f.players[0].id));
    }

    #[test]
    fn test_push_once_with_no_subordinates_broadcasts() {
        let f = fixture_with(Arc::new(MemoryBackend::new()), false);
        let mut late = f.channel.subscribe(f.players[1].id);

        f.authority.apply_action(&volume(), LockAction::PushOnce, None).unwrap();
        let outcome = f.authority.flush().unwrap();

        assert_eq!(outcome.pushes.len(), 1);
        assert_eq!(outcome.pushes[0].targets, None);
        match late.try_recv().unwrap().message {
            SyncMessage::Push(push) => assert_eq!(push.target_ids, None),
            other => panic!("expected push, got {other:?}"),
        }
    }

    #[test]
    fn test_dotted_namespace_rejected() {
        let f = fixture();
        let dotted = GovernedId::new("my.module", "theme");
        f.registry.register(dotted.clone(), SettingScope::Client, json!("dark"), false);

        let err = f.authority.queue_soft(&dotted, true).unwrap_err();
        assert_eq!(err, SyncError::Core(CoreError::MalformedId("my.module.theme".into())));
        assert_eq!(f.authority.queued_len(), 0);
    }

    #[test]
    fn test_failed_flush_keeps_queue_and_publishes_nothing() {
        let backend = Arc::new(FlakyBackend::default());
        backend.failing.store(true, Ordering::SeqCst);
        let f = fixture_with(backend.clone(), true);
        let mut sub = f.channel.subscribe(f.players[0].id);

        f.authority.queue_soft(&theme(), true).unwrap();
        f.authority.queue_lock(&volume(), f.channel.subordinate_ids()).unwrap();
        f.authority.queue_push(&theme(), [f.players[0].id].into()).unwrap();
        let queued = f.authority.queued_len();

        assert!(matches!(f.authority.flush(), Err(SyncError::Store(_))));
        assert_eq!(f.authority.queued_len(), queued);
        assert_eq!(f.authority.pending_lock_state(&theme()), LockState::Soft);
        assert_eq!(f.authority.current_lock_state(&theme()), LockState::None);
        assert!(sub.try_recv().is_none());

        backend.failing.store(false, Ordering::SeqCst);
        let outcome = f.authority.flush().unwrap();
        assert_eq!(f.authority.queued_len(), 0);
        assert_eq!(outcome.stored.len(), 2);
        assert_eq!(f.authority.current_lock_state(&theme()), LockState::Soft);
        assert_eq!(f.authority.current_lock_state(&volume()), LockState::HardAll);
        assert!(matches!(sub.try_recv().unwrap().message, SyncMessage::Push(_)));
    }
}
