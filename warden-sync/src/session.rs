//! Per-client sessions wiring both domains to one channel.
//!
//! A session owns the settings and key-binding instances of its role and
//! routes each incoming envelope to the domain that claims it. Dispatch
//! errors are logged and never stop the loop.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use warden_core::{
    BindingSet, Gesture, GestureTable, GovernedId, Member, Notifier, Targets, ValueRegistry,
};

use crate::authority::Authority;
use crate::channel::{Subscription, SyncChannel};
use crate::domain::{Domain, Settings};
use crate::error::SyncError;
use crate::ledger::RevisionLedger;
use crate::mirror::Controls;
use crate::protocol::Envelope;
use crate::storage::KvBackend;
use crate::store::{AuthorityStore, RecordSource};
use crate::subordinate::Subordinate;

/// Session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Refresh broadcasts inside this window are coalesced (default: 50ms)
    pub refresh_debounce_ms: u64,
    /// Authority reconcile period; 0 disables the loop (default: 30s)
    pub reconcile_interval_secs: u64,
    /// Frames buffered per receiver before it starts losing them
    pub channel_capacity: usize,
    pub gestures: GestureTable,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_debounce_ms: 50,
            reconcile_interval_secs: 30,
            channel_capacity: 256,
            gestures: GestureTable::default(),
        }
    }
}

impl SessionConfig {
    /// Immediate refreshes and no background reconcile.
    pub fn for_testing() -> Self {
        Self {
            refresh_debounce_ms: 0,
            reconcile_interval_secs: 0,
            channel_capacity: 64,
            gestures: GestureTable::default(),
        }
    }

    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }
}

pub struct AuthoritySession {
    member: Member,
    settings: Arc<Authority<Settings>>,
    controls: Arc<Authority<Controls>>,
    channel: Arc<SyncChannel>,
    config: SessionConfig,
}

impl AuthoritySession {
    /// Open both authority stores on `backend`. The channel's directory
    /// supplies the subordinate set.
    pub fn open(
        member: Member,
        backend: Arc<dyn KvBackend>,
        settings_registry: Arc<dyn ValueRegistry<serde_json::Value>>,
        controls_registry: Arc<dyn ValueRegistry<BindingSet>>,
        channel: Arc<SyncChannel>,
        config: SessionConfig,
    ) -> Result<Self, SyncError> {
        let debounce = config.refresh_debounce();
        let settings = Authority::new(
            member.id,
            AuthorityStore::<Settings>::open(backend.clone())?.into_shared(),
            settings_registry,
            channel.clone(),
            channel.clone(),
            debounce,
        );
        let controls = Authority::new(
            member.id,
            AuthorityStore::<Controls>::open(backend)?.into_shared(),
            controls_registry,
            channel.clone(),
            channel.clone(),
            debounce,
        );
        log::info!("Authority session opened for {}", member.name);

        Ok(Self {
            member,
            settings: Arc::new(settings),
            controls: Arc::new(controls),
            channel,
            config,
        })
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn settings(&self) -> &Arc<Authority<Settings>> {
        &self.settings
    }

    pub fn controls(&self) -> &Arc<Authority<Controls>> {
        &self.controls
    }

    /// Resolve a lock-icon gesture on a setting and queue the result.
    pub fn setting_gesture(
        &self,
        id: &GovernedId,
        gesture: Gesture,
        targets: Option<Targets>,
    ) -> Result<(), SyncError> {
        let action = self.config.gestures.resolve(gesture);
        self.settings.apply_action(id, action, targets)
    }

    pub fn control_gesture(
        &self,
        id: &GovernedId,
        gesture: Gesture,
        targets: Option<Targets>,
    ) -> Result<(), SyncError> {
        let action = self.config.gestures.resolve(gesture);
        self.controls.apply_action(id, action, targets)
    }

    /// Flush both queues. The controls queue is still flushed when the
    /// settings flush fails; the first error is returned.
    pub fn flush(&self) -> Result<(), SyncError> {
        let settings = self.settings.flush();
        let controls = self.controls.flush();
        settings?;
        controls?;
        Ok(())
    }

    pub fn dispatch(&self, envelope: Envelope) -> Result<(), SyncError> {
        let sender = envelope.sender;
        if let Some(inbound) = Settings::route(&envelope.message) {
            return self.settings.handle(sender, inbound);
        }
        if let Some(inbound) = Controls::route(&envelope.message) {
            return self.controls.handle(sender, inbound);
        }
        Ok(())
    }

    /// Dispatch until the channel closes.
    pub async fn run(&self, mut subscription: Subscription) {
        while let Some(envelope) = subscription.recv().await {
            let kind = envelope.message.type_name();
            if let Err(e) = self.dispatch(envelope) {
                log::warn!("Authority failed to handle {kind}: {e}");
            }
        }
        log::info!("Authority session for {} stopped", self.member.name);
    }

    /// Join the channel and start the dispatch loop plus, when configured,
    /// both reconcile loops.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let subscription = self.channel.join(self.member.clone());
        let mut tasks = Vec::new();

        if self.config.reconcile_interval_secs > 0 {
            let interval = Duration::from_secs(self.config.reconcile_interval_secs);
            tasks.push(self.settings.clone().spawn_reconcile_loop(interval));
            tasks.push(self.controls.clone().spawn_reconcile_loop(interval));
        }

        let session = self.clone();
        tasks.push(tokio::spawn(async move { session.run(subscription).await }));
        tasks
    }
}

/// Read-side handles a subordinate needs for one domain.
pub struct DomainHandles<D: Domain> {
    pub records: Arc<dyn RecordSource<D>>,
    pub registry: Arc<dyn ValueRegistry<D::Value>>,
}

pub struct SubordinateSession {
    member: Member,
    settings: Subordinate<Settings>,
    controls: Subordinate<Controls>,
    channel: Arc<SyncChannel>,
}

impl SubordinateSession {
    /// `ledger_backend` is this client's local storage.
    pub fn open(
        member: Member,
        ledger_backend: Arc<dyn KvBackend>,
        settings: DomainHandles<Settings>,
        controls: DomainHandles<Controls>,
        notifier: Arc<dyn Notifier>,
        channel: Arc<SyncChannel>,
    ) -> Result<Self, SyncError> {
        let settings = Subordinate::new(
            member.id,
            settings.records,
            RevisionLedger::open(ledger_backend.clone())?,
            settings.registry,
            channel.clone(),
            notifier.clone(),
        );
        let controls = Subordinate::new(
            member.id,
            controls.records,
            RevisionLedger::open(ledger_backend)?,
            controls.registry,
            channel.clone(),
            notifier,
        );

        Ok(Self {
            member,
            settings,
            controls,
            channel,
        })
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn settings(&self) -> &Subordinate<Settings> {
        &self.settings
    }

    pub fn controls(&self) -> &Subordinate<Controls> {
        &self.controls
    }

    /// Full refresh of both domains. Recovers anything missed while offline.
    pub fn catch_up(&self) -> Result<usize, SyncError> {
        let applied = self.settings.refresh()? + self.controls.refresh()?;
        log::info!("{} caught up: {applied} values applied", self.member.name);
        Ok(applied)
    }

    pub fn dispatch(&self, envelope: Envelope) -> Result<(), SyncError> {
        if let Some(inbound) = Settings::route(&envelope.message) {
            return self.settings.handle(inbound);
        }
        if let Some(inbound) = Controls::route(&envelope.message) {
            return self.controls.handle(inbound);
        }
        Ok(())
    }

    pub async fn run(&self, mut subscription: Subscription) {
        while let Some(envelope) = subscription.recv().await {
            let kind = envelope.message.type_name();
            if let Err(e) = self.dispatch(envelope) {
                log::warn!("{} failed to handle {kind}: {e}", self.member.name);
            }
        }
    }

    /// Join the channel, catch up, and start the dispatch loop.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let subscription = self.channel.join(self.member.clone());
        if let Err(e) = self.catch_up() {
            log::warn!("{} catch-up failed: {e}", self.member.name);
        }
        tokio::spawn(async move { self.run(subscription).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use warden_core::MemoryRegistry;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.refresh_debounce(), Duration::from_millis(50));
        assert_eq!(config.reconcile_interval_secs, 30);
    }

    #[test]
    fn test_session_config_partial_json() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"refresh_debounce_ms": 5}"#).unwrap();
        assert_eq!(config.refresh_debounce_ms, 5);
        assert_eq!(config.channel_capacity, 256);
    }

    #[test]
    fn test_authority_dispatch_ignores_foreign_refresh() {
        let channel = Arc::new(SyncChannel::new(16));
        let session = AuthoritySession::open(
            Member::authority("gm"),
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryRegistry::<serde_json::Value>::new()),
            Arc::new(MemoryRegistry::<BindingSet>::new()),
            channel,
            SessionConfig::for_testing(),
        )
        .unwrap();

        let envelope = Envelope::new(uuid::Uuid::new_v4(), crate::protocol::SyncMessage::CtrlRefresh);
        assert!(session.dispatch(envelope).is_ok());
    }
}
