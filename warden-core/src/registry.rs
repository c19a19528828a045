//! Collaborator interfaces consumed by the protocol.
//!
//! The host application owns the real settings registry, the user directory
//! and the notification UI. The in-memory implementations here back tests
//! and headless hosts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use crate::{CoreError, GovernedId, PeerId, Targets};

/// Where a setting's value lives. Only client-scoped settings are governed;
/// world values are already shared by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingScope {
    Client,
    User,
    World,
}

/// Key-value registry exposing live values.
pub trait ValueRegistry<V>: Send + Sync {
    fn get(&self, id: &GovernedId) -> Option<V>;
    fn set(&self, id: &GovernedId, value: V) -> Result<(), CoreError>;
    fn scope(&self, id: &GovernedId) -> Option<SettingScope>;
    fn requires_reload(&self, id: &GovernedId) -> bool;
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    scope: SettingScope,
    requires_reload: bool,
}

/// Thread-safe in-memory registry.
pub struct MemoryRegistry<V> {
    entries: RwLock<HashMap<GovernedId, Entry<V>>>,
    writes: AtomicU64,
}

impl<V: Clone> MemoryRegistry<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Register (or replace) an entry without counting it as a write.
    pub fn register(&self, id: GovernedId, scope: SettingScope, value: V, requires_reload: bool) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            id,
            Entry {
                value,
                scope,
                requires_reload,
            },
        );
    }

    pub fn set_requires_reload(&self, id: &GovernedId, requires_reload: bool) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(id) {
            entry.requires_reload = requires_reload;
        }
    }

    /// Number of successful `set` calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl<V: Clone> Default for MemoryRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> ValueRegistry<V> for MemoryRegistry<V> {
    fn get(&self, id: &GovernedId) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(id).map(|e| e.value.clone())
    }

    fn set(&self, id: &GovernedId, value: V) -> Result<(), CoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| CoreError::Registry(e.to_string()))?;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownSetting(id.clone()))?;
        entry.value = value;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn scope(&self, id: &GovernedId) -> Option<SettingScope> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(id).map(|e| e.scope)
    }

    fn requires_reload(&self, id: &GovernedId) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(id).is_some_and(|e| e.requires_reload)
    }
}

// ─── Directory ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Authority,
    Subordinate,
}

/// A client known to the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: PeerId,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub online: bool,
}

impl Member {
    pub fn authority(name: impl Into<String>) -> Self {
        Self {
            id: PeerId::new_v4(),
            name: name.into(),
            role: Role::Authority,
            online: true,
        }
    }

    pub fn subordinate(name: impl Into<String>) -> Self {
        Self {
            id: PeerId::new_v4(),
            name: name.into(),
            role: Role::Subordinate,
            online: true,
        }
    }
}

/// Directory of clients with role and online status.
pub trait SubordinateDirectory: Send + Sync {
    fn members(&self) -> Vec<Member>;

    /// Every known subordinate, online or not.
    fn subordinate_ids(&self) -> Targets {
        self.members()
            .into_iter()
            .filter(|m| m.role == Role::Subordinate)
            .map(|m| m.id)
            .collect()
    }

    fn online_subordinate_ids(&self) -> Targets {
        self.members()
            .into_iter()
            .filter(|m| m.role == Role::Subordinate && m.online)
            .map(|m| m.id)
            .collect()
    }
}

/// Fixed member list with mutable online flags.
#[derive(Default)]
pub struct StaticDirectory {
    members: RwLock<Vec<Member>>,
}

impl StaticDirectory {
    pub fn new(members: Vec<Member>) -> Self {
        Self {
            members: RwLock::new(members),
        }
    }

    pub fn set_online(&self, id: &PeerId, online: bool) {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        if let Some(member) = members.iter_mut().find(|m| &m.id == id) {
            member.online = online;
        }
    }
}

impl SubordinateDirectory for StaticDirectory {
    fn members(&self) -> Vec<Member> {
        self.members.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

// ─── Notifications ────────────────────────────────────────────────────────

/// User-facing notices raised by the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A local edit was reverted because the authority holds a hard lock.
    Locked(GovernedId),
    /// A synced value only takes effect after a reload.
    ReloadRequired(GovernedId),
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match notice {
            Notice::Locked(id) => log::warn!("{id} is locked by the authority; local change reverted"),
            Notice::ReloadRequired(id) => log::info!("{id} changed; reload required to apply"),
        }
    }
}

/// Buffers notices until the host drains them.
#[derive(Default)]
pub struct QueuedNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl QueuedNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Notice> {
        let mut notices = self.notices.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *notices)
    }
}

impl Notifier for QueuedNotifier {
    fn notify(&self, notice: Notice) {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notice);
    }
}
