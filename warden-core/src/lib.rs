//! # warden-core: Data model for governed client settings
//!
//! Shared vocabulary for the lock/sync protocol implemented in `warden-sync`:
//!
//! - [`GovernedId`]: `(namespace, key)` identity, rendered as `"namespace.key"`
//! - [`record`]: lock records, pending operations, lock state
//! - [`binding`]: key-binding sets with order-insensitive equality
//! - [`registry`]: collaborator traits (value registry, subordinate directory,
//!   notification surface) plus in-memory implementations
//! - [`gesture`]: lock-icon gesture table

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub mod binding;
pub mod gesture;
pub mod record;
pub mod registry;

pub use binding::{BindingSet, KeyBinding};
pub use gesture::{Gesture, GestureTable, LockAction};
pub use record::{LockMode, LockRecord, LockState, OpKind, Operation, PendingOperation};
pub use registry::{
    LogNotifier, Member, MemoryRegistry, Notice, Notifier, QueuedNotifier, Role,
    SettingScope, StaticDirectory, SubordinateDirectory, ValueRegistry,
};

/// Identity of a connected client (authority or subordinate).
pub type PeerId = Uuid;

/// Alias used where only subordinates are meaningful.
pub type SubordinateId = Uuid;

/// A set of targeted subordinates. Ordered so records serialize stably.
pub type Targets = BTreeSet<SubordinateId>;

/// Composite identity of a governed entry.
///
/// Settings use `(namespace, key)`; the keybinding mirror reuses the same
/// shape with `key` holding the action name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GovernedId {
    pub namespace: String,
    pub key: String,
}

pub type SettingId = GovernedId;
pub type ControlId = GovernedId;

impl GovernedId {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// Parse a `"namespace.key"` string. The namespace ends at the first dot;
    /// keys may contain further dots.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw.split_once('.') {
            Some((namespace, key)) if !namespace.is_empty() && !key.is_empty() => {
                Ok(Self::new(namespace, key))
            }
            _ => Err(CoreError::MalformedId(raw.to_string())),
        }
    }

    /// Single string key used for storage and the wire `id` field.
    pub fn as_key(&self) -> String {
        format!("{}.{}", self.namespace, self.key)
    }

    /// Both parts are present and the namespace holds no dot, so
    /// [`GovernedId::parse`] of [`GovernedId::as_key`] gives the id back.
    pub fn is_valid(&self) -> bool {
        !self.namespace.is_empty() && !self.namespace.contains('.') && !self.key.is_empty()
    }
}

impl fmt::Display for GovernedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.key)
    }
}

/// Errors raised by the data model and its collaborators.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    #[error("malformed identifier: {0:?}")]
    MalformedId(String),
    #[error("unknown setting: {0}")]
    UnknownSetting(GovernedId),
    #[error("setting {id} has scope {scope:?} and cannot be governed")]
    NotGovernable { id: GovernedId, scope: SettingScope },
    #[error("registry error: {0}")]
    Registry(String),
}
