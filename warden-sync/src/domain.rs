//! Governed value domains.
//!
//! Scalar settings and key bindings run the same protocol over different
//! value types and wire messages. [`Domain`] captures the differences:
//! value comparison, fingerprinting, the storage key prefix, and the mapping
//! between protocol intents and [`SyncMessage`] variants. Everything else
//! (store, queue, ledger, guard, sessions) is generic over it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use warden_core::{GovernedId, Targets};

use crate::protocol::{PushMessage, SyncMessage};

/// A value push in domain terms.
#[derive(Debug, Clone, PartialEq)]
pub struct Push<V> {
    pub id: GovernedId,
    pub value: V,
    pub soft: bool,
    pub revision: Option<u64>,
    /// `None` targets every subordinate.
    pub targets: Option<Targets>,
    pub requires_reload: bool,
}

impl<V> Push<V> {
    pub fn applies_to(&self, peer: &warden_core::PeerId) -> bool {
        self.targets.as_ref().map_or(true, |t| t.contains(peer))
    }
}

/// A decoded message addressed to one domain.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound<V> {
    Refresh,
    Push(Push<V>),
    SoftClear(GovernedId),
}

pub trait Domain: Send + Sync + 'static {
    type Value: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Human-readable name for logs.
    const NAME: &'static str;

    /// Prefix applied to every storage key, keeping domains disjoint.
    const KEY_PREFIX: &'static str;

    fn same_value(a: &Self::Value, b: &Self::Value) -> bool;

    /// Stable 64-bit fingerprint recorded in subordinate ledgers.
    fn fingerprint(value: &Self::Value) -> u64 {
        fingerprint_json(value)
    }

    fn refresh_message() -> SyncMessage;

    fn push_message(push: Push<Self::Value>) -> SyncMessage;

    fn soft_clear_message(id: &GovernedId) -> SyncMessage;

    /// Claim a message for this domain. Returns `None` for messages that
    /// belong to the other domain.
    fn route(message: &SyncMessage) -> Option<Inbound<Self::Value>>;

    fn storage_key(id: &GovernedId) -> String {
        format!("{}{}", Self::KEY_PREFIX, id.as_key())
    }
}

/// FNV-1a over the canonical JSON encoding.
///
/// `serde_json` maps keep keys sorted, so equal values encode identically.
pub fn fingerprint_json<T: Serialize + ?Sized>(value: &T) -> u64 {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    fnv1a(&bytes)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325; // FNV offset basis
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3); // FNV prime
    }
    hash
}

/// Scalar client settings.
pub struct Settings;

impl Domain for Settings {
    type Value = serde_json::Value;

    const NAME: &'static str = "settings";
    const KEY_PREFIX: &'static str = "setting:";

    fn same_value(a: &Self::Value, b: &Self::Value) -> bool {
        a == b
    }

    fn refresh_message() -> SyncMessage {
        SyncMessage::Refresh
    }

    fn push_message(push: Push<Self::Value>) -> SyncMessage {
        SyncMessage::Push(PushMessage {
            soft: push.soft,
            id: push.id.as_key(),
            namespace: push.id.namespace,
            key: push.id.key,
            value: push.value,
            revision: push.revision,
            target_ids: push.targets,
            requires_reload: push.requires_reload,
        })
    }

    fn soft_clear_message(id: &GovernedId) -> SyncMessage {
        SyncMessage::SoftClear { id: id.as_key() }
    }

    fn route(message: &SyncMessage) -> Option<Inbound<Self::Value>> {
        match message {
            SyncMessage::Refresh => Some(Inbound::Refresh),
            SyncMessage::Push(push) => Some(Inbound::Push(Push {
                id: GovernedId::new(push.namespace.clone(), push.key.clone()),
                value: push.value.clone(),
                soft: push.soft,
                revision: push.revision,
                targets: push.target_ids.clone(),
                requires_reload: push.requires_reload,
            })),
            SyncMessage::SoftClear { id } => match GovernedId::parse(id) {
                Ok(id) => Some(Inbound::SoftClear(id)),
                Err(e) => {
                    log::debug!("Dropping soft-clear: {e}");
                    None
                }
            },
            SyncMessage::CtrlRefresh
            | SyncMessage::CtrlPush(_)
            | SyncMessage::CtrlSoftClear { .. } => None,
        }
    }
}
