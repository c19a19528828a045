//! Key-binding mirror.
//!
//! Same protocol as scalar settings, keyed by `(namespace, action)` and
//! governing [`BindingSet`]s. Storage and ledger keys carry the `ctrl:`
//! prefix so both domains share one database.
//!
//! Binding sets compare order-insensitively: the host's binding API may
//! enumerate the same set in a different order on each read.

use warden_core::{BindingSet, GovernedId};

use crate::authority::Authority;
use crate::domain::{fingerprint_json, Domain, Inbound, Push};
use crate::protocol::{CtrlPushMessage, SyncMessage};
use crate::store::AuthorityStore;
use crate::subordinate::Subordinate;

pub struct Controls;

pub type ControlAuthority = Authority<Controls>;
pub type ControlSubordinate = Subordinate<Controls>;
pub type ControlStore = AuthorityStore<Controls>;

impl Domain for Controls {
    type Value = BindingSet;

    const NAME: &'static str = "controls";
    const KEY_PREFIX: &'static str = "ctrl:";

    fn same_value(a: &BindingSet, b: &BindingSet) -> bool {
        a == b
    }

    fn fingerprint(value: &BindingSet) -> u64 {
        fingerprint_json(&value.normalize())
    }

    fn refresh_message() -> SyncMessage {
        SyncMessage::CtrlRefresh
    }

    fn push_message(push: Push<BindingSet>) -> SyncMessage {
        SyncMessage::CtrlPush(CtrlPushMessage {
            namespace: push.id.namespace,
            action: push.id.key,
            value: push.value,
            target_ids: push.targets,
            soft: push.soft,
            revision: push.revision,
        })
    }

    fn soft_clear_message(id: &GovernedId) -> SyncMessage {
        SyncMessage::CtrlSoftClear {
            namespace: id.namespace.clone(),
            action: id.key.clone(),
        }
    }

    fn route(message: &SyncMessage) -> Option<Inbound<BindingSet>> {
        match message {
            SyncMessage::CtrlRefresh => Some(Inbound::Refresh),
            SyncMessage::CtrlPush(push) => Some(Inbound::Push(Push {
                id: GovernedId::new(push.namespace.clone(), push.action.clone()),
                value: push.value.clone(),
                soft: push.soft,
                revision: push.revision,
                targets: push.target_ids.clone(),
                requires_reload: false,
            })),
            SyncMessage::CtrlSoftClear { namespace, action } => Some(Inbound::SoftClear(
                GovernedId::new(namespace.clone(), action.clone()),
            )),
            SyncMessage::Refresh | SyncMessage::Push(_) | SyncMessage::SoftClear { .. } => None,
        }
    }
}
