//! Key-binding sets governed by the control mirror.
//!
//! The host binding API can enumerate logically identical sets in any
//! order, so equality normalizes first: modifiers sorted within each entry,
//! entries sorted on `(key, modifiers)`.

use serde::{Deserialize, Serialize};

/// A single key binding: a key plus its modifier names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyBinding {
    pub key: String,
    #[serde(default)]
    pub modifiers: Vec<String>,
}

impl KeyBinding {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            modifiers: Vec::new(),
        }
    }

    pub fn with_modifier(mut self, modifier: impl Into<String>) -> Self {
        self.modifiers.push(modifier.into());
        self
    }

    fn normalized(&self) -> KeyBinding {
        let mut modifiers = self.modifiers.clone();
        modifiers.sort();
        KeyBinding {
            key: self.key.clone(),
            modifiers,
        }
    }
}

/// Bindings assigned to one action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindingSet(pub Vec<KeyBinding>);

impl BindingSet {
    pub fn new(bindings: Vec<KeyBinding>) -> Self {
        Self(bindings)
    }

    /// Canonical form used for comparison and fingerprinting.
    pub fn normalize(&self) -> BindingSet {
        let mut entries: Vec<KeyBinding> = self.0.iter().map(KeyBinding::normalized).collect();
        entries.sort();
        BindingSet(entries)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyBinding> {
        self.0.iter()
    }
}

impl PartialEq for BindingSet {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.normalize().0 == other.normalize().0
    }
}

impl Eq for BindingSet {}

impl From<Vec<KeyBinding>> for BindingSet {
    fn from(bindings: Vec<KeyBinding>) -> Self {
        Self(bindings)
    }
}
