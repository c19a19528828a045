//! Lock-icon gesture dispatch.
//!
//! Each pointer gesture on a lock icon maps to one named action through an
//! explicit table. Every gesture has an entry, so resolution is total.

use serde::{Deserialize, Serialize};

/// Pointer gestures recognised on a lock icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Gesture {
    Click,
    ShiftClick,
    RightClick,
    ShiftRightClick,
}

impl Gesture {
    pub fn from_input(secondary_button: bool, shift: bool) -> Self {
        match (secondary_button, shift) {
            (false, false) => Gesture::Click,
            (false, true) => Gesture::ShiftClick,
            (true, false) => Gesture::RightClick,
            (true, true) => Gesture::ShiftRightClick,
        }
    }
}

/// Named lock actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockAction {
    /// Toggle a hard lock for every subordinate. Default action, bound to a
    /// plain click.
    #[default]
    ToggleLockAll,
    /// Hard-lock for an explicit subset of subordinates.
    ChooseTargets,
    /// Toggle soft (advisory) mode.
    ToggleSoft,
    /// One-shot push of the current value without enforcement.
    PushOnce,
}

/// Gesture → action table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GestureTable {
    pub click: LockAction,
    pub shift_click: LockAction,
    pub right_click: LockAction,
    pub shift_right_click: LockAction,
}

impl Default for GestureTable {
    fn default() -> Self {
        Self {
            click: LockAction::ToggleLockAll,
            shift_click: LockAction::ToggleSoft,
            right_click: LockAction::ChooseTargets,
            shift_right_click: LockAction::PushOnce,
        }
    }
}

impl GestureTable {
    pub fn resolve(&self, gesture: Gesture) -> LockAction {
        match gesture {
            Gesture::Click => self.click,
            Gesture::ShiftClick => self.shift_click,
            Gesture::RightClick => self.right_click,
            Gesture::ShiftRightClick => self.shift_right_click,
        }
    }
}
