use thiserror::Error;
use warden_core::CoreError;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors surfaced by authority and subordinate sessions.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("session state poisoned")]
    Poisoned,
}
