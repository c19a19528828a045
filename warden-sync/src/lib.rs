//! # warden-sync: Settings lock & sync protocol
//!
//! One authority per session governs client-scoped settings and key
//! bindings on many subordinates, with hard (reverted) and soft (advisory,
//! applied once) enforcement.
//!
//! ## Architecture
//!
//! ```text
//!  gestures ─► OperationQueue ─flush─► AuthorityStore ──► KvBackend
//!                                  │         ▲            (RocksDB)
//!                          push / refresh    │ reads
//!                                  ▼         │
//! ┌────────────┐  WebSocket  ┌─────────────┐ │  ┌─────────────────────┐
//! │ RelayClient│ ◄─────────► │ RelayServer │ └──┤ Subordinate         │
//! └─────┬──────┘             └─────────────┘    │  GuardInterceptor   │
//!       ▼                                       │  RevisionLedger     │
//!  SyncChannel (tokio broadcast) ─────────────► └─────────────────────┘
//!                                 soft-clear ◄──
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages, envelopes and relay frames
//! - [`domain`]: the [`Domain`] abstraction and the scalar [`Settings`] domain
//! - [`mirror`]: the key-binding [`Controls`] domain
//! - [`storage`]: atomic key-value backends (RocksDB, memory)
//! - [`store`]: authority lock records and revision counters
//! - [`queue`]: pending authority operations
//! - [`ledger`]: subordinate revision ledger
//! - [`guard`]: local write verdicts
//! - [`channel`]: in-process pub/sub, directory and refresh debouncing
//! - [`authority`] / [`subordinate`]: per-domain roles
//! - [`session`]: per-client sessions dispatching both domains
//! - [`server`] / [`client`]: WebSocket relay

pub mod authority;
pub mod channel;
pub mod client;
pub mod domain;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod mirror;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod session;
pub mod storage;
pub mod store;
pub mod subordinate;

// Re-exports for convenience
pub use authority::Authority;
pub use channel::{ChannelStats, RefreshDebouncer, Subscription, SyncChannel};
pub use client::{ConnectionState, RelayClient};
pub use domain::{Domain, Inbound, Push, Settings};
pub use error::SyncError;
pub use guard::{GuardInterceptor, Verdict};
pub use ledger::{LedgerEntry, RevisionLedger};
pub use mirror::{ControlAuthority, ControlStore, ControlSubordinate, Controls};
pub use protocol::{CtrlPushMessage, Envelope, Frame, ProtocolError, PushMessage, SyncMessage};
pub use queue::OperationQueue;
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{AuthoritySession, DomainHandles, SessionConfig, SubordinateSession};
pub use storage::{KvBackend, MemoryBackend, RocksBackend, StoreConfig, StoreError};
pub use store::{AuthorityStore, CommitOutcome, ReconcileReport, RecordSource, SharedStore};
pub use subordinate::Subordinate;

pub type SettingsAuthority = Authority<Settings>;
pub type SettingsSubordinate = Subordinate<Settings>;
pub type SettingsStore = AuthorityStore<Settings>;
