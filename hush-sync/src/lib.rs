//! # hush-sync: live sync and optimistic interaction runtime
//!
//! Keeps a client in step with the push endpoint and applies the user's own
//! votes and bookmarks locally before the server confirms them.
//!
//! ## Architecture
//!
//! ```text
//!   push endpoint ──► ConnectionManager ──► pump task ──► Dispatcher
//!   (/ws/{identity})   (reconnect loop)        │           │  subscribers
//!                                              │           │  notifications
//!                                              │           ▼
//!                                              │        EventLog ──► LocalStore
//!                                              ▼
//!                             VoteCoordinator::reconcile (server aggregate)
//!
//!   UI vote ──► VoteCoordinator ──► InteractionStore ──► LocalStore (RocksDB)
//!                     │
//!                     └──► VoteWriter (external CRUD) ── fail ──► rollback
//! ```
//!
//! Everything is owned by one [`SyncContext`], built at the application
//! root and shared by reference.
//!
//! ## Modules
//!
//! - [`transport`]: WebSocket connection manager with reconnect policy
//! - [`dispatch`]: classification, fan-out, event log ownership
//! - [`store`]: RocksDB device store (records, bookmarks, event log)
//! - [`interactions`]: identity-scoped interaction state
//! - [`optimistic`]: optimistic vote coordinator with rollback
//! - [`context`]: application-root context wiring it all together
//! - [`relay`]: reference push relay for local runs and tests

pub mod context;
pub mod dispatch;
pub mod interactions;
pub mod optimistic;
pub mod relay;
pub mod store;
pub mod transport;

pub use context::{SyncConfig, SyncContext};
pub use dispatch::{Classified, DispatchStats, Dispatcher, Subscriber, SubscriptionId};
pub use interactions::InteractionStore;
pub use optimistic::{VoteCoordinator, VoteError, VoteOutcome, VoteWriter, WriteError};
pub use relay::{PushRelay, RelayConfig, RelayError, RelayHandle, RelayStats};
pub use store::{LocalStore, StoreConfig, StoreError};
pub use transport::{
    ConnectionManager, ConnectionState, ReconnectPolicy, TransportConfig, TransportError,
    TransportEvent,
};
