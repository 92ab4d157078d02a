//! # hush-core: data model for the live confession feed
//!
//! Everything here is pure: no sockets, no storage, no clocks beyond
//! [`unix_millis`]. The runtime in `hush-sync` drives these types.
//!
//! ## Data flow
//!
//! ```text
//!  push frame (JSON text)
//!        │
//!        ▼
//!  wire::decode ──► Inbound::Control (greeting, pong, echo, error)
//!        │
//!        ▼
//!  Inbound::Event ──► LiveEvent { id, received_at, payload }
//!                            │
//!                            ▼
//!                     EventLog (bounded, FIFO)
//!
//!  user action ──► VoteTransition::compute(from, action) ──► Δ
//!                            │
//!                            ▼
//!                 InteractionRecord per (ContentId, Identity)
//! ```
//!
//! ## Modules
//!
//! - [`ids`]: `Identity` and `ContentId` handles
//! - [`event`]: closed `LiveEvent` variants and their payloads
//! - [`wire`]: validating JSON codec for push frames
//! - [`history`]: bounded, de-duplicating event log
//! - [`vote`]: vote state machine and count deltas
//! - [`interaction`]: per-identity interaction records and bookmarks
//! - [`format`]: display helpers for counts

pub mod event;
pub mod format;
pub mod ids;
pub mod interaction;
pub mod history;
pub mod vote;
pub mod wire;

pub use event::{
    ConfessionPayload, CrisisResources, EventId, EventKind, EventPayload, LiveEvent, Notification,
    ReplyPayload, VoteUpdate,
};
pub use format::format_count;
pub use ids::{ContentId, Identity, ANONYMOUS};
pub use interaction::{BookmarkSnapshot, InteractionKey, InteractionRecord};
pub use history::{EventLog, DEFAULT_LOG_CAPACITY};
pub use vote::{VoteAction, VoteDirection, VoteTransition};
pub use wire::{ControlFrame, DecodeError, Inbound};

/// Milliseconds since the Unix epoch, saturating to zero on a skewed clock.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
