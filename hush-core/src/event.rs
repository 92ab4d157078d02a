//! Typed live events pushed by the server.
//!
//! The set of variants is closed: anything the wire codec cannot map onto
//! one of these four is either a control frame or dropped.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::ids::ContentId;
use crate::vote::VoteAction;

/// Discriminant of [`EventPayload`], used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ContentCreated,
    ReplyCreated,
    VoteChanged,
    CrisisAdvisory,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::ContentCreated,
        EventKind::ReplyCreated,
        EventKind::VoteChanged,
        EventKind::CrisisAdvisory,
    ];

    /// The `type` discriminator on the wire.
    pub fn wire_type(self) -> &'static str {
        match self {
            EventKind::ContentCreated => "new_confession",
            EventKind::ReplyCreated => "new_reply",
            EventKind::VoteChanged => "vote_update",
            EventKind::CrisisAdvisory => "crisis_support",
        }
    }

    pub fn from_wire(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.wire_type() == raw)
    }
}

/// Identifier of one event within a connection session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Id for a frame the server did not label: session plus sequence.
    pub fn generated(session: Uuid, sequence: u64) -> Self {
        Self(format!("{session}:{sequence}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A newly stored confession.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfessionPayload {
    pub id: String,
    /// Transaction id on the storage chain; empty until the upload settled.
    #[serde(default)]
    pub tx_id: String,
    pub content: String,
    pub author: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub upvotes: i64,
    #[serde(default)]
    pub mood: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub gateway_url: Option<String>,
}

impl ConfessionPayload {
    /// Confessions are addressed by transaction id once they have one.
    pub fn content_id(&self) -> ContentId {
        if self.tx_id.is_empty() {
            ContentId::new(self.id.clone())
        } else {
            ContentId::new(self.tx_id.clone())
        }
    }
}

/// A newly stored reply to a confession.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub id: String,
    pub confession_id: String,
    pub content: String,
    pub author: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub upvotes: i64,
}

/// Someone voted on a confession.
///
/// Votes are anonymous: the frame never says who voted. When the server
/// includes tallies, they are authoritative for the displayed score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteUpdate {
    pub confession_id: ContentId,
    pub vote_type: VoteAction,
    #[serde(default)]
    pub upvotes: Option<i64>,
    #[serde(default)]
    pub downvotes: Option<i64>,
}

impl VoteUpdate {
    /// Server net score, when both tallies were sent and their difference
    /// fits in an `i64`.
    pub fn aggregate(&self) -> Option<i64> {
        let (up, down) = (self.upvotes?, self.downvotes?);
        let net = up.checked_sub(down);
        if net.is_none() {
            log::warn!(
                "Ignoring out-of-range tallies {up}/{down} for {}",
                self.confession_id
            );
        }
        net
    }
}

/// Support resources pushed after crisis detection on the author's post.
///
/// Missing fields fall back to the built-in hotlines, so an advisory is
/// never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrisisResources {
    pub hotline: String,
    pub chat: String,
    pub text: String,
}

impl Default for CrisisResources {
    fn default() -> Self {
        Self {
            hotline: "988 - Suicide & Crisis Lifeline".to_string(),
            chat: "https://suicidepreventionlifeline.org/chat/".to_string(),
            text: "Text HOME to 741741".to_string(),
        }
    }
}

/// The closed set of push payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    ContentCreated(ConfessionPayload),
    ReplyCreated(ReplyPayload),
    VoteChanged(VoteUpdate),
    CrisisAdvisory(CrisisResources),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ContentCreated(_) => EventKind::ContentCreated,
            EventPayload::ReplyCreated(_) => EventKind::ReplyCreated,
            EventPayload::VoteChanged(_) => EventKind::VoteChanged,
            EventPayload::CrisisAdvisory(_) => EventKind::CrisisAdvisory,
        }
    }

    /// The content this event is about, if any.
    pub fn content_id(&self) -> Option<ContentId> {
        match self {
            EventPayload::ContentCreated(c) => Some(c.content_id()),
            EventPayload::ReplyCreated(r) => Some(ContentId::new(r.id.clone())),
            EventPayload::VoteChanged(v) => Some(v.confession_id.clone()),
            EventPayload::CrisisAdvisory(_) => None,
        }
    }
}

/// A decoded, identified, timestamped push event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEvent {
    pub id: EventId,
    /// Local receipt time, ms since epoch.
    pub received_at: u64,
    pub payload: EventPayload,
}

impl LiveEvent {
    pub fn new(id: EventId, payload: EventPayload) -> Self {
        Self {
            id,
            received_at: crate::unix_millis(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Title and body for a notification panel row.
    pub fn notification(&self) -> Notification {
        let (title, body) = match &self.payload {
            EventPayload::ContentCreated(c) => (
                "New Confession",
                format!("{} shared a new confession", c.author),
            ),
            EventPayload::ReplyCreated(r) => (
                "New Reply",
                format!("{} replied to a confession", r.author),
            ),
            EventPayload::VoteChanged(v) => (
                "Vote Update",
                format!("Someone {}d a confession", v.vote_type.as_wire()),
            ),
            EventPayload::CrisisAdvisory(res) => (
                "Crisis Support Resources",
                format!(
                    "We detected you might need support. {} | {} | {}",
                    res.hotline, res.text, res.chat
                ),
            ),
        };
        Notification {
            title: title.to_string(),
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
}
