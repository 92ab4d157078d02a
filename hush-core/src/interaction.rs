//! Per-identity interaction records.
//!
//! Records are addressed by a structured `(ContentId, Identity)` key. The
//! byte encoding used by device storage puts the identity first and
//! length-prefixes both parts, so no pair of strings can collide and all
//! records of one identity share a scannable prefix.

use serde::{Deserialize, Serialize};

use crate::ids::{ContentId, Identity};
use crate::vote::VoteDirection;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InteractionKey {
    pub content_id: ContentId,
    pub identity: Identity,
}

impl InteractionKey {
    pub fn new(content_id: ContentId, identity: Identity) -> Self {
        Self {
            content_id,
            identity,
        }
    }

    /// `len(identity) ‖ identity ‖ len(content) ‖ content`, lengths as u32 BE.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Self::identity_prefix(&self.identity);
        push_part(&mut out, self.content_id.as_str());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (identity, rest) = take_part(bytes)?;
        let (content, rest) = take_part(rest)?;
        if !rest.is_empty() {
            return None;
        }
        Some(Self {
            content_id: ContentId::new(content),
            identity: Identity::new(identity),
        })
    }

    /// Prefix shared by every key of `identity`.
    pub fn identity_prefix(identity: &Identity) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + identity.as_str().len());
        push_part(&mut out, identity.as_str());
        out
    }
}

fn push_part(out: &mut Vec<u8>, part: &str) {
    out.extend_from_slice(&(part.len() as u32).to_be_bytes());
    out.extend_from_slice(part.as_bytes());
}

fn take_part(bytes: &[u8]) -> Option<(String, &[u8])> {
    let len_bytes: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let body = bytes.get(4..4 + len)?;
    let text = std::str::from_utf8(body).ok()?.to_string();
    Some((text, &bytes[4 + len..]))
}

/// What one identity did to one piece of content. Absence means default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub vote: VoteDirection,
    pub bookmarked: bool,
    /// ms since epoch of the last local change.
    pub last_local_update: u64,
}

impl InteractionRecord {
    pub fn is_default(&self) -> bool {
        self.vote == VoteDirection::None && !self.bookmarked
    }
}

/// Denormalized copy of bookmarked content, enough to render a bookmark
/// list without fetching. Not refreshed afterwards; content is immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkSnapshot {
    pub content_id: ContentId,
    pub content: String,
    pub author: String,
    pub timestamp: String,
    pub saved_at: u64,
}
