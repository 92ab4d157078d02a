//! Vote state machine.
//!
//! Per (content, identity) the local vote is one of three states. A user
//! action moves between them and yields the delta to apply to the visible
//! net score before the server has confirmed anything:
//!
//! ```text
//!              upvote (+1)              downvote (-2)
//!   NoVote ───────────────► Upvoted ──────────────────► Downvoted
//!     ▲  ◄───────────────     │    ◄──────────────────    │
//!     │   upvote again (-1)   │       upvote (+2)         │
//!     └───────────────────────┴───── downvote again (+1) ─┘
//! ```
//!
//! Every delta is `to.offset() - from.offset()`, so the running sum of
//! deltas always equals the offset of the final state.

use serde::{Deserialize, Serialize};

/// What the identity last chose for a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VoteDirection {
    #[default]
    None,
    Up,
    Down,
}

impl VoteDirection {
    /// Contribution of this state to the net score.
    pub fn offset(self) -> i64 {
        match self {
            VoteDirection::None => 0,
            VoteDirection::Up => 1,
            VoteDirection::Down => -1,
        }
    }

    /// Wire spelling used by the vote endpoint; `None` has no spelling.
    pub fn as_wire(self) -> Option<&'static str> {
        match self {
            VoteDirection::None => None,
            VoteDirection::Up => Some("upvote"),
            VoteDirection::Down => Some("downvote"),
        }
    }
}

/// A button press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteAction {
    Upvote,
    Downvote,
}

impl VoteAction {
    pub fn direction(self) -> VoteDirection {
        match self {
            VoteAction::Upvote => VoteDirection::Up,
            VoteAction::Downvote => VoteDirection::Down,
        }
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            VoteAction::Upvote => "upvote",
            VoteAction::Downvote => "downvote",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "upvote" => Some(VoteAction::Upvote),
            "downvote" => Some(VoteAction::Downvote),
            _ => None,
        }
    }
}

/// One edge of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteTransition {
    pub from: VoteDirection,
    pub action: VoteAction,
    pub to: VoteDirection,
    /// Change to the visible net score.
    pub delta: i64,
}

impl VoteTransition {
    /// Repeating the current direction toggles it off.
    pub fn compute(from: VoteDirection, action: VoteAction) -> Self {
        let requested = action.direction();
        let to = if from == requested {
            VoteDirection::None
        } else {
            requested
        };
        Self {
            from,
            action,
            to,
            delta: to.offset() - from.offset(),
        }
    }

    pub fn is_toggle_off(&self) -> bool {
        self.to == VoteDirection::None
    }
}
