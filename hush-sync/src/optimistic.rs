//! Optimistic vote coordinator.
//!
//! A vote is applied locally first (interaction record and visible count),
//! then written to the external collaborator. If the write fails or times
//! out, both are put back exactly as they were.
//!
//! ```text
//! apply_vote(c, id, action)             spawned; outlives the caller
//!   ├─ lock (c, id)                      serializes same-key votes
//!   ├─ id still active?  no ──► Discarded
//!   ├─ prev = record(c, id)
//!   ├─ t = transition(prev.vote, action)
//!   ├─ set_vote(c, id, t.to); count[c] += t.delta
//!   ├─ writer.write_vote(c, t.to, id)   bounded by write_timeout
//!   └─ on failure: restore(prev); count[c] -= t.delta
//!                  (unless a server aggregate landed meanwhile,
//!                   or id was forgotten meanwhile)
//! ```
//!
//! Server `vote_update` frames carrying tallies overwrite the visible count
//! but never touch anyone's own vote record; votes are anonymous upstream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hush_core::{
    ContentId, Identity, InteractionKey, Notification, VoteAction, VoteDirection, VoteTransition,
    VoteUpdate,
};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::interactions::InteractionStore;

/// Failure reported by the write collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("vote rejected: {reason}")]
    Rejected { reason: String },
    #[error("network error: {0}")]
    Network(String),
}

/// The external content-CRUD service, as far as votes are concerned.
///
/// `direction` is the identity's new state; `VoteDirection::None` retracts.
#[async_trait]
pub trait VoteWriter: Send + Sync {
    async fn write_vote(
        &self,
        content_id: &ContentId,
        direction: VoteDirection,
        identity: &Identity,
    ) -> Result<(), WriteError>;
}

/// A vote that was rolled back. Always recoverable; the user may retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoteError {
    #[error("vote on {content_id} was not saved: {source}")]
    Write {
        content_id: ContentId,
        #[source]
        source: WriteError,
    },
    #[error("vote on {content_id} timed out after {after:?}")]
    Timeout { content_id: ContentId, after: Duration },
    /// The background vote task panicked or the runtime shut down.
    #[error("vote on {content_id} was interrupted")]
    Interrupted { content_id: ContentId },
}

impl VoteError {
    pub fn content_id(&self) -> &ContentId {
        match self {
            VoteError::Write { content_id, .. }
            | VoteError::Timeout { content_id, .. }
            | VoteError::Interrupted { content_id } => content_id,
        }
    }

    /// User-facing, retryable notice.
    pub fn notification(&self) -> Notification {
        let body = match self {
            VoteError::Write {
                source: WriteError::Rejected { reason },
                ..
            } => format!("Your vote was not saved ({reason}). Please try again."),
            VoteError::Write { .. } => {
                "Your vote was not saved. Check your connection and try again.".to_string()
            }
            VoteError::Timeout { .. } => {
                "Saving your vote took too long. Please try again.".to_string()
            }
            VoteError::Interrupted { .. } => {
                "Your vote could not be completed. Please try again.".to_string()
            }
        };
        Notification {
            title: "Vote Failed".to_string(),
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Written successfully; `count` is the visible count afterwards.
    Applied {
        transition: VoteTransition,
        count: i64,
    },
    /// The identity was no longer active by the time the vote ran.
    Discarded { identity: Identity, active: Identity },
}

#[derive(Debug, Default)]
struct CountEntry {
    value: i64,
    pending: u32,
    /// Bumped whenever a server aggregate overwrites `value`.
    epoch: u64,
}

/// State shared with the spawned vote tasks.
struct Inner {
    store: Arc<RwLock<InteractionStore>>,
    counts: Mutex<HashMap<ContentId, CountEntry>>,
    key_locks: Mutex<HashMap<InteractionKey, Arc<Mutex<()>>>>,
    writer: Arc<dyn VoteWriter>,
    write_timeout: Duration,
}

pub struct VoteCoordinator {
    inner: Arc<Inner>,
}

impl VoteCoordinator {
    pub fn new(
        store: Arc<RwLock<InteractionStore>>,
        writer: Arc<dyn VoteWriter>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                counts: Mutex::new(HashMap::new()),
                key_locks: Mutex::new(HashMap::new()),
                writer,
                write_timeout,
            }),
        }
    }

    /// Apply a vote optimistically and await the write.
    ///
    /// A second vote on the same (content, identity) waits for the first to
    /// settle. Votes on different content run concurrently. The vote runs on
    /// its own task: dropping the returned future does not cancel the write,
    /// and its success or rollback still lands.
    pub async fn apply_vote(
        &self,
        content_id: &ContentId,
        identity: &Identity,
        action: VoteAction,
    ) -> Result<VoteOutcome, VoteError> {
        let inner = self.inner.clone();
        let (content, who) = (content_id.clone(), identity.clone());
        let task = tokio::spawn(async move { inner.apply_vote(&content, &who, action).await });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Vote task on {content_id} failed: {e}");
                Err(VoteError::Interrupted {
                    content_id: content_id.clone(),
                })
            }
        }
    }

    /// Adopt the server aggregate from a `vote_update`, if it carries one
    /// and a view is tracking that content. Returns the new visible count.
    pub async fn reconcile(&self, update: &VoteUpdate) -> Option<i64> {
        let aggregate = update.aggregate()?;
        let mut counts = self.inner.counts.lock().await;
        let Some(entry) = counts.get_mut(&update.confession_id) else {
            log::trace!("No visible count for {}; aggregate ignored", update.confession_id);
            return None;
        };
        if entry.pending > 0 {
            log::debug!(
                "Server aggregate {aggregate} overrides pending local vote on {}",
                update.confession_id
            );
        }
        entry.value = aggregate;
        entry.epoch += 1;
        Some(aggregate)
    }

    /// Install the count a view loaded with the content.
    pub async fn seed_count(&self, content_id: &ContentId, count: i64) {
        let mut counts = self.inner.counts.lock().await;
        counts.entry(content_id.clone()).or_default().value = count;
    }

    /// Stop tracking a count no view shows any more. Pending counts are kept.
    pub async fn release(&self, content_id: &ContentId) -> bool {
        let mut counts = self.inner.counts.lock().await;
        match counts.get(content_id) {
            Some(entry) if entry.pending == 0 => counts.remove(content_id).is_some(),
            _ => false,
        }
    }

    /// Visible count; zero for content never seen.
    pub async fn count(&self, content_id: &ContentId) -> i64 {
        self.inner
            .counts
            .lock()
            .await
            .get(content_id)
            .map_or(0, |e| e.value)
    }

    pub async fn is_pending(&self, content_id: &ContentId) -> bool {
        self.inner
            .counts
            .lock()
            .await
            .get(content_id)
            .is_some_and(|e| e.pending > 0)
    }

    /// Number of tracked counts.
    pub async fn tracked(&self) -> usize {
        self.inner.counts.lock().await.len()
    }

    pub fn store(&self) -> &Arc<RwLock<InteractionStore>> {
        &self.inner.store
    }
}

impl Inner {
    async fn apply_vote(
        &self,
        content_id: &ContentId,
        identity: &Identity,
        action: VoteAction,
    ) -> Result<VoteOutcome, VoteError> {
        let key = InteractionKey::new(content_id.clone(), identity.clone());
        let lock = {
            let mut locks = self.key_locks.lock().await;
            locks.entry(key.clone()).or_default().clone()
        };

        let result = {
            let _guard = lock.lock().await;
            self.apply_locked(content_id, identity, action).await
        };

        let mut locks = self.key_locks.lock().await;
        // Map entry plus ours: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&key);
        }
        result
    }

    async fn apply_locked(
        &self,
        content_id: &ContentId,
        identity: &Identity,
        action: VoteAction,
    ) -> Result<VoteOutcome, VoteError> {
        let (transition, previous, generation) = {
            let mut store = self.store.write().await;
            if store.active_identity() != identity {
                log::debug!(
                    "Discarding vote on {content_id} by {identity}; active is {}",
                    store.active_identity()
                );
                return Ok(VoteOutcome::Discarded {
                    identity: identity.clone(),
                    active: store.active_identity().clone(),
                });
            }
            let previous = store.record(content_id, identity);
            let from = previous.map(|r| r.vote).unwrap_or_default();
            let transition = VoteTransition::compute(from, action);
            store.set_vote(content_id, identity, transition.to);
            (transition, previous, store.forget_generation(identity))
        };

        let epoch = {
            let mut counts = self.counts.lock().await;
            let entry = counts.entry(content_id.clone()).or_default();
            entry.value = entry.value.saturating_add(transition.delta);
            entry.pending += 1;
            entry.epoch
        };

        let outcome = tokio::time::timeout(
            self.write_timeout,
            self.writer.write_vote(content_id, transition.to, identity),
        )
        .await;

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(source)) => Some(VoteError::Write {
                content_id: content_id.clone(),
                source,
            }),
            Err(_) => Some(VoteError::Timeout {
                content_id: content_id.clone(),
                after: self.write_timeout,
            }),
        };

        let count = {
            let mut counts = self.counts.lock().await;
            let entry = counts.entry(content_id.clone()).or_default();
            entry.pending = entry.pending.saturating_sub(1);
            if error.is_some() && entry.epoch == epoch {
                entry.value = entry.value.saturating_sub(transition.delta);
            }
            entry.value
        };

        match error {
            None => Ok(VoteOutcome::Applied { transition, count }),
            Some(err) => {
                let mut store = self.store.write().await;
                if store.forget_generation(identity) == generation {
                    store.restore(content_id, identity, previous);
                } else {
                    log::debug!("{identity} was forgotten mid-flight; not restoring {content_id}");
                }
                log::warn!("Rolled back {:?} on {content_id}: {err}", transition.action);
                Err(err)
            }
        }
    }
}
