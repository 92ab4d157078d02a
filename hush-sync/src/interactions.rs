//! Interaction state store.
//!
//! Remembers what each identity last did to each piece of content. Reads
//! are always scoped by an identity; records of other identities stay on
//! the device but are inert until that identity is active again. With a
//! [`LocalStore`] attached every mutation is written through; a failed
//! device write is logged and the in-memory state stays authoritative.

use std::collections::HashMap;
use std::sync::Arc;

use hush_core::{
    unix_millis, BookmarkSnapshot, ContentId, Identity, InteractionKey, InteractionRecord,
    VoteDirection,
};

use crate::store::{LocalStore, StoreError};

#[derive(Default)]
pub struct InteractionStore {
    records: HashMap<InteractionKey, InteractionRecord>,
    bookmarks: HashMap<InteractionKey, BookmarkSnapshot>,
    active: Identity,
    /// Bumped per identity by `forget_identity`.
    forgotten: HashMap<Identity, u64>,
    persistence: Option<Arc<LocalStore>>,
}

impl InteractionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load everything the device remembers, then write through to it.
    pub fn with_persistence(store: Arc<LocalStore>) -> Result<Self, StoreError> {
        let records: HashMap<_, _> = store.load_records()?.into_iter().collect();
        let bookmarks: HashMap<_, _> = store.load_bookmarks()?.into_iter().collect();
        log::info!(
            "Restored {} interaction records and {} bookmarks",
            records.len(),
            bookmarks.len()
        );
        Ok(Self {
            records,
            bookmarks,
            active: Identity::anonymous(),
            forgotten: HashMap::new(),
            persistence: Some(store),
        })
    }

    pub fn active_identity(&self) -> &Identity {
        &self.active
    }

    /// Change whose records the `current_*` reads see. Nothing is deleted.
    pub fn set_active_identity(&mut self, identity: Identity) {
        if self.active != identity {
            log::debug!("Active identity {} -> {identity}", self.active);
            self.active = identity;
        }
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn record(&self, content_id: &ContentId, identity: &Identity) -> Option<InteractionRecord> {
        self.records.get(&key(content_id, identity)).copied()
    }

    pub fn get_vote(&self, content_id: &ContentId, identity: &Identity) -> VoteDirection {
        self.record(content_id, identity)
            .map(|r| r.vote)
            .unwrap_or_default()
    }

    pub fn get_bookmark(&self, content_id: &ContentId, identity: &Identity) -> bool {
        self.record(content_id, identity)
            .map(|r| r.bookmarked)
            .unwrap_or(false)
    }

    pub fn current_vote(&self, content_id: &ContentId) -> VoteDirection {
        self.get_vote(content_id, &self.active)
    }

    pub fn is_bookmarked(&self, content_id: &ContentId) -> bool {
        self.get_bookmark(content_id, &self.active)
    }

    /// Saved bookmarks of `identity`, oldest save first.
    pub fn bookmarks(&self, identity: &Identity) -> Vec<BookmarkSnapshot> {
        let mut list: Vec<BookmarkSnapshot> = self
            .bookmarks
            .iter()
            .filter(|(k, _)| &k.identity == identity)
            .map(|(_, s)| s.clone())
            .collect();
        list.sort_by(|a, b| {
            a.saved_at
                .cmp(&b.saved_at)
                .then_with(|| a.content_id.cmp(&b.content_id))
        });
        list
    }

    // ─── Mutators ─────────────────────────────────────────────────────

    /// Remember the identity's latest vote. Count deltas are not computed here.
    pub fn set_vote(&mut self, content_id: &ContentId, identity: &Identity, vote: VoteDirection) {
        let key = key(content_id, identity);
        let mut record = self.records.get(&key).copied().unwrap_or_default();
        record.vote = vote;
        record.last_local_update = unix_millis();
        self.write_record(key, record);
    }

    /// Set or clear the bookmark flag. Setting it stores `snapshot` for the
    /// bookmark list; clearing it drops the stored snapshot.
    pub fn set_bookmark(
        &mut self,
        content_id: &ContentId,
        identity: &Identity,
        flag: bool,
        snapshot: Option<BookmarkSnapshot>,
    ) {
        let key = key(content_id, identity);
        let mut record = self.records.get(&key).copied().unwrap_or_default();
        record.bookmarked = flag;
        record.last_local_update = unix_millis();

        match (flag, snapshot) {
            (true, Some(snapshot)) => {
                self.persist(|s| s.put_bookmark(&key, &snapshot));
                self.bookmarks.insert(key.clone(), snapshot);
            }
            (true, None) => {}
            (false, _) => {
                if self.bookmarks.remove(&key).is_some() {
                    self.persist(|s| s.delete_bookmark(&key));
                }
            }
        }
        self.write_record(key, record);
    }

    /// Flip the bookmark of `snapshot.content_id`. Returns the new flag.
    pub fn toggle_bookmark(&mut self, identity: &Identity, snapshot: BookmarkSnapshot) -> bool {
        let content_id = snapshot.content_id.clone();
        let flag = !self.get_bookmark(&content_id, identity);
        self.set_bookmark(&content_id, identity, flag, flag.then_some(snapshot));
        flag
    }

    /// Put a record back exactly as it was (`None` = no record).
    pub(crate) fn restore(
        &mut self,
        content_id: &ContentId,
        identity: &Identity,
        previous: Option<InteractionRecord>,
    ) {
        let key = key(content_id, identity);
        match previous {
            Some(record) => self.write_record(key, record),
            None => {
                if self.records.remove(&key).is_some() {
                    self.persist(|s| s.delete_record(&key));
                }
            }
        }
    }

    /// Erase all records and bookmarks of `identity` (logout).
    pub fn forget_identity(&mut self, identity: &Identity) -> usize {
        let before = self.records.len() + self.bookmarks.len();
        self.records.retain(|k, _| &k.identity != identity);
        self.bookmarks.retain(|k, _| &k.identity != identity);
        let removed = before - self.records.len() - self.bookmarks.len();
        *self.forgotten.entry(identity.clone()).or_default() += 1;
        self.persist(|s| s.forget_identity(identity).map(|_| ()));
        log::info!("Forgot {removed} entries of {identity}");
        removed
    }

    /// Changes every time `identity` is forgotten. Work started before a
    /// change must not write that identity's records back.
    pub fn forget_generation(&self, identity: &Identity) -> u64 {
        self.forgotten.get(identity).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn write_record(&mut self, key: InteractionKey, record: InteractionRecord) {
        if record.is_default() {
            if self.records.remove(&key).is_some() {
                self.persist(|s| s.delete_record(&key));
            }
        } else {
            self.persist(|s| s.put_record(&key, &record));
            self.records.insert(key, record);
        }
    }

    fn persist(&self, op: impl FnOnce(&LocalStore) -> Result<(), StoreError>) {
        if let Some(store) = &self.persistence {
            if let Err(e) = op(store) {
                log::error!("Device store write failed: {e}");
            }
        }
    }
}

fn key(content_id: &ContentId, identity: &Identity) -> InteractionKey {
    InteractionKey::new(content_id.clone(), identity.clone())
}
