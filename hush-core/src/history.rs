//! Bounded, FIFO-evicting event log.
//!
//! Keeps the most recent `capacity` events in insertion order so that a
//! panel opened late can replay what it missed. Entries are de-duplicated
//! only by their own [`EventId`]; two events about the same content are
//! both retained.

use std::collections::{HashSet, VecDeque};

use crate::event::{EventId, LiveEvent};

/// Number of events retained when no capacity is configured.
pub const DEFAULT_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<LiveEvent>,
    ids: HashSet<EventId>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl EventLog {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Append at the tail, evicting from the head past capacity.
    ///
    /// Returns `false` (and changes nothing) when an event with the same id
    /// is still retained.
    pub fn append(&mut self, event: LiveEvent) -> bool {
        if self.ids.contains(&event.id) {
            return false;
        }
        self.ids.insert(event.id.clone());
        self.entries.push_back(event);
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.ids.remove(&evicted.id);
            }
        }
        true
    }

    /// Retained events, oldest first.
    pub fn snapshot(&self) -> Vec<LiveEvent> {
        self.entries.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LiveEvent> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&LiveEvent> {
        self.entries.back()
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.ids.clear();
    }

    /// Replace the contents with a previously saved snapshot.
    ///
    /// The usual append rules apply, so an oversized or duplicated snapshot
    /// is trimmed to what a live log would have retained.
    pub fn restore(&mut self, events: Vec<LiveEvent>) {
        self.clear();
        for event in events {
            self.append(event);
        }
    }
}
