//! Event classification and fan-out.
//!
//! One inbound frame at a time: decode, assign an id, hand the event to every
//! subscriber registered for its kind (synchronously, in registration order),
//! publish it on the generic notifications channel, then append it to the
//! event log. Nothing here is ever fatal; bad frames are logged and dropped.

use std::collections::HashSet;

use hush_core::wire::{self, ControlFrame, Inbound};
use hush_core::{DecodeError, EventId, EventKind, EventLog, LiveEvent};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::transport::ConnectionState;

/// A view interested in live events.
///
/// Callbacks run on the dispatch task while the dispatcher is locked; keep
/// them short and do not call back into the dispatcher.
pub trait Subscriber: Send {
    fn on_event(&mut self, event: &LiveEvent);

    fn on_connection_state(&mut self, _state: ConnectionState) {}
}

impl<F> Subscriber for F
where
    F: FnMut(&LiveEvent) + Send,
{
    fn on_event(&mut self, event: &LiveEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    kinds: HashSet<EventKind>,
    subscriber: Box<dyn Subscriber>,
}

/// Result of classifying one raw frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Event(LiveEvent),
    /// Same id as an event still in the log.
    Duplicate(EventId),
    Control(ControlFrame),
    Dropped(DecodeError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub duplicates: u64,
    pub control_frames: u64,
    pub dropped: u64,
}

pub struct Dispatcher {
    registrations: Vec<Registration>,
    next_subscription: u64,
    log: EventLog,
    notifications: broadcast::Sender<LiveEvent>,
    session: Uuid,
    sequence: u64,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(log_capacity: usize) -> Self {
        let (notifications, _) = broadcast::channel(log_capacity.max(16));
        Self {
            registrations: Vec::new(),
            next_subscription: 0,
            log: EventLog::new(log_capacity),
            notifications,
            session: Uuid::new_v4(),
            sequence: 0,
            stats: DispatchStats::default(),
        }
    }

    /// Register for the given kinds. An empty slice means every kind.
    pub fn subscribe(
        &mut self,
        kinds: &[EventKind],
        subscriber: Box<dyn Subscriber>,
    ) -> SubscriptionId {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        let kinds = if kinds.is_empty() {
            EventKind::ALL.into_iter().collect()
        } else {
            kinds.iter().copied().collect()
        };
        self.registrations.push(Registration {
            id,
            kinds,
            subscriber,
        });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.id != id);
        self.registrations.len() != before
    }

    /// Generic channel that receives every dispatched event, crisis
    /// advisories included, whether or not any subscriber claimed it.
    pub fn notifications(&self) -> broadcast::Receiver<LiveEvent> {
        self.notifications.subscribe()
    }

    /// Decode one frame and give it an id. Does not dispatch.
    pub fn classify(&mut self, text: &str) -> Classified {
        match wire::decode(text) {
            Ok(Inbound::Event { id, payload }) => {
                let id = id.unwrap_or_else(|| {
                    self.sequence += 1;
                    EventId::generated(self.session, self.sequence)
                });
                if self.log.contains(&id) {
                    log::debug!("Duplicate event {id} ignored");
                    self.stats.duplicates += 1;
                    return Classified::Duplicate(id);
                }
                Classified::Event(LiveEvent::new(id, payload))
            }
            Ok(Inbound::Control(frame)) => {
                match &frame {
                    ControlFrame::Connected { user_id } => {
                        log::info!("Push endpoint greeted us as {user_id:?}")
                    }
                    ControlFrame::ServerError { message } => {
                        log::warn!("Push endpoint reported error: {message}")
                    }
                    ControlFrame::Pong | ControlFrame::Echo => log::trace!("{frame:?}"),
                }
                self.stats.control_frames += 1;
                Classified::Control(frame)
            }
            Err(e) => {
                match &e {
                    DecodeError::UnknownType(t) => log::debug!("Ignoring frame of type `{t}`"),
                    other => log::warn!("Dropping push frame: {other}"),
                }
                self.stats.dropped += 1;
                Classified::Dropped(e)
            }
        }
    }

    /// Fan out one event, then record it. Returns how many subscribers saw it.
    pub fn dispatch(&mut self, event: LiveEvent) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        for reg in self.registrations.iter_mut() {
            if reg.kinds.contains(&kind) {
                reg.subscriber.on_event(&event);
                delivered += 1;
            }
        }

        let listeners = self.notifications.send(event.clone()).unwrap_or(0);
        if kind == EventKind::CrisisAdvisory && delivered == 0 && listeners == 0 {
            log::warn!("Crisis advisory {} has no live listener; kept in log", event.id);
        }

        self.stats.dispatched += 1;
        self.log.append(event);
        delivered
    }

    /// Classify and, if it is a new event, dispatch it.
    pub fn on_raw_message(&mut self, text: &str) -> Option<LiveEvent> {
        match self.classify(text) {
            Classified::Event(event) => {
                self.dispatch(event.clone());
                Some(event)
            }
            _ => None,
        }
    }

    /// Forward a connection state change to subscribers.
    ///
    /// Each new connection starts a fresh id session.
    pub fn on_state(&mut self, state: ConnectionState) {
        if state == ConnectionState::Connected {
            self.session = Uuid::new_v4();
            self.sequence = 0;
        }
        for reg in self.registrations.iter_mut() {
            reg.subscriber.on_connection_state(state);
        }
    }

    pub fn snapshot(&self) -> Vec<LiveEvent> {
        self.log.snapshot()
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    pub fn restore_log(&mut self, events: Vec<LiveEvent>) {
        self.log.restore(events);
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn subscriber_count(&self) -> usize {
        self.registrations.len()
    }
}
