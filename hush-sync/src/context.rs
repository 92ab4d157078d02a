//! Application-root sync context.
//!
//! Built once by the app and passed by reference to every view. Owns the
//! connection manager, the dispatcher (and its event log), the interaction
//! store and the vote coordinator. A single pump task drains the transport
//! so inbound frames are classified and dispatched strictly one at a time.

use std::sync::Arc;
use std::time::Duration;

use hush_core::{
    BookmarkSnapshot, ContentId, EventKind, EventPayload, Identity, LiveEvent, VoteAction,
    VoteDirection, DEFAULT_LOG_CAPACITY,
};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::dispatch::{Classified, DispatchStats, Dispatcher, Subscriber, SubscriptionId};
use crate::interactions::InteractionStore;
use crate::optimistic::{VoteCoordinator, VoteError, VoteOutcome, VoteWriter};
use crate::store::{LocalStore, StoreConfig, StoreError};
use crate::transport::{
    ConnectionManager, ConnectionState, TransportConfig, TransportError, TransportEvent,
};

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub transport: TransportConfig,
    /// Events retained for late subscribers
    pub log_capacity: usize,
    /// Optimistic writes not settled by then are rolled back
    pub write_timeout: Duration,
    /// Device persistence (None = memory only)
    pub storage: Option<StoreConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            write_timeout: Duration::from_secs(10),
            storage: None,
        }
    }
}

impl SyncConfig {
    pub fn for_testing(endpoint: impl Into<String>) -> Self {
        Self {
            transport: TransportConfig::for_testing(endpoint),
            log_capacity: DEFAULT_LOG_CAPACITY,
            write_timeout: Duration::from_secs(2),
            storage: None,
        }
    }
}

pub struct SyncContext {
    transport: Mutex<ConnectionManager>,
    dispatcher: Arc<Mutex<Dispatcher>>,
    interactions: Arc<RwLock<InteractionStore>>,
    votes: Arc<VoteCoordinator>,
    local: Option<Arc<LocalStore>>,
    state_rx: watch::Receiver<ConnectionState>,
    pump: Option<JoinHandle<()>>,
}

impl SyncContext {
    /// Build the context, restoring device state if storage is configured.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: SyncConfig, writer: Arc<dyn VoteWriter>) -> Result<Self, StoreError> {
        let local = match &config.storage {
            Some(store_config) => Some(Arc::new(LocalStore::open(store_config.clone())?)),
            None => None,
        };

        let mut dispatcher = Dispatcher::new(config.log_capacity);
        let interactions = match &local {
            Some(store) => {
                let events = store.load_event_log()?;
                log::info!("Restored {} recent events", events.len());
                dispatcher.restore_log(events);
                InteractionStore::with_persistence(store.clone())?
            }
            None => InteractionStore::new(),
        };
        let interactions = Arc::new(RwLock::new(interactions));
        let votes = Arc::new(VoteCoordinator::new(
            interactions.clone(),
            writer,
            config.write_timeout,
        ));

        let mut transport = ConnectionManager::new(config.transport);
        let state_rx = transport.subscribe_state();
        let dispatcher = Arc::new(Mutex::new(dispatcher));

        let pump = transport.take_event_rx().map(|rx| {
            tokio::spawn(run_pump(
                rx,
                dispatcher.clone(),
                votes.clone(),
                local.clone(),
            ))
        });

        Ok(Self {
            transport: Mutex::new(transport),
            dispatcher,
            interactions,
            votes,
            local,
            state_rx,
            pump,
        })
    }

    // ─── Connection ───────────────────────────────────────────────────

    /// Activate `identity` and open its push channel.
    pub async fn start(&self, identity: Identity) {
        self.interactions
            .write()
            .await
            .set_active_identity(identity.clone());
        self.transport.lock().await.connect(identity).await;
    }

    /// Wallet connected or switched: rescope reads, move to the new channel.
    pub async fn switch_identity(&self, identity: Identity) {
        self.interactions
            .write()
            .await
            .set_active_identity(identity.clone());
        self.transport.lock().await.switch_identity(identity).await;
    }

    /// Erase the active identity's device data and continue as anonymous.
    pub async fn logout(&self) {
        {
            let mut store = self.interactions.write().await;
            let current = store.active_identity().clone();
            if !current.is_anonymous() {
                store.forget_identity(&current);
            }
        }
        self.switch_identity(Identity::anonymous()).await;
    }

    /// Close the connection; no reconnection until `start` is called again.
    pub async fn shutdown(&self) {
        self.transport.lock().await.disconnect().await;
        if let Some(store) = &self.local {
            if let Err(e) = store.flush() {
                log::error!("Device store flush failed: {e}");
            }
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Send a raw JSON frame to the push endpoint.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.transport.lock().await.send(text).await
    }

    // ─── Events ───────────────────────────────────────────────────────

    /// Register a view. An empty `kinds` slice subscribes to every kind.
    pub async fn subscribe(
        &self,
        kinds: &[EventKind],
        subscriber: Box<dyn Subscriber>,
    ) -> SubscriptionId {
        self.dispatcher.lock().await.subscribe(kinds, subscriber)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.lock().await.unsubscribe(id)
    }

    /// Generic notifications channel (every event, crisis advisories included).
    pub async fn notifications(&self) -> broadcast::Receiver<LiveEvent> {
        self.dispatcher.lock().await.notifications()
    }

    /// Recent events, oldest first.
    pub async fn recent_events(&self) -> Vec<LiveEvent> {
        self.dispatcher.lock().await.snapshot()
    }

    pub async fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.lock().await.stats()
    }

    /// Empty the event log ("clear all" in the notification panel).
    pub async fn clear_updates(&self) {
        self.dispatcher.lock().await.clear_log();
        if let Some(store) = &self.local {
            if let Err(e) = store.save_event_log(&[]) {
                log::error!("Failed to persist cleared event log: {e}");
            }
        }
    }

    // ─── Interactions ─────────────────────────────────────────────────

    /// Vote as the active identity.
    pub async fn vote(
        &self,
        content_id: &ContentId,
        action: VoteAction,
    ) -> Result<VoteOutcome, VoteError> {
        let identity = self.active_identity().await;
        self.votes.apply_vote(content_id, &identity, action).await
    }

    pub async fn current_vote(&self, content_id: &ContentId) -> VoteDirection {
        self.interactions.read().await.current_vote(content_id)
    }

    pub async fn vote_count(&self, content_id: &ContentId) -> i64 {
        self.votes.count(content_id).await
    }

    pub async fn seed_count(&self, content_id: &ContentId, count: i64) {
        self.votes.seed_count(content_id, count).await
    }

    /// The view showing `content_id` went away.
    pub async fn release_count(&self, content_id: &ContentId) -> bool {
        self.votes.release(content_id).await
    }

    pub async fn is_pending(&self, content_id: &ContentId) -> bool {
        self.votes.is_pending(content_id).await
    }

    /// Flip the active identity's bookmark. Returns the new flag.
    pub async fn toggle_bookmark(&self, snapshot: BookmarkSnapshot) -> bool {
        let mut store = self.interactions.write().await;
        let identity = store.active_identity().clone();
        store.toggle_bookmark(&identity, snapshot)
    }

    pub async fn is_bookmarked(&self, content_id: &ContentId) -> bool {
        self.interactions.read().await.is_bookmarked(content_id)
    }

    pub async fn bookmarks(&self) -> Vec<BookmarkSnapshot> {
        let store = self.interactions.read().await;
        store.bookmarks(store.active_identity())
    }

    pub async fn active_identity(&self) -> Identity {
        self.interactions.read().await.active_identity().clone()
    }

    pub fn votes(&self) -> &Arc<VoteCoordinator> {
        &self.votes
    }

    pub fn interactions(&self) -> &Arc<RwLock<InteractionStore>> {
        &self.interactions
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Drain the transport, one message at a time.
async fn run_pump(
    mut rx: mpsc::Receiver<TransportEvent>,
    dispatcher: Arc<Mutex<Dispatcher>>,
    votes: Arc<VoteCoordinator>,
    local: Option<Arc<LocalStore>>,
) {
    while let Some(event) = rx.recv().await {
        let mut dispatcher = dispatcher.lock().await;
        match event {
            TransportEvent::StateChanged(state) => dispatcher.on_state(state),
            TransportEvent::Message(text) => {
                let Classified::Event(event) = dispatcher.classify(&text) else {
                    continue;
                };
                // Views render the server aggregate when they see the event.
                if let EventPayload::VoteChanged(update) = &event.payload {
                    votes.reconcile(update).await;
                }
                dispatcher.dispatch(event);
                if let Some(store) = &local {
                    if let Err(e) = store.save_event_log(&dispatcher.snapshot()) {
                        log::error!("Failed to persist event log: {e}");
                    }
                }
            }
        }
    }
    log::debug!("Transport event stream ended");
}
