//! End-to-end tests: a real relay on a free port, a real `SyncContext`.

use std::sync::Arc;

use async_trait::async_trait;
use hush_core::{
    wire, ConfessionPayload, ContentId, CrisisResources, EventKind, EventPayload, Identity,
    LiveEvent, VoteAction, VoteDirection, VoteUpdate,
};
use hush_sync::{
    ConnectionState, PushRelay, RelayConfig, RelayHandle, StoreConfig, Subscriber, SyncConfig,
    SyncContext, VoteOutcome, VoteWriter, WriteError,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on a free port, return its handle and ws endpoint.
async fn start_test_relay() -> (RelayHandle, String) {
    let port = free_port().await;
    let relay = PushRelay::new(RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
    });
    let handle = relay.handle();
    tokio::spawn(async move {
        relay.run().await.unwrap();
    });
    // Give the relay time to bind
    sleep(Duration::from_millis(50)).await;
    (handle, format!("ws://127.0.0.1:{port}"))
}

struct AcceptAll;

#[async_trait]
impl VoteWriter for AcceptAll {
    async fn write_vote(
        &self,
        _content_id: &ContentId,
        _direction: VoteDirection,
        _identity: &Identity,
    ) -> Result<(), WriteError> {
        Ok(())
    }
}

/// Forwards everything it sees to a channel.
struct Probe {
    events: mpsc::UnboundedSender<LiveEvent>,
    states: mpsc::UnboundedSender<ConnectionState>,
}

impl Subscriber for Probe {
    fn on_event(&mut self, event: &LiveEvent) {
        let _ = self.events.send(event.clone());
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        let _ = self.states.send(state);
    }
}

async fn probe(
    ctx: &SyncContext,
    kinds: &[EventKind],
) -> (
    mpsc::UnboundedReceiver<LiveEvent>,
    mpsc::UnboundedReceiver<ConnectionState>,
) {
    let (events, events_rx) = mpsc::unbounded_channel();
    let (states, states_rx) = mpsc::unbounded_channel();
    ctx.subscribe(kinds, Box::new(Probe { events, states })).await;
    (events_rx, states_rx)
}

/// Wait until the relay holds exactly `n` connections for `identity`.
async fn wait_for_connections(relay: &RelayHandle, identity: &Identity, n: usize) {
    timeout(Duration::from_secs(3), async {
        while relay.connected(identity).await != n {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{identity} never reached {n} connections"));
}

async fn wait_connected(ctx: &SyncContext) {
    let mut state = ctx.watch_connection();
    timeout(
        Duration::from_secs(3),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .expect("client never connected")
    .unwrap();
}

fn confession(author: &str) -> EventPayload {
    EventPayload::ContentCreated(ConfessionPayload {
        id: "c-1".into(),
        tx_id: "tx-1".into(),
        content: "I talk to my plants".into(),
        author: author.into(),
        timestamp: "2026-04-01T09:00:00".into(),
        upvotes: 0,
        mood: Some("calm".into()),
        tags: vec!["home".into()],
        verified: true,
        gateway_url: None,
    })
}

#[tokio::test]
async fn test_subscriber_receives_broadcast() {
    let (relay, endpoint) = start_test_relay().await;
    let ctx = SyncContext::new(SyncConfig::for_testing(&endpoint), Arc::new(AcceptAll)).unwrap();
    let (mut events, _states) = probe(&ctx, &[EventKind::ContentCreated]).await;

    let alice = Identity::new("0xalice");
    ctx.start(alice.clone()).await;
    wait_for_connections(&relay, &alice, 1).await;

    relay.broadcast(&confession("fern")).await.unwrap();
    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.notification().body, "fern shared a new confession");

    let recent = ctx.recent_events().await;
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, event.id);
    assert_eq!(ctx.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_crisis_without_subscribers_still_logged() {
    let (relay, endpoint) = start_test_relay().await;
    let ctx = SyncContext::new(SyncConfig::for_testing(&endpoint), Arc::new(AcceptAll)).unwrap();
    let mut notifications = ctx.notifications().await;

    let me = Identity::new("0xsad");
    ctx.start(me.clone()).await;
    wait_for_connections(&relay, &me, 1).await;

    let delivered = relay
        .send_to(&me, &EventPayload::CrisisAdvisory(CrisisResources::default()))
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let event = timeout(Duration::from_secs(2), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind(), EventKind::CrisisAdvisory);

    let recent = ctx.recent_events().await;
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].kind(), EventKind::CrisisAdvisory);
}

#[tokio::test]
async fn test_reconnects_exactly_once_after_close() {
    let (relay, endpoint) = start_test_relay().await;
    let ctx = SyncContext::new(SyncConfig::for_testing(&endpoint), Arc::new(AcceptAll)).unwrap();
    let (_events, mut states) = probe(&ctx, &[]).await;

    let me = Identity::new("0xme");
    ctx.start(me.clone()).await;
    wait_for_connections(&relay, &me, 1).await;

    // Drain the initial Connecting, Connected.
    let mut initial = Vec::new();
    while initial.last() != Some(&ConnectionState::Connected) {
        initial.push(
            timeout(Duration::from_secs(2), states.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }

    relay.disconnect_all();

    let mut after = Vec::new();
    while after.last() != Some(&ConnectionState::Connected) {
        after.push(
            timeout(Duration::from_secs(2), states.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }
    assert_eq!(
        after,
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected
        ]
    );

    wait_for_connections(&relay, &me, 1).await;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(relay.connected(&me).await, 1);
}

#[tokio::test]
async fn test_identity_switch_moves_channel() {
    let (relay, endpoint) = start_test_relay().await;
    let ctx = SyncContext::new(SyncConfig::for_testing(&endpoint), Arc::new(AcceptAll)).unwrap();
    let (mut events, _states) = probe(&ctx, &[]).await;

    let alice = Identity::new("0xalice");
    let bob = Identity::new("0xbob");
    ctx.start(alice.clone()).await;
    wait_for_connections(&relay, &alice, 1).await;

    ctx.switch_identity(bob.clone()).await;
    wait_for_connections(&relay, &bob, 1).await;
    wait_for_connections(&relay, &alice, 0).await;

    // Several retry intervals later, nothing reconnected as alice.
    sleep(Duration::from_millis(400)).await;
    assert_eq!(relay.connected(&alice).await, 0);
    assert_eq!(relay.connected(&bob).await, 1);

    relay
        .send_to(&alice, &EventPayload::CrisisAdvisory(CrisisResources::default()))
        .await
        .unwrap();
    relay.send_to(&bob, &confession("bob")).await.unwrap();
    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind(), EventKind::ContentCreated);
    assert_eq!(ctx.active_identity().await, bob);
}

#[tokio::test]
async fn test_duplicate_frames_dispatched_once() {
    let (relay, endpoint) = start_test_relay().await;
    let ctx = SyncContext::new(SyncConfig::for_testing(&endpoint), Arc::new(AcceptAll)).unwrap();
    let (mut events, _states) = probe(&ctx, &[]).await;

    let me = Identity::anonymous();
    ctx.start(me.clone()).await;
    wait_for_connections(&relay, &me, 1).await;

    let frame = r#"{"type":"vote_update","id":"evt-9","confession_id":"tx-1","vote_type":"upvote"}"#;
    relay.broadcast_raw(frame).await;
    relay.broadcast_raw(frame).await;
    relay.broadcast_raw(wire::encode(&confession("x"), None).unwrap()).await;

    let first = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    assert_eq!(first.kind(), EventKind::VoteChanged);
    assert_eq!(second.kind(), EventKind::ContentCreated);
    assert_eq!(ctx.recent_events().await.len(), 2);
    assert_eq!(ctx.dispatch_stats().await.duplicates, 1);
}

#[tokio::test]
async fn test_ping_gets_pong_control_frame() {
    let (relay, endpoint) = start_test_relay().await;
    let ctx = SyncContext::new(SyncConfig::for_testing(&endpoint), Arc::new(AcceptAll)).unwrap();

    let me = Identity::new("0xping");
    ctx.start(me.clone()).await;
    wait_for_connections(&relay, &me, 1).await;
    wait_connected(&ctx).await;

    ctx.send(wire::ping_frame()).await.unwrap();
    timeout(Duration::from_secs(2), async {
        // Greeting plus pong.
        while ctx.dispatch_stats().await.control_frames < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(ctx.recent_events().await.is_empty());
}

#[tokio::test]
async fn test_server_vote_aggregate_overrides_local_count() {
    let (relay, endpoint) = start_test_relay().await;
    let ctx = SyncContext::new(SyncConfig::for_testing(&endpoint), Arc::new(AcceptAll)).unwrap();
    let me = Identity::new("0xvoter");
    ctx.start(me.clone()).await;
    wait_for_connections(&relay, &me, 1).await;

    let content = ContentId::new("tx-1");
    ctx.seed_count(&content, 4).await;
    match ctx.vote(&content, VoteAction::Upvote).await.unwrap() {
        VoteOutcome::Applied { count, .. } => assert_eq!(count, 5),
        other => panic!("unexpected {other:?}"),
    }

    relay
        .broadcast(&EventPayload::VoteChanged(VoteUpdate {
            confession_id: content.clone(),
            vote_type: VoteAction::Downvote,
            upvotes: Some(9),
            downvotes: Some(6),
        }))
        .await
        .unwrap();

    timeout(Duration::from_secs(2), async {
        while ctx.vote_count(&content).await != 3 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(ctx.current_vote(&content).await, VoteDirection::Up);
}

#[tokio::test]
async fn test_logout_forgets_and_goes_anonymous() {
    let (relay, endpoint) = start_test_relay().await;
    let ctx = SyncContext::new(SyncConfig::for_testing(&endpoint), Arc::new(AcceptAll)).unwrap();
    let me = Identity::new("0xleaving");
    ctx.start(me.clone()).await;
    wait_for_connections(&relay, &me, 1).await;

    let content = ContentId::new("tx-3");
    ctx.vote(&content, VoteAction::Downvote).await.unwrap();
    assert_eq!(ctx.current_vote(&content).await, VoteDirection::Down);

    ctx.logout().await;
    assert!(ctx.active_identity().await.is_anonymous());
    assert_eq!(ctx.current_vote(&content).await, VoteDirection::None);
    wait_for_connections(&relay, &Identity::anonymous(), 1).await;

    // Logging back in finds nothing left behind.
    ctx.switch_identity(me.clone()).await;
    assert_eq!(ctx.current_vote(&content).await, VoteDirection::None);
}

#[tokio::test]
async fn test_event_log_survives_restart() {
    let (relay, endpoint) = start_test_relay().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = SyncConfig::for_testing(&endpoint);
    config.storage = Some(StoreConfig::for_testing(dir.path().join("db")));
    let me = Identity::new("0xpersist");

    {
        let ctx = SyncContext::new(config.clone(), Arc::new(AcceptAll)).unwrap();
        ctx.start(me.clone()).await;
        wait_for_connections(&relay, &me, 1).await;
        relay.broadcast(&confession("wren")).await.unwrap();
        timeout(Duration::from_secs(2), async {
            while ctx.recent_events().await.is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        ctx.vote(&ContentId::new("tx-1"), VoteAction::Upvote).await.unwrap();
        ctx.shutdown().await;
    }
    // Let the aborted pump task release the database.
    sleep(Duration::from_millis(100)).await;

    let ctx = SyncContext::new(config, Arc::new(AcceptAll)).unwrap();
    let recent = ctx.recent_events().await;
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].notification().body, "wren shared a new confession");

    ctx.switch_identity(me).await;
    assert_eq!(
        ctx.current_vote(&ContentId::new("tx-1")).await,
        VoteDirection::Up
    );
}

#[tokio::test]
async fn test_out_of_range_tallies_do_not_stop_dispatch() {
    let (relay, endpoint) = start_test_relay().await;
    let ctx = SyncContext::new(SyncConfig::for_testing(&endpoint), Arc::new(AcceptAll)).unwrap();
    let (mut events, _states) = probe(&ctx, &[]).await;
    let me = Identity::new("0xtally");
    ctx.start(me.clone()).await;
    wait_for_connections(&relay, &me, 1).await;

    let content = ContentId::new("tx-9");
    ctx.seed_count(&content, 12).await;
    relay
        .broadcast_raw(
            r#"{"type":"vote_update","confession_id":"tx-9","vote_type":"upvote","upvotes":-9223372036854775808,"downvotes":1}"#,
        )
        .await;
    relay.broadcast(&confession("after")).await.unwrap();

    let first = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    assert_eq!(first.kind(), EventKind::VoteChanged);
    assert_eq!(second.notification().body, "after shared a new confession");
    assert_eq!(ctx.vote_count(&content).await, 12);
}
