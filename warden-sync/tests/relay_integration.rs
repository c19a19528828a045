//! Integration tests for the WebSocket relay.
//!
//! These start a real relay and connect real clients, verifying fan-out,
//! roster propagation and end-to-end convergence between two processes'
//! worth of channels.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use warden_core::{
    BindingSet, Gesture, GovernedId, KeyBinding, Member, MemoryRegistry, QueuedNotifier,
    SettingScope, SubordinateDirectory, Targets, ValueRegistry,
};
use warden_sync::{
    AuthoritySession, ConnectionState, DomainHandles, Envelope, Frame, MemoryBackend, RelayClient,
    RelayServer, ServerConfig, SessionConfig, SubordinateSession, SyncChannel, SyncMessage,
};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on a free port, return it with its URL.
async fn start_relay() -> (Arc<RelayServer>, String) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers: 10,
        channel_capacity: 64,
        heartbeat_interval_secs: 30,
    };
    let server = Arc::new(RelayServer::new(config));
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give the relay time to bind
    sleep(Duration::from_millis(50)).await;
    (server, format!("ws://127.0.0.1:{port}"))
}

#[tokio::test]
async fn test_client_connects() {
    let (server, url) = start_relay().await;
    let local = Arc::new(SyncChannel::new(16));
    let client = RelayClient::connect(&url, Member::subordinate("alice"), local)
        .await
        .unwrap();

    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(server.stats().await.active_connections, 1);
    assert_eq!(server.channel().online_count(), 1);
}

#[tokio::test]
async fn test_envelopes_fan_out_without_echo() {
    let (server, url) = start_relay().await;
    let gm = Member::authority("gm");
    let player = Member::subordinate("player");

    let gm_local = Arc::new(SyncChannel::new(16));
    let player_local = Arc::new(SyncChannel::new(16));
    let _gm_client = RelayClient::connect(&url, gm.clone(), gm_local.clone()).await.unwrap();
    let _player_client = RelayClient::connect(&url, player.clone(), player_local.clone())
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let mut gm_observer = gm_local.subscribe(Uuid::new_v4());
    let mut player_inbox = player_local.subscribe(player.id);
    gm_local.publish(gm.id, SyncMessage::Refresh).unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(2), player_inbox.recv())
        .await
        .expect("relay should deliver the envelope")
        .unwrap();
    assert_eq!(envelope.sender, gm.id);
    assert_eq!(envelope.message, SyncMessage::Refresh);

    // The origin sees its own local publish once, never a relayed copy
    sleep(Duration::from_millis(100)).await;
    assert!(gm_observer.try_recv().is_some());
    assert!(gm_observer.try_recv().is_none());
    assert_eq!(server.stats().await.frames_relayed, 1);
}

#[tokio::test]
async fn test_roster_propagates_joins_and_leaves() {
    let (_server, url) = start_relay().await;
    let gm = Member::authority("gm");
    let player = Member::subordinate("player");

    let gm_local = Arc::new(SyncChannel::new(16));
    let player_local = Arc::new(SyncChannel::new(16));
    let _gm_client = RelayClient::connect(&url, gm.clone(), gm_local.clone()).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    let mut player_client = RelayClient::connect(&url, player.clone(), player_local.clone())
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    // The late joiner learns the roster; the earlier client hears the join
    assert!(player_local.member(&gm.id).is_some_and(|m| m.online));
    assert_eq!(gm_local.online_subordinate_ids(), Targets::from([player.id]));

    player_client.disconnect().await;
    sleep(Duration::from_millis(100)).await;
    assert!(gm_local.online_subordinate_ids().is_empty());
    // Offline subordinates stay addressable
    assert_eq!(gm_local.subordinate_ids(), Targets::from([player.id]));
}

#[tokio::test]
async fn test_spoofed_sender_is_rejected() {
    let (server, url) = start_relay().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let me = Member::subordinate("mallory");
    let hello = Frame::Hello { peer: me }.encode().unwrap();
    ws.send(Message::Binary(hello.into())).await.unwrap();

    let roster = ws.next().await.unwrap().unwrap();
    let frame = Frame::decode(&roster.into_data()).unwrap();
    assert!(matches!(frame, Frame::Roster { .. }));

    let spoofed = Frame::Message(Envelope::new(Uuid::new_v4(), SyncMessage::Refresh))
        .encode()
        .unwrap();
    ws.send(Message::Binary(spoofed.into())).await.unwrap();
    ws.send(Message::Binary(b"{not json".to_vec().into())).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let stats = server.stats().await;
    assert_eq!(stats.frames_relayed, 0);
    assert_eq!(stats.frames_rejected, 2);
}

fn volume() -> GovernedId {
    GovernedId::new("moduleA", "volume")
}

fn jump() -> GovernedId {
    GovernedId::new("core", "jump")
}

#[tokio::test]
async fn test_sessions_converge_over_relay() {
    let (_server, url) = start_relay().await;
    let gm = Member::authority("gm");
    let player = Member::subordinate("player");

    let gm_local = Arc::new(SyncChannel::new(64));
    let player_local = Arc::new(SyncChannel::new(64));

    let gm_settings = Arc::new(MemoryRegistry::<Value>::new());
    gm_settings.register(volume(), SettingScope::Client, json!(0.5), false);
    let gm_controls = Arc::new(MemoryRegistry::<BindingSet>::new());
    gm_controls.register(
        jump(),
        SettingScope::Client,
        BindingSet::new(vec![KeyBinding::new("Space")]),
        false,
    );
    let authority = Arc::new(
        AuthoritySession::open(
            gm.clone(),
            Arc::new(MemoryBackend::new()),
            gm_settings,
            gm_controls,
            gm_local.clone(),
            SessionConfig::for_testing(),
        )
        .unwrap(),
    );

    // The authority's store stands in for replicated world storage
    let player_settings = Arc::new(MemoryRegistry::<Value>::new());
    player_settings.register(volume(), SettingScope::Client, json!(0.2), false);
    let player_controls = Arc::new(MemoryRegistry::<BindingSet>::new());
    player_controls.register(
        jump(),
        SettingScope::Client,
        BindingSet::new(vec![KeyBinding::new("KeyJ")]),
        false,
    );
    let subordinate = Arc::new(
        SubordinateSession::open(
            player.clone(),
            Arc::new(MemoryBackend::new()),
            DomainHandles {
                records: authority.settings().store(),
                registry: player_settings.clone(),
            },
            DomainHandles {
                records: authority.controls().store(),
                registry: player_controls.clone(),
            },
            Arc::new(QueuedNotifier::new()),
            player_local.clone(),
        )
        .unwrap(),
    );

    let _gm_client = RelayClient::connect(&url, gm, gm_local.clone()).await.unwrap();
    let _player_client = RelayClient::connect(&url, player.clone(), player_local)
        .await
        .unwrap();
    let authority_tasks = authority.clone().start();
    let subordinate_task = subordinate.clone().start();
    sleep(Duration::from_millis(150)).await;
    assert_eq!(gm_local.subordinate_ids(), Targets::from([player.id]));

    authority.setting_gesture(&volume(), Gesture::Click, None).unwrap();
    authority.control_gesture(&jump(), Gesture::ShiftClick, None).unwrap();
    authority.flush().unwrap();
    sleep(Duration::from_millis(300)).await;

    assert_eq!(player_settings.get(&volume()), Some(json!(0.5)));
    assert_eq!(
        player_controls.get(&jump()),
        Some(BindingSet::new(vec![KeyBinding::new("Space")]))
    );

    // A local override of the soft binding reaches the authority as a clear
    player_controls
        .set(&jump(), BindingSet::new(vec![KeyBinding::new("KeyK")]))
        .unwrap();
    subordinate
        .controls()
        .on_local_write(&jump(), &BindingSet::new(vec![KeyBinding::new("KeyK")]))
        .unwrap();
    sleep(Duration::from_millis(300)).await;
    assert!(authority.controls().store().read().unwrap().is_empty());

    for task in authority_tasks {
        task.abort();
    }
    subordinate_task.abort();
}

/// Poll until the relay reports no active connections.
async fn wait_for_idle(server: &RelayServer) -> u64 {
    for _ in 0..40 {
        let active = server.stats().await.active_connections;
        if active == 0 {
            return 0;
        }
        sleep(Duration::from_millis(25)).await;
    }
    server.stats().await.active_connections
}

#[tokio::test]
async fn test_active_connections_released_on_every_exit() {
    let (server, url) = start_relay().await;

    // Leaves before identifying itself
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    drop(ws);

    // Identifies itself, then vanishes without reading the roster
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let hello = Frame::Hello {
        peer: Member::subordinate("flaky"),
    }
    .encode()
    .unwrap();
    ws.send(Message::Binary(hello.into())).await.unwrap();
    drop(ws);

    // A full session that closes cleanly
    let local = Arc::new(SyncChannel::new(16));
    let mut client = RelayClient::connect(&url, Member::subordinate("alice"), local)
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    client.disconnect().await;

    assert_eq!(wait_for_idle(&server).await, 0);
    assert_eq!(server.stats().await.total_connections, 3);
    assert_eq!(server.channel().online_count(), 0);
}
