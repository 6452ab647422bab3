//! Session peer behaviour, driven through scripted signaling and through
//! multi-peer scenarios over the in-process hub and loopback fabric.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use super::*;
use crate::clock::MonotonicClock;
use crate::connection::HeartbeatConfig;
use crate::protocol::PlayerState;
use crate::rtc::{LoopbackBackend, LoopbackNetwork};
use crate::signaling::{MemorySignaling, MessageHandler};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Signaling double: records what the peer sends and lets the test inject
/// inbound events.
#[derive(Default)]
struct ScriptedSignaling {
    handler: Mutex<Option<MessageHandler>>,
    sent: Mutex<Vec<Value>>,
}

impl ScriptedSignaling {
    fn inject(&self, event: SignalingEvent) {
        let handler = self.handler.lock().unwrap().clone();
        handler.expect("handler not set")(event);
    }

    fn sent_states(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|v| v["state"].as_str().map(str::to_string))
            .collect()
    }
}

impl Signaling for ScriptedSignaling {
    fn connect(&self) {}

    fn send(&self, message: Value) {
        self.sent.lock().unwrap().push(message);
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn disconnect(&self) {}

    fn is_connected(&self) -> bool {
        true
    }
}

struct Peer {
    handle: SessionHandle,
    events: UnboundedReceiver<SessionEvent>,
}

fn spawn_scripted(peer_id: &str) -> (Arc<ScriptedSignaling>, Peer) {
    let signaling = Arc::new(ScriptedSignaling::default());
    let network = LoopbackNetwork::new();
    let (handle, events) = SessionPeer::spawn(
        PeerSettings::new("s1".into(), peer_id.into()),
        signaling.clone(),
        Arc::new(network.backend(peer_id)),
        Arc::new(MonotonicClock::new()),
    );
    (signaling, Peer { handle, events })
}

fn spawn_peer(
    hub: &MemorySignaling,
    network: &LoopbackNetwork,
    peer_id: &str,
    configure: impl FnOnce(PeerSettings) -> PeerSettings,
) -> Peer {
    let settings = configure(PeerSettings::new("s1".into(), peer_id.into()));
    let (handle, events) = SessionPeer::spawn(
        settings,
        Arc::new(hub.endpoint("s1".into(), peer_id.into())),
        Arc::new(LoopbackBackend::new(network.clone(), peer_id.into())),
        Arc::new(MonotonicClock::new()),
    );
    Peer { handle, events }
}

fn ready(peer: &str, host: &str) -> SignalingEvent {
    SignalingEvent::Message(json!({
        "type": "Connection",
        "session_id": "s1",
        "peer_id": peer,
        "state": "SessionReady",
        "host_peer_id": host,
    }))
}

async fn next_event(events: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("session peer stopped")
}

async fn wait_for(
    events: &mut UnboundedReceiver<SessionEvent>,
    mut matches: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

fn is_lifecycle(event: &SessionEvent, remote: &str, state: Lifecycle) -> bool {
    matches!(
        event,
        SessionEvent::Lifecycle { remote: Some(r), state: s } if r == remote && *s == state
    )
}

async fn wait_connected(peer: &mut Peer, remote: &str) {
    wait_for(&mut peer.events, |e| {
        is_lifecycle(e, remote, Lifecycle::Connected)
    })
    .await;
}

fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn player(id: &str, x: f32) -> GameMessage {
    GameMessage::PlayerUpdate {
        player: PlayerState {
            id: id.into(),
            position: [x, 1.0, 5.0],
            rotation: [0.0, 0.0, 0.0],
            color: "#888888".into(),
            name: id.into(),
        },
    }
}

fn data_from(event: &SessionEvent, sender: &str) -> Option<GameMessage> {
    match event {
        SessionEvent::Message(msg) if msg.sender_id == sender => msg.game_message(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Scripted signaling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_connect_joins_and_reports_negotiating() {
    let (signaling, mut peer) = spawn_scripted("p1");
    signaling.inject(SignalingEvent::Connected);

    let event = next_event(&mut peer.events).await;
    assert_eq!(
        event,
        SessionEvent::Lifecycle {
            remote: None,
            state: Lifecycle::Negotiating
        }
    );
    assert_eq!(signaling.sent_states(), vec!["SessionJoin"]);

    // A reconnect does not repeat the setup.
    signaling.inject(SignalingEvent::Connected);
    peer.handle.snapshot().await.unwrap();
    assert_eq!(signaling.sent_states(), vec!["SessionJoin"]);
    assert!(drain(&mut peer.events).is_empty());
}

#[tokio::test]
async fn signaling_failure_surfaces_as_error() {
    let (signaling, mut peer) = spawn_scripted("p1");
    signaling.inject(SignalingEvent::Failed("unable to join session".into()));
    assert_eq!(
        next_event(&mut peer.events).await,
        SessionEvent::Lifecycle {
            remote: None,
            state: Lifecycle::Error
        }
    );
}

#[tokio::test]
async fn own_session_ready_makes_host() {
    let (signaling, mut peer) = spawn_scripted("p1");
    signaling.inject(ready("p1", "p1"));

    let snapshot = peer.handle.snapshot().await.unwrap();
    assert!(snapshot.is_host());
    assert_eq!(snapshot.host_peer_id, Some("p1".into()));
    assert_eq!(
        snapshot.connection_status.get("p1"),
        Some(&ConnectionState::Connected)
    );

    match next_event(&mut peer.events).await {
        SessionEvent::Message(msg) => {
            assert_eq!(msg.kind, MessageKind::ConnectionState);
            assert_eq!(msg.data, json!({"p1": "connected"}));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn host_is_not_replaced_by_a_later_announcement() {
    let (signaling, peer) = spawn_scripted("p1");
    signaling.inject(ready("p1", "p1"));
    signaling.inject(ready("p9", "p9"));

    let snapshot = peer.handle.snapshot().await.unwrap();
    assert!(snapshot.is_host());
    assert_eq!(snapshot.host_peer_id, Some("p1".into()));
    assert!(snapshot.connections.is_empty());
}

#[tokio::test]
async fn host_offers_to_announced_joiner() {
    let (signaling, peer) = spawn_scripted("p1");
    signaling.inject(ready("p1", "p1"));
    signaling.inject(ready("p2", "p1"));

    let snapshot = peer.handle.snapshot().await.unwrap();
    assert_eq!(
        snapshot.connection_state("p2"),
        Some(ConnectionState::Negotiating)
    );

    let sent = signaling.sent.lock().unwrap().clone();
    let offer = sent
        .iter()
        .find(|v| v["state"] == "SdpOffer")
        .expect("no offer sent");
    assert_eq!(offer["host_peer_id"], "p1");
    assert_eq!(offer["target_peer_id"], "p2");
    assert_eq!(offer["peer_id"], "p1");
}

#[tokio::test]
async fn client_ignores_offers_for_someone_else() {
    let (signaling, peer) = spawn_scripted("p3");
    signaling.inject(SignalingEvent::Message(json!({
        "type": "Connection",
        "session_id": "s1",
        "peer_id": "p1",
        "state": "SdpOffer",
        "host_peer_id": "p1",
        "SdpOffer": "{\"type\":\"offer\",\"sdp\":\"loopback 1\"}",
        "target_peer_id": "p2",
    })));

    let snapshot = peer.handle.snapshot().await.unwrap();
    assert!(snapshot.connections.is_empty());
    assert!(signaling.sent_states().is_empty());
}

#[tokio::test]
async fn client_answers_offer_from_host() {
    let (signaling, peer) = spawn_scripted("p2");
    signaling.inject(SignalingEvent::Message(json!({
        "type": "Connection",
        "session_id": "s1",
        "peer_id": "p1",
        "state": "SdpOffer",
        "host_peer_id": "p1",
        "SdpOffer": "{\"type\":\"offer\",\"sdp\":\"loopback 41\"}",
    })));

    let snapshot = peer.handle.snapshot().await.unwrap();
    assert_eq!(
        snapshot.connection_state("p1"),
        Some(ConnectionState::Negotiating)
    );
    let sent = signaling.sent.lock().unwrap().clone();
    let answer = sent
        .iter()
        .find(|v| v["state"] == "SdpAnswer")
        .expect("no answer sent");
    assert_eq!(answer["host_peer_id"], "p1");
    assert_eq!(answer["peer_id"], "p2");
}

#[tokio::test]
async fn messages_for_other_sessions_and_garbage_are_ignored() {
    let (signaling, peer) = spawn_scripted("p1");
    signaling.inject(SignalingEvent::Message(json!({"nonsense": true})));
    signaling.inject(SignalingEvent::Message(json!({
        "type": "Connection",
        "session_id": "other",
        "peer_id": "p1",
        "state": "SessionReady",
        "host_peer_id": "p1",
    })));

    let snapshot = peer.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.role, Role::Client);
    assert_eq!(snapshot.host_peer_id, None);
}

#[tokio::test]
async fn malformed_offer_reports_error_for_that_peer() {
    let (signaling, mut peer) = spawn_scripted("p2");
    signaling.inject(SignalingEvent::Message(json!({
        "type": "Connection",
        "session_id": "s1",
        "peer_id": "p1",
        "state": "SdpOffer",
        "host_peer_id": "p1",
        "SdpOffer": "not a description",
    })));

    let event = next_event(&mut peer.events).await;
    assert!(is_lifecycle(&event, "p1", Lifecycle::Error));
    assert!(peer.handle.is_running());
}

#[tokio::test]
async fn shutdown_stops_the_task() {
    let (_signaling, peer) = spawn_scripted("p1");
    peer.handle.shutdown().await;
    assert!(peer.handle.snapshot().await.is_none());
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_peers_connect_and_agree_on_status() {
    let hub = MemorySignaling::new();
    let network = LoopbackNetwork::new();
    let mut a = spawn_peer(&hub, &network, "p1", |s| s);
    let mut b = spawn_peer(&hub, &network, "p2", |s| s);

    wait_connected(&mut a, "p2").await;
    wait_connected(&mut b, "p1").await;

    let expected = json!({"p1": "connected", "p2": "connected"});
    let status_seen = |event: &SessionEvent| {
        matches!(event, SessionEvent::Message(msg)
            if msg.kind == MessageKind::ConnectionState && msg.data == expected)
    };
    wait_for(&mut b.events, status_seen).await;

    let host = a.handle.snapshot().await.unwrap();
    assert!(host.is_host());
    assert_eq!(host.connection_state("p2"), Some(ConnectionState::Connected));
    assert_eq!(
        serde_json::to_value(&host.connection_status).unwrap(),
        expected
    );

    let client = b.handle.snapshot().await.unwrap();
    assert_eq!(client.role, Role::Client);
    assert_eq!(client.host_peer_id, Some("p1".into()));
    assert_eq!(client.connection_state("p1"), Some(ConnectionState::Connected));
}

#[tokio::test]
async fn at_most_one_host() {
    let hub = MemorySignaling::new();
    let network = LoopbackNetwork::new();
    let mut peers: Vec<Peer> = ["p1", "p2", "p3"]
        .iter()
        .map(|id| spawn_peer(&hub, &network, id, |s| s))
        .collect();

    wait_connected(&mut peers[1], "p1").await;
    wait_connected(&mut peers[2], "p1").await;

    let mut hosts = 0;
    for peer in &peers {
        let snapshot = peer.handle.snapshot().await.unwrap();
        if snapshot.is_host() {
            hosts += 1;
        }
        assert_eq!(snapshot.host_peer_id, Some("p1".into()));
    }
    assert_eq!(hosts, 1);
}

#[tokio::test]
async fn host_relays_client_messages_one_hop() {
    let hub = MemorySignaling::new();
    let network = LoopbackNetwork::new();
    let mut a = spawn_peer(&hub, &network, "p1", |s| s);
    let mut b = spawn_peer(&hub, &network, "p2", |s| s);
    let mut c = spawn_peer(&hub, &network, "p3", |s| s);

    wait_connected(&mut b, "p1").await;
    wait_connected(&mut c, "p1").await;
    wait_connected(&mut a, "p2").await;
    wait_connected(&mut a, "p3").await;
    drain(&mut a.events);
    drain(&mut b.events);
    drain(&mut c.events);

    assert!(b.handle.send_message(player("p2", 3.0)));
    let at_host = wait_for(&mut a.events, |e| data_from(e, "p2").is_some()).await;
    assert_eq!(data_from(&at_host, "p2"), Some(player("p2", 3.0)));

    // The host's own marker travels behind any relayed copy.
    assert!(a.handle.send_message(player("p1", 9.0)));

    let mut seen_at_c = 0;
    loop {
        let event = next_event(&mut c.events).await;
        if data_from(&event, "p2").is_some() {
            seen_at_c += 1;
        }
        if data_from(&event, "p1").is_some() {
            break;
        }
    }
    assert_eq!(seen_at_c, 1);

    loop {
        let event = next_event(&mut b.events).await;
        assert!(data_from(&event, "p2").is_none(), "message echoed to origin");
        if data_from(&event, "p1").is_some() {
            break;
        }
    }

    let repeats = drain(&mut a.events)
        .iter()
        .filter(|e| data_from(e, "p2").is_some())
        .count();
    assert_eq!(repeats, 0);
}

#[tokio::test]
async fn host_messages_are_delivered_locally_and_to_every_client() {
    let hub = MemorySignaling::new();
    let network = LoopbackNetwork::new();
    let mut a = spawn_peer(&hub, &network, "p1", |s| s);
    let mut b = spawn_peer(&hub, &network, "p2", |s| s);
    wait_connected(&mut b, "p1").await;
    wait_connected(&mut a, "p2").await;

    a.handle.send_message(player("p1", 1.0));
    wait_for(&mut a.events, |e| data_from(e, "p1").is_some()).await;
    let got = wait_for(&mut b.events, |e| data_from(e, "p1").is_some()).await;
    assert_eq!(data_from(&got, "p1"), Some(player("p1", 1.0)));
}

#[tokio::test]
async fn failed_negotiation_is_isolated() {
    let hub = MemorySignaling::new();
    let network = LoopbackNetwork::new();
    network.fail_negotiation(&"p3".into(), &"p1".into());

    let mut a = spawn_peer(&hub, &network, "p1", |s| s);
    let mut b = spawn_peer(&hub, &network, "p2", |s| s);
    let mut c = spawn_peer(&hub, &network, "p3", |s| s);

    wait_for(&mut c.events, |e| is_lifecycle(e, "p1", Lifecycle::Error)).await;
    wait_connected(&mut b, "p1").await;
    wait_connected(&mut a, "p2").await;

    let failed = c.handle.snapshot().await.unwrap();
    assert_eq!(failed.connection_state("p1"), Some(ConnectionState::Failed));
    assert!(c.handle.is_running());

    let host = a.handle.snapshot().await.unwrap();
    assert_eq!(host.connection_state("p2"), Some(ConnectionState::Connected));
    assert_ne!(host.connection_state("p3"), Some(ConnectionState::Connected));
}

#[tokio::test]
async fn targeted_ice_routing_connects_everyone() {
    let hub = MemorySignaling::new();
    let network = LoopbackNetwork::new();
    let targeted = |s: PeerSettings| s.with_ice_routing(IceRouting::Targeted);
    let mut a = spawn_peer(&hub, &network, "p1", targeted);
    let mut b = spawn_peer(&hub, &network, "p2", targeted);
    let mut c = spawn_peer(&hub, &network, "p3", targeted);

    wait_connected(&mut b, "p1").await;
    wait_connected(&mut c, "p1").await;
    wait_connected(&mut a, "p2").await;
    wait_connected(&mut a, "p3").await;
}

// ---------------------------------------------------------------------------
// Heartbeat scenarios
// ---------------------------------------------------------------------------

fn with_heartbeat(settings: PeerSettings) -> PeerSettings {
    settings.with_heartbeat(HeartbeatConfig::new(1000, 2500).unwrap())
}

#[tokio::test(start_paused = true)]
async fn silent_remote_is_disconnected_exactly_once() {
    let hub = MemorySignaling::new();
    let network = LoopbackNetwork::new();
    let mut a = spawn_peer(&hub, &network, "p1", with_heartbeat);
    let mut b = spawn_peer(&hub, &network, "p2", with_heartbeat);
    wait_connected(&mut a, "p2").await;
    wait_connected(&mut b, "p1").await;

    // Let one round of pings land before cutting p2 -> p1.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    network.sever(&"p2".into(), &"p1".into());
    tokio::time::sleep(Duration::from_millis(4000)).await;

    let snapshot = a.handle.snapshot().await.unwrap();
    assert_eq!(
        snapshot.connection_state("p2"),
        Some(ConnectionState::Disconnected)
    );

    tokio::time::sleep(Duration::from_millis(10_000)).await;
    let disconnects = drain(&mut a.events)
        .iter()
        .filter(|e| is_lifecycle(e, "p2", Lifecycle::Disconnected))
        .count();
    assert_eq!(disconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn flowing_heartbeats_keep_connections_alive() {
    let hub = MemorySignaling::new();
    let network = LoopbackNetwork::new();
    let mut a = spawn_peer(&hub, &network, "p1", with_heartbeat);
    let mut b = spawn_peer(&hub, &network, "p2", with_heartbeat);
    wait_connected(&mut a, "p2").await;
    wait_connected(&mut b, "p1").await;

    tokio::time::sleep(Duration::from_millis(10_000)).await;

    for events in [&mut a.events, &mut b.events] {
        let disconnects = drain(events)
            .iter()
            .filter(|e| {
                matches!(e, SessionEvent::Lifecycle { state: Lifecycle::Disconnected, .. })
            })
            .count();
        assert_eq!(disconnects, 0);
    }
    let snapshot = a.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.connection_state("p2"), Some(ConnectionState::Connected));
}
