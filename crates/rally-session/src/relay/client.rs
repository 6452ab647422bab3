//! Public handle for the Action Cable relay connection.

use std::sync::Arc;

use async_trait::async_trait;
use rally_common::ParticipantId;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

use super::connection::connection_loop;
use super::types::{RelayCommand, RelayOptions};
use crate::protocol::GameMessage;
use crate::transport::{Transport, TransportEvent, EVENT_CAPACITY};

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Centralized transport: every payload is performed on the server channel,
/// which broadcasts it to the whole session.
///
/// There is no host in this mode; the server is the authority.
pub struct RelayTransport {
    player_id: ParticipantId,
    command_tx: mpsc::Sender<RelayCommand>,
    subscribed: Arc<RwLock<bool>>,
    events: broadcast::Sender<TransportEvent>,
}

impl RelayTransport {
    /// Start the background connection. Events are available through
    /// [`Transport::subscribe`].
    pub fn connect(options: RelayOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(64);
        let subscribed = Arc::new(RwLock::new(false));

        let client = Self {
            player_id: options.player_id.clone(),
            command_tx,
            subscribed: Arc::clone(&subscribed),
            events: events.clone(),
        };

        tokio::spawn(connection_loop(options, subscribed, events, command_rx));

        client
    }

    /// Whether the server confirmed our channel subscription.
    pub async fn is_subscribed(&self) -> bool {
        *self.subscribed.read().await
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn peer_id(&self) -> &ParticipantId {
        &self.player_id
    }

    async fn is_host(&self) -> bool {
        false
    }

    async fn is_connected(&self) -> bool {
        self.is_subscribed().await
    }

    async fn send(&self, message: GameMessage) {
        if !self.is_subscribed().await {
            warn!("relay not connected, cannot send");
            return;
        }
        match self.command_tx.try_send(RelayCommand::Perform(message)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("relay command queue full, payload dropped"),
            Err(TrySendError::Closed(_)) => debug!("relay connection gone, payload dropped"),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) {
        let _ = self.command_tx.send(RelayCommand::Disconnect).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;
    use crate::peer::Lifecycle;
    use crate::protocol::PlayerState;

    fn player(id: &str) -> PlayerState {
        PlayerState {
            id: id.into(),
            position: [0.0, 1.0, 5.0],
            rotation: [0.0, 0.0, 0.0],
            color: "#3366ff".into(),
            name: id.into(),
        }
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for client frame")
                .expect("client hung up")
                .expect("socket error");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<TransportEvent>,
        mut matches: impl FnMut(&TransportEvent) -> bool,
    ) -> TransportEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for transport event")
                .expect("transport closed");
            if matches(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn subscribes_relays_and_suppresses_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/cable", listener.local_addr().unwrap());

        let transport = RelayTransport::connect(RelayOptions::new(url, "s1".into(), "p1".into()));
        let mut events = transport.subscribe();

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(WsMessage::Text(json!({"type": "welcome"}).to_string().into()))
            .await
            .unwrap();

        let subscribe = next_json(&mut ws).await;
        assert_eq!(subscribe["command"], "subscribe");
        let identifier = subscribe["identifier"].as_str().unwrap().to_string();
        let parsed: Value = serde_json::from_str(&identifier).unwrap();
        assert_eq!(parsed["channel"], "ExperienceChannel");
        assert_eq!(parsed["session_id"], "s1");
        assert_eq!(parsed["player_id"], "p1");

        ws.send(WsMessage::Text(
            json!({"type": "confirm_subscription", "identifier": identifier})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
        wait_for(&mut events, |e| {
            matches!(e, TransportEvent::Lifecycle { remote: None, state: Lifecycle::Connected })
        })
        .await;
        assert!(transport.is_connected().await);
        assert!(!transport.is_host().await);

        // Our own echo first, then someone else's update.
        for sender in ["p1", "p2"] {
            let frame = json!({
                "identifier": identifier,
                "message": {
                    "type": "player_update",
                    "data": serde_json::to_value(player(sender)).unwrap(),
                    "senderId": sender,
                    "timestamp": 1
                }
            });
            ws.send(WsMessage::Text(frame.to_string().into())).await.unwrap();
        }
        let got = wait_for(&mut events, |e| matches!(e, TransportEvent::PlayerUpdate { .. })).await;
        assert_eq!(
            got,
            TransportEvent::PlayerUpdate {
                sender_id: "p2".into(),
                player: player("p2")
            }
        );

        transport.send_player_update(player("p1")).await;
        let perform = next_json(&mut ws).await;
        assert_eq!(perform["command"], "message");
        assert_eq!(perform["identifier"], identifier.as_str());
        let data: Value = serde_json::from_str(perform["data"].as_str().unwrap()).unwrap();
        assert_eq!(data["action"], "player_update");
        assert_eq!(data["player_state"]["id"], "p1");
        assert!(data["timestamp"].as_i64().unwrap() > 0);

        transport.shutdown().await;
        let unsubscribe = next_json(&mut ws).await;
        assert_eq!(unsubscribe["command"], "unsubscribe");
        wait_for(&mut events, |e| {
            matches!(e, TransportEvent::Lifecycle { remote: None, state: Lifecycle::Disconnected })
        })
        .await;
        assert!(!transport.is_connected().await);
    }

    #[tokio::test]
    async fn send_before_subscription_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/cable", listener.local_addr().unwrap());
        let transport = RelayTransport::connect(RelayOptions::new(url, "s1".into(), "p1".into()));

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        transport.send_player_update(player("p1")).await;
        ws.send(WsMessage::Text(json!({"type": "welcome"}).to_string().into()))
            .await
            .unwrap();

        // The first frame we see is the subscription, not a perform.
        let first = next_json(&mut ws).await;
        assert_eq!(first["command"], "subscribe");
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn send_never_waits_on_a_stalled_forwarder() {
        let (command_tx, mut command_rx) = mpsc::channel(1);
        let transport = RelayTransport {
            player_id: "p1".into(),
            command_tx,
            subscribed: Arc::new(RwLock::new(true)),
            events: broadcast::channel(EVENT_CAPACITY).0,
        };

        tokio::time::timeout(Duration::from_secs(1), async {
            for _ in 0..3 {
                transport.send_player_update(player("p1")).await;
            }
        })
        .await
        .expect("send blocked on a full command queue");

        assert!(matches!(command_rx.try_recv(), Ok(RelayCommand::Perform(_))));
        assert!(command_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_refusing_reconnect_stops_the_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/cable", listener.local_addr().unwrap());
        let transport = RelayTransport::connect(RelayOptions::new(url, "s1".into(), "p1".into()));
        let mut events = transport.subscribe();

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(WsMessage::Text(
            json!({"type": "disconnect", "reason": "unauthorized", "reconnect": false})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

        wait_for(&mut events, |e| {
            matches!(e, TransportEvent::Lifecycle { remote: None, state: Lifecycle::Disconnected })
        })
        .await;

        // Backoff is one second; nothing should dial back in.
        let retry = tokio::time::timeout(Duration::from_millis(1500), listener.accept()).await;
        assert!(retry.is_err());
    }
}
