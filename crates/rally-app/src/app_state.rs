//! Presentation-side session state: the local avatar and the roster of
//! everyone else, fed by transport events.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rally_common::ParticipantId;
use rally_session::{
    ConnectionState, GameObjectUpdate, Lifecycle, PlayerState, Transport, TransportEvent,
};
use tokio::sync::broadcast::error::RecvError;

/// How often the local avatar is published.
pub const PUBLISH_INTERVAL: Duration = Duration::from_millis(500);

const COLORS: [&str; 6] = ["#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#46f0f0"];

pub struct RallyApp {
    transport: Arc<dyn Transport>,
    local: PlayerState,
    tick: u64,
    players: BTreeMap<ParticipantId, PlayerState>,
    objects: BTreeMap<String, GameObjectUpdate>,
    connected: bool,
}

impl RallyApp {
    pub fn new(transport: Arc<dyn Transport>, name: String) -> Self {
        let id = transport.peer_id().clone();
        let color = COLORS[id.as_str().bytes().map(usize::from).sum::<usize>() % COLORS.len()];
        Self {
            local: PlayerState {
                id,
                position: [0.0, 1.0, 5.0],
                rotation: [0.0, 0.0, 0.0],
                color: color.to_string(),
                name,
            },
            transport,
            tick: 0,
            players: BTreeMap::new(),
            objects: BTreeMap::new(),
            connected: false,
        }
    }

    /// Fold one transport event into the roster.
    pub fn apply(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PlayerUpdate { sender_id, player } => {
                if !self.players.contains_key(&sender_id) {
                    tracing::info!(player = %sender_id, name = %player.name, "player appeared");
                }
                self.players.insert(sender_id, player);
            }
            TransportEvent::ObjectUpdate { object, .. } => {
                self.objects.insert(object.id.clone(), object);
            }
            TransportEvent::PlayerJoined { player_id } => {
                tracing::info!(player = %player_id, "player joined");
            }
            TransportEvent::PlayerLeft { player_id } => {
                tracing::info!(player = %player_id, "player left");
                self.players.remove(&player_id);
            }
            TransportEvent::ConnectionStatus(status) => {
                let connected = status
                    .values()
                    .filter(|state| **state == ConnectionState::Connected)
                    .count();
                tracing::debug!(connected, total = status.len(), "connection status");
            }
            TransportEvent::Lifecycle { remote, state } => {
                match &remote {
                    Some(remote) => tracing::info!(remote = %remote, state = ?state, "connection lifecycle"),
                    None => tracing::info!(state = ?state, "session lifecycle"),
                }
                match (remote, state) {
                    (None, Lifecycle::Connected) => self.connected = true,
                    (None, Lifecycle::Disconnected | Lifecycle::Error) => self.connected = false,
                    (Some(remote), Lifecycle::Disconnected | Lifecycle::Closed) => {
                        self.players.remove(&remote);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Walk the avatar around a circle.
    fn step(&mut self) -> PlayerState {
        self.tick += 1;
        let angle = self.tick as f32 * 0.1;
        self.local.position = [angle.cos() * 3.0, 1.0, angle.sin() * 3.0];
        self.local.rotation = [0.0, -angle, 0.0];
        self.local.clone()
    }

    /// Publish the avatar periodically and consume events until Ctrl-C.
    pub async fn run(self) {
        self.run_until(tokio::signal::ctrl_c()).await;
    }

    /// Like [`RallyApp::run`], stopping once `stop` resolves. The future is
    /// polled across loop iterations so a signal is never lost.
    async fn run_until<F: std::future::Future>(mut self, stop: F) {
        let mut events = self.transport.subscribe();
        let mut publish = tokio::time::interval(PUBLISH_INTERVAL);
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = publish.tick() => {
                    let player = self.step();
                    if self.connected || self.transport.is_connected().await {
                        self.transport.send_player_update(player).await;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => self.apply(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = &mut stop => {
                    tracing::info!(
                        players = self.players.len(),
                        objects = self.objects.len(),
                        "leaving session"
                    );
                    break;
                }
            }
        }

        self.transport.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rally_session::GameMessage;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    struct Recording {
        id: ParticipantId,
        sent: Mutex<Vec<GameMessage>>,
        events: broadcast::Sender<TransportEvent>,
        shut_down: std::sync::atomic::AtomicBool,
    }

    impl Recording {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                sent: Mutex::new(Vec::new()),
                events: broadcast::channel(16).0,
                shut_down: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Transport for Recording {
        fn peer_id(&self) -> &ParticipantId {
            &self.id
        }
        async fn is_host(&self) -> bool {
            false
        }
        async fn is_connected(&self) -> bool {
            true
        }
        async fn send(&self, message: GameMessage) {
            self.sent.lock().unwrap().push(message);
        }
        fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
            self.events.subscribe()
        }
        async fn shutdown(&self) {
            self.shut_down.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn player(id: &str) -> PlayerState {
        PlayerState {
            id: id.into(),
            position: [0.0, 1.0, 0.0],
            rotation: [0.0, 0.0, 0.0],
            color: "#ffffff".into(),
            name: id.into(),
        }
    }

    #[test]
    fn roster_tracks_updates_and_departures() {
        let mut app = RallyApp::new(Recording::new("p1"), "Ana".into());
        app.apply(TransportEvent::PlayerUpdate {
            sender_id: "p2".into(),
            player: player("p2"),
        });
        app.apply(TransportEvent::PlayerUpdate {
            sender_id: "p3".into(),
            player: player("p3"),
        });
        assert_eq!(app.players.len(), 2);

        app.apply(TransportEvent::PlayerLeft {
            player_id: "p2".into(),
        });
        app.apply(TransportEvent::Lifecycle {
            remote: Some("p3".into()),
            state: Lifecycle::Disconnected,
        });
        assert!(app.players.is_empty());
    }

    #[test]
    fn session_lifecycle_toggles_connected() {
        let mut app = RallyApp::new(Recording::new("p1"), "Ana".into());
        app.apply(TransportEvent::Lifecycle {
            remote: None,
            state: Lifecycle::Connected,
        });
        assert!(app.connected);
        app.apply(TransportEvent::Lifecycle {
            remote: None,
            state: Lifecycle::Error,
        });
        assert!(!app.connected);
    }

    #[test]
    fn avatar_moves_and_keeps_identity() {
        let mut app = RallyApp::new(Recording::new("p1"), "Ana".into());
        let first = app.step();
        let second = app.step();
        assert_eq!(first.id, "p1");
        assert_eq!(second.name, "Ana");
        assert_ne!(first.position, second.position);
        assert_eq!(first.color, app.local.color);
    }

    #[tokio::test(start_paused = true)]
    async fn run_publishes_the_avatar() {
        let transport = Recording::new("p1");
        let app = RallyApp::new(Arc::clone(&transport) as Arc<dyn Transport>, "Ana".into());

        let task = tokio::spawn(app.run());
        tokio::time::sleep(PUBLISH_INTERVAL * 3).await;
        task.abort();

        let sent = transport.sent.lock().unwrap();
        assert!(sent.len() >= 3);
        assert!(matches!(&sent[0], GameMessage::PlayerUpdate { player } if player.name == "Ana"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_during_busy_loop_ends_the_session() {
        let transport = Recording::new("p1");
        let app = RallyApp::new(Arc::clone(&transport) as Arc<dyn Transport>, "Ana".into());
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let task = tokio::spawn(app.run_until(stop_rx));
        tokio::time::sleep(PUBLISH_INTERVAL * 2).await;
        for n in 0..50 {
            let _ = transport.events.send(TransportEvent::PlayerJoined {
                player_id: format!("p{n}").into(),
            });
        }
        stop_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("run loop ignored the stop signal")
            .unwrap();
        assert!(transport.shut_down.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!transport.sent.lock().unwrap().is_empty());
    }
}
