use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use rally_common::ParticipantId;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{membership_changes, Transport, TransportEvent, EVENT_CAPACITY};
use crate::clock::Clock;
use crate::peer::{PeerSettings, SessionEvent, SessionHandle, SessionPeer};
use crate::protocol::{ConnectionState, GameMessage, MessageKind};
use crate::rtc::RtcBackend;
use crate::signaling::Signaling;

/// Peer-to-peer transport: a [`SessionPeer`] over RTC data channels.
pub struct DirectTransport {
    handle: SessionHandle,
    events: broadcast::Sender<TransportEvent>,
    bridge: JoinHandle<()>,
}

impl DirectTransport {
    pub fn start(
        settings: PeerSettings,
        signaling: Arc<dyn Signaling>,
        backend: Arc<dyn RtcBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let local = settings.peer_id.clone();
        let (handle, session_events) = SessionPeer::spawn(settings, signaling, backend, clock);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let bridge = tokio::spawn(bridge(local, session_events, events.clone()));
        Self {
            handle,
            events,
            bridge,
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }
}

/// Translate session events into transport events.
async fn bridge(
    local: ParticipantId,
    mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
    events: broadcast::Sender<TransportEvent>,
) {
    let mut members = BTreeSet::new();

    while let Some(event) = session_events.recv().await {
        match event {
            SessionEvent::Message(message) => match message.kind {
                MessageKind::Data => match message.game_message() {
                    Some(game) => {
                        let _ = events.send(TransportEvent::from_game(message.sender_id, game));
                    }
                    None => debug!(sender = %message.sender_id, "undecodable payload dropped"),
                },
                MessageKind::ConnectionState => {
                    let Some(status) = message.connection_status() else {
                        debug!("undecodable connection status dropped");
                        continue;
                    };
                    let (current, changes) = membership_changes(&members, &status, &local);
                    members = current;
                    for change in changes {
                        let _ = events.send(change);
                    }
                    let _ = events.send(TransportEvent::ConnectionStatus(status));
                }
                MessageKind::Heartbeat => {}
            },
            SessionEvent::Lifecycle { remote, state } => {
                let _ = events.send(TransportEvent::Lifecycle { remote, state });
            }
        }
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn peer_id(&self) -> &ParticipantId {
        self.handle.peer_id()
    }

    async fn is_host(&self) -> bool {
        self.handle
            .snapshot()
            .await
            .is_some_and(|snapshot| snapshot.is_host())
    }

    /// The host counts as connected on its own; a client once its connection
    /// to the host is up.
    async fn is_connected(&self) -> bool {
        self.handle.snapshot().await.is_some_and(|snapshot| {
            snapshot.is_host()
                || snapshot
                    .connections
                    .values()
                    .any(|state| *state == ConnectionState::Connected)
        })
    }

    async fn send(&self, message: GameMessage) {
        if !self.handle.send_message(message) {
            debug!("session peer stopped, message dropped");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) {
        self.handle.shutdown().await;
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        self.bridge.abort();
    }
}
