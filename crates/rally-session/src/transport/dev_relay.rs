//! Transport over the plain dev relay: every payload goes through the relay
//! server, which forwards it to the other members of the session.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rally_common::ParticipantId;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{Transport, TransportEvent, EVENT_CAPACITY};
use crate::peer::Lifecycle;
use crate::protocol::{GameMessage, MessageKind, Negotiation, P2pMessage, SignalingMessage};
use crate::signaling::{Signaling, SignalingEvent};

pub struct DevRelayTransport {
    peer_id: ParticipantId,
    socket: Arc<dyn Signaling>,
    host: Arc<Mutex<Option<ParticipantId>>>,
    events: broadcast::Sender<TransportEvent>,
}

impl DevRelayTransport {
    /// Install the frame handler and connect `socket`.
    pub fn start(peer_id: ParticipantId, socket: Arc<dyn Signaling>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let host = Arc::new(Mutex::new(None));

        let handler_events = events.clone();
        let handler_host = Arc::clone(&host);
        let local = peer_id.clone();
        socket.set_message_handler(Arc::new(move |event| {
            for translated in translate(&local, &handler_host, event) {
                let _ = handler_events.send(translated);
            }
        }));
        socket.connect();

        Self {
            peer_id,
            socket,
            host,
            events,
        }
    }

    fn host(&self) -> Option<ParticipantId> {
        self.host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn translate(
    local: &ParticipantId,
    host: &Mutex<Option<ParticipantId>>,
    event: SignalingEvent,
) -> Vec<TransportEvent> {
    match event {
        SignalingEvent::Connected => vec![TransportEvent::Lifecycle {
            remote: None,
            state: Lifecycle::Connected,
        }],
        SignalingEvent::Disconnected => vec![TransportEvent::Lifecycle {
            remote: None,
            state: Lifecycle::Disconnected,
        }],
        SignalingEvent::Failed(reason) => {
            warn!(reason = %reason, "dev relay unavailable");
            vec![TransportEvent::Lifecycle {
                remote: None,
                state: Lifecycle::Error,
            }]
        }
        SignalingEvent::Message(value) => translate_frame(local, host, value)
            .into_iter()
            .collect(),
    }
}

fn translate_frame(
    local: &ParticipantId,
    host: &Mutex<Option<ParticipantId>>,
    value: Value,
) -> Option<TransportEvent> {
    if value.get("state").is_some() {
        let message = SignalingMessage::from_value(value).ok()?;
        let Negotiation::SessionReady { host_peer_id } = message.body else {
            return None;
        };
        let mut current = host.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_none() {
            info!(host = %host_peer_id, "dev relay host announced");
            *current = Some(host_peer_id);
        }
        return (message.peer_id != *local).then_some(TransportEvent::PlayerJoined {
            player_id: message.peer_id,
        });
    }

    let message: P2pMessage = match serde_json::from_value(value) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "unrecognised dev relay frame dropped");
            return None;
        }
    };
    if message.sender_id == *local || message.kind != MessageKind::Data {
        return None;
    }
    let game = message.game_message()?;
    Some(TransportEvent::from_game(message.sender_id, game))
}

#[async_trait]
impl Transport for DevRelayTransport {
    fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    async fn is_host(&self) -> bool {
        self.host().as_ref() == Some(&self.peer_id)
    }

    async fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    async fn send(&self, message: GameMessage) {
        let value = P2pMessage::data(self.peer_id.clone(), &message)
            .and_then(|envelope| Ok(serde_json::to_value(envelope)?));
        match value {
            Ok(value) => self.socket.send(value),
            Err(e) => warn!(error = %e, "failed to encode payload"),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) {
        self.socket.disconnect();
    }
}
