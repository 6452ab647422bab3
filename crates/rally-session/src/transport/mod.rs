//! The capability the presentation layer holds.
//!
//! Every transport delivers the same [`TransportEvent`]s and accepts the same
//! [`GameMessage`]s, whether the bytes travel over RTC data channels, the
//! Action Cable relay or the plain dev relay.

mod dev_relay;
mod direct;

pub use dev_relay::DevRelayTransport;
pub use direct::DirectTransport;

use std::collections::BTreeSet;

use async_trait::async_trait;
use rally_common::ParticipantId;
use tokio::sync::broadcast;

use crate::peer::Lifecycle;
use crate::protocol::{ConnectionState, ConnectionStatus, GameMessage, GameObjectUpdate, PlayerState};

/// Buffered events per subscriber before the slowest one starts lagging.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PlayerUpdate {
        sender_id: ParticipantId,
        player: PlayerState,
    },
    ObjectUpdate {
        sender_id: ParticipantId,
        object: GameObjectUpdate,
    },
    PlayerJoined {
        player_id: ParticipantId,
    },
    PlayerLeft {
        player_id: ParticipantId,
    },
    /// Host-computed connectivity map.
    ConnectionStatus(ConnectionStatus),
    Lifecycle {
        remote: Option<ParticipantId>,
        state: Lifecycle,
    },
}

impl TransportEvent {
    pub fn from_game(sender_id: ParticipantId, message: GameMessage) -> Self {
        match message {
            GameMessage::PlayerUpdate { player } => TransportEvent::PlayerUpdate { sender_id, player },
            GameMessage::ObjectUpdate { object } => TransportEvent::ObjectUpdate { sender_id, object },
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn peer_id(&self) -> &ParticipantId;

    async fn is_host(&self) -> bool;

    async fn is_connected(&self) -> bool;

    /// Fire-and-forget.
    async fn send(&self, message: GameMessage);

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    async fn send_player_update(&self, player: PlayerState) {
        self.send(GameMessage::PlayerUpdate { player }).await;
    }

    async fn send_object_update(&self, object: GameObjectUpdate) {
        self.send(GameMessage::ObjectUpdate { object }).await;
    }

    async fn shutdown(&self);
}

/// Participants reported connected in `status`, excluding `local`.
fn connected_peers(status: &ConnectionStatus, local: &ParticipantId) -> BTreeSet<ParticipantId> {
    status
        .iter()
        .filter(|(id, state)| *id != local && **state == ConnectionState::Connected)
        .map(|(id, _)| id.clone())
        .collect()
}

/// Joined/left events between two status maps.
pub(crate) fn membership_changes(
    previous: &BTreeSet<ParticipantId>,
    status: &ConnectionStatus,
    local: &ParticipantId,
) -> (BTreeSet<ParticipantId>, Vec<TransportEvent>) {
    let current = connected_peers(status, local);
    let mut changes: Vec<TransportEvent> = current
        .difference(previous)
        .map(|id| TransportEvent::PlayerJoined {
            player_id: id.clone(),
        })
        .collect();
    changes.extend(previous.difference(&current).map(|id| TransportEvent::PlayerLeft {
        player_id: id.clone(),
    }));
    (current, changes)
}
