use std::collections::BTreeMap;

use rally_common::{ParticipantId, SessionId};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::connection::HeartbeatConfig;
use crate::protocol::{ConnectionState, ConnectionStatus, GameMessage, P2pMessage};
use crate::rtc::RtcEvent;
use crate::signaling::SignalingEvent;

// ---------------------------------------------------------------------------
// Internal queue
// ---------------------------------------------------------------------------

/// Everything the session peer task reacts to.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    Signaling(SignalingEvent),
    Rtc {
        remote: ParticipantId,
        connection_id: u64,
        event: RtcEvent,
    },
    HeartbeatDue {
        remote: ParticipantId,
        connection_id: u64,
    },
    Send(GameMessage),
    Snapshot(oneshot::Sender<PeerSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Client,
}

/// Which connections an inbound ICE candidate is applied to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IceRouting {
    /// Every tracked connection.
    #[default]
    Broadcast,
    /// Only the sender's connection; candidates addressed elsewhere are
    /// ignored.
    Targeted,
}

#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub session_id: SessionId,
    pub peer_id: ParticipantId,
    pub heartbeat: Option<HeartbeatConfig>,
    pub ice_routing: IceRouting,
}

impl PeerSettings {
    pub fn new(session_id: SessionId, peer_id: ParticipantId) -> Self {
        Self {
            session_id,
            peer_id,
            heartbeat: None,
            ice_routing: IceRouting::default(),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_ice_routing(mut self, routing: IceRouting) -> Self {
        self.ice_routing = routing;
        self
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Lifecycle notification surfaced to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Negotiating,
    Connecting,
    Connected,
    Disconnected,
    Closed,
    Error,
}

impl Lifecycle {
    /// `New` has no notification.
    pub fn from_state(state: ConnectionState) -> Option<Self> {
        match state {
            ConnectionState::New => None,
            ConnectionState::Negotiating => Some(Lifecycle::Negotiating),
            ConnectionState::Connecting => Some(Lifecycle::Connecting),
            ConnectionState::Connected => Some(Lifecycle::Connected),
            ConnectionState::Disconnected => Some(Lifecycle::Disconnected),
            ConnectionState::Closed => Some(Lifecycle::Closed),
            ConnectionState::Failed => Some(Lifecycle::Error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// An application message delivered locally (`Data` or
    /// `Data.Connection.State`).
    Message(P2pMessage),
    /// `remote` is `None` for session-wide notifications.
    Lifecycle {
        remote: Option<ParticipantId>,
        state: Lifecycle,
    },
}

/// Point-in-time view of a session peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSnapshot {
    pub peer_id: ParticipantId,
    pub role: Role,
    pub host_peer_id: Option<ParticipantId>,
    pub connections: BTreeMap<ParticipantId, ConnectionState>,
    /// Last aggregated status; empty on clients.
    pub connection_status: ConnectionStatus,
}

impl PeerSnapshot {
    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn connection_state(&self, remote: &str) -> Option<ConnectionState> {
        self.connections.get(remote).copied()
    }
}
