//! Wire types for signaling and for data-channel payloads.
//!
//! Signaling messages travel through the signaling server as JSON objects
//! tagged `{"type": "Connection", "state": ...}`. Application messages travel
//! over data channels (or the relay transports) inside the
//! `{type, senderId, data}` envelope.

use std::collections::BTreeMap;

use rally_common::{ParticipantId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SessionError};

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Lifecycle of one point-to-point connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Negotiating,
    Connecting,
    Connected,
    Disconnected,
    Closed,
    Failed,
}

impl ConnectionState {
    /// The connection will not recover from this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Closed | ConnectionState::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated connectivity map computed by the host.
pub type ConnectionStatus = BTreeMap<ParticipantId, ConnectionState>;

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

/// The only envelope type carried by signaling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    #[default]
    Connection,
}

/// A negotiation message exchanged through the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub session_id: SessionId,
    /// Sender of the message, or the joining participant for `SessionReady`.
    pub peer_id: ParticipantId,
    #[serde(flatten)]
    pub body: Negotiation,
}

impl SignalingMessage {
    pub fn new(session_id: SessionId, peer_id: ParticipantId, body: Negotiation) -> Self {
        Self {
            kind: SignalKind::Connection,
            session_id,
            peer_id,
            body,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Negotiation payload, discriminated by `state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum Negotiation {
    SessionJoin,

    SessionReady {
        host_peer_id: ParticipantId,
    },

    SdpOffer {
        host_peer_id: ParticipantId,
        /// JSON-encoded [`SessionDescription`].
        #[serde(rename = "SdpOffer")]
        offer: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_peer_id: Option<ParticipantId>,
    },

    SdpAnswer {
        host_peer_id: ParticipantId,
        /// JSON-encoded [`SessionDescription`].
        #[serde(rename = "SdpAnswer")]
        answer: String,
    },

    IceCandidate {
        #[serde(rename = "IceCandidate")]
        candidate: IceCandidateInit,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_peer_id: Option<ParticipantId>,
    },

    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Negotiation {
    pub fn state_name(&self) -> &'static str {
        match self {
            Negotiation::SessionJoin => "SessionJoin",
            Negotiation::SessionReady { .. } => "SessionReady",
            Negotiation::SdpOffer { .. } => "SdpOffer",
            Negotiation::SdpAnswer { .. } => "SdpAnswer",
            Negotiation::IceCandidate { .. } => "IceCandidate",
            Negotiation::Error { .. } => "Error",
        }
    }
}

/// ICE candidate in the browser `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description as produced by the RTC stack.
///
/// Carried over signaling as a JSON string, so the wire value of
/// `SdpOffer`/`SdpAnswer` is `"{\"type\":\"offer\",\"sdp\":\"...\"}"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a wire description and check it is of the expected kind.
    pub fn from_wire(wire: &str, expected: SdpKind) -> Result<Self> {
        let desc: SessionDescription = serde_json::from_str(wire)?;
        if desc.kind != expected {
            return Err(SessionError::Negotiation(format!(
                "expected {expected:?} description, got {:?}",
                desc.kind
            )));
        }
        Ok(desc)
    }
}

// ---------------------------------------------------------------------------
// Application envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Data,
    #[serde(rename = "Data.Connection.State")]
    ConnectionState,
    Heartbeat,
}

/// `{type, senderId, data}` envelope carried by data channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct P2pMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "senderId")]
    pub sender_id: ParticipantId,
    pub data: Value,
}

impl P2pMessage {
    pub const HEARTBEAT_PING: &'static str = "ping";

    pub fn data(sender_id: ParticipantId, message: &GameMessage) -> Result<Self> {
        Ok(Self {
            kind: MessageKind::Data,
            sender_id,
            data: serde_json::to_value(message)?,
        })
    }

    pub fn heartbeat(sender_id: ParticipantId) -> Self {
        Self {
            kind: MessageKind::Heartbeat,
            sender_id,
            data: Value::String(Self::HEARTBEAT_PING.into()),
        }
    }

    pub fn connection_state(sender_id: ParticipantId, status: &ConnectionStatus) -> Result<Self> {
        Ok(Self {
            kind: MessageKind::ConnectionState,
            sender_id,
            data: serde_json::to_value(status)?,
        })
    }

    /// Decode the payload of a `Data` message.
    pub fn game_message(&self) -> Option<GameMessage> {
        match self.kind {
            MessageKind::Data => serde_json::from_value(self.data.clone()).ok(),
            _ => None,
        }
    }

    /// Decode the payload of a `Data.Connection.State` message.
    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        match self.kind {
            MessageKind::ConnectionState => serde_json::from_value(self.data.clone()).ok(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Game payloads
// ---------------------------------------------------------------------------

/// Payload of a `Data` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GameMessage {
    PlayerUpdate { player: PlayerState },
    ObjectUpdate { object: GameObjectUpdate },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub id: ParticipantId,
    pub position: [f32; 3],
    pub rotation: [f32; 3],
    pub color: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectShape {
    Box,
    Sphere,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionKind {
    Grab,
    Release,
    Hover,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    #[serde(rename = "type")]
    pub kind: InteractionKind,
    #[serde(rename = "playerId")]
    pub player_id: ParticipantId,
}

/// State change of a shared object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameObjectUpdate {
    pub id: String,
    #[serde(rename = "type")]
    pub shape: ObjectShape,
    pub position: [f32; 3],
    pub rotation: [f32; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction: Option<Interaction>,
}
