//! Options, Action Cable frames, and commands for the relay client.

use rally_common::{ParticipantId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::protocol::{GameMessage, GameObjectUpdate, PlayerState};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Connection settings for the centralized relay.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Action Cable endpoint, e.g. `ws://localhost:3000/cable`.
    pub url: String,
    /// Server-side channel class.
    pub channel: String,
    pub session_id: SessionId,
    pub player_id: ParticipantId,
    /// Reconnect base delay in seconds.
    pub reconnect_delay_secs: u64,
    /// Maximum reconnect delay in seconds.
    pub max_reconnect_delay_secs: u64,
}

impl RelayOptions {
    pub fn new(url: impl Into<String>, session_id: SessionId, player_id: ParticipantId) -> Self {
        Self {
            url: url.into(),
            channel: "ExperienceChannel".into(),
            session_id,
            player_id,
            reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 30,
        }
    }

    pub(crate) fn identifier(&self) -> ChannelIdentifier {
        ChannelIdentifier {
            channel: self.channel.clone(),
            session_id: self.session_id.clone(),
            player_id: self.player_id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Action Cable protocol
// ---------------------------------------------------------------------------

/// Subscription key; travels as a JSON-encoded string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIdentifier {
    pub channel: String,
    pub session_id: SessionId,
    pub player_id: ParticipantId,
}

impl ChannelIdentifier {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether a frame's `identifier` string names this subscription.
    pub fn matches(&self, encoded: &str) -> bool {
        serde_json::from_str::<ChannelIdentifier>(encoded).is_ok_and(|other| other == *self)
    }
}

/// Anything the server sends.
///
/// Protocol frames carry `type` (`welcome`, `ping`, `confirm_subscription`,
/// `reject_subscription`, `disconnect`); channel broadcasts carry
/// `identifier` and `message` instead.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CableFrame {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub reconnect: Option<bool>,
}

/// Client to server command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CableCommand {
    pub command: &'static str,
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Serialize)]
struct Perform<'a> {
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    player_state: Option<&'a PlayerState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    object_update: Option<&'a GameObjectUpdate>,
    timestamp: i64,
}

impl CableCommand {
    pub fn subscribe(identifier: String) -> Self {
        Self {
            command: "subscribe",
            identifier,
            data: None,
        }
    }

    pub fn unsubscribe(identifier: String) -> Self {
        Self {
            command: "unsubscribe",
            identifier,
            data: None,
        }
    }

    /// `player_update{player_state, timestamp}` or
    /// `object_update{object_update, timestamp}`.
    pub fn perform(identifier: String, message: &GameMessage, timestamp: i64) -> Result<Self> {
        let perform = match message {
            GameMessage::PlayerUpdate { player } => Perform {
                action: "player_update",
                player_state: Some(player),
                object_update: None,
                timestamp,
            },
            GameMessage::ObjectUpdate { object } => Perform {
                action: "object_update",
                player_state: None,
                object_update: Some(object),
                timestamp,
            },
        };
        Ok(Self {
            command: "message",
            identifier,
            data: Some(serde_json::to_string(&perform)?),
        })
    }
}

/// Payload of a channel broadcast.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelayBroadcast {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "senderId", default)]
    pub sender_id: Option<ParticipantId>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands sent to the connection task from the transport handle.
#[derive(Debug)]
pub(crate) enum RelayCommand {
    Perform(GameMessage),
    Disconnect,
}
