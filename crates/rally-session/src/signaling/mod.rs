//! Signaling side-channel.
//!
//! Carries small JSON control messages between the participants of one
//! session through a server intermediary. [`SignalingChannel`] speaks the dev
//! relay protocol over WebSocket; [`MemorySignaling`] is an in-process hub
//! with the same fan-out semantics.

mod channel;
mod memory;

pub use channel::{SignalingChannel, SignalingOptions};
pub use memory::{MemoryEndpoint, MemorySignaling};

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

/// Reason reported when reconnect attempts run out.
pub const JOIN_FAILED: &str = "unable to join session";

/// What the signaling channel reports to its handler.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Connected and joined the session.
    Connected,
    /// A parsed inbound JSON message.
    Message(Value),
    /// Connection lost; a reconnect may follow.
    Disconnected,
    /// Reconnect attempts exhausted.
    Failed(String),
}

pub type MessageHandler = Arc<dyn Fn(SignalingEvent) + Send + Sync>;

/// Contract shared by signaling implementations.
pub trait Signaling: Send + Sync {
    /// Start connecting. Progress is reported to the message handler.
    fn connect(&self);

    /// Send a message to every other participant of the session.
    /// A no-op with a warning while disconnected.
    fn send(&self, message: Value);

    fn set_message_handler(&self, handler: MessageHandler);

    /// Close the connection and cancel pending reconnects.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// First frame sent to the signaling server after connecting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinRequest<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "sessionId")]
    pub session_id: &'a str,
    #[serde(rename = "peerId")]
    pub peer_id: &'a str,
}

impl<'a> JoinRequest<'a> {
    pub fn new(session_id: &'a str, peer_id: &'a str) -> Self {
        Self {
            kind: "join",
            session_id,
            peer_id,
        }
    }
}
