//! Relay-level wire protocol. Only the join frame is parsed; everything after
//! is forwarded as opaque text frames.

use rally_common::{ParticipantId, SessionId};
use rally_session::protocol::{Negotiation, SignalingMessage};
use serde::Deserialize;

/// First message a client sends to identify itself.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum RelayHello {
    #[serde(rename = "join")]
    Join {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "peerId")]
        peer_id: ParticipantId,
    },
}

/// Announcement sent to every member when `joiner` arrives.
pub fn session_ready(
    session_id: &SessionId,
    joiner: &ParticipantId,
    host: &ParticipantId,
) -> serde_json::Result<String> {
    let message = SignalingMessage::new(
        session_id.clone(),
        joiner.clone(),
        Negotiation::SessionReady {
            host_peer_id: host.clone(),
        },
    );
    serde_json::to_string(&message)
}
