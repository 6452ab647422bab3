//! Incoming Action Cable frame handling and broadcast translation.

use std::sync::Arc;

use rally_common::ParticipantId;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, trace, warn};

use super::types::{CableFrame, ChannelIdentifier, RelayBroadcast};
use crate::peer::Lifecycle;
use crate::protocol::{GameObjectUpdate, PlayerState};
use crate::transport::TransportEvent;

/// What the connection loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameOutcome {
    Continue,
    Subscribe,
    Close { reconnect: bool },
}

pub(crate) struct HandlerContext {
    pub(crate) local: ParticipantId,
    pub(crate) identifier: ChannelIdentifier,
    pub(crate) subscribed: Arc<RwLock<bool>>,
    pub(crate) event_tx: broadcast::Sender<TransportEvent>,
}

impl HandlerContext {
    fn is_ours(&self, frame: &CableFrame) -> bool {
        frame
            .identifier
            .as_deref()
            .is_some_and(|id| self.identifier.matches(id))
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_lifecycle(&self, state: Lifecycle) {
        self.emit(TransportEvent::Lifecycle {
            remote: None,
            state,
        });
    }
}

// ---------------------------------------------------------------------------
// Frame Handler
// ---------------------------------------------------------------------------

pub(crate) async fn handle_frame(frame: &CableFrame, ctx: &HandlerContext) -> FrameOutcome {
    match frame.kind.as_deref() {
        Some("welcome") => {
            debug!("relay welcome received");
            FrameOutcome::Subscribe
        }
        Some("ping") => FrameOutcome::Continue,
        Some("confirm_subscription") if ctx.is_ours(frame) => {
            *ctx.subscribed.write().await = true;
            info!(channel = %ctx.identifier.channel, "relay subscription confirmed");
            ctx.emit_lifecycle(Lifecycle::Connected);
            FrameOutcome::Continue
        }
        Some("reject_subscription") if ctx.is_ours(frame) => {
            *ctx.subscribed.write().await = false;
            warn!(channel = %ctx.identifier.channel, "relay subscription rejected");
            ctx.emit_lifecycle(Lifecycle::Error);
            FrameOutcome::Continue
        }
        Some("disconnect") => {
            let reconnect = frame.reconnect.unwrap_or(true);
            info!(
                reason = frame.reason.as_deref().unwrap_or("unspecified"),
                reconnect,
                "relay server requested disconnect"
            );
            FrameOutcome::Close { reconnect }
        }
        Some(other) => {
            debug!(kind = %other, "unhandled relay frame");
            FrameOutcome::Continue
        }
        None => {
            if let (true, Some(message)) = (ctx.is_ours(frame), frame.message.as_ref()) {
                if let Some(event) = translate_broadcast(message, &ctx.local) {
                    ctx.emit(event);
                }
            }
            FrameOutcome::Continue
        }
    }
}

// ---------------------------------------------------------------------------
// Broadcasts
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PlayerRef {
    #[serde(rename = "playerId")]
    player_id: ParticipantId,
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, data: Value) -> Option<T> {
    match serde_json::from_value(data) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(kind = %kind, error = %e, "malformed relay broadcast dropped");
            None
        }
    }
}

/// Map a relay broadcast onto a transport event. Our own messages come back
/// from the server and are dropped here.
pub(crate) fn translate_broadcast(message: &Value, local: &ParticipantId) -> Option<TransportEvent> {
    let broadcast: RelayBroadcast = decode("broadcast", message.clone())?;
    if broadcast.sender_id.as_ref() == Some(local) {
        trace!("own relay broadcast dropped");
        return None;
    }
    let sender_id = broadcast.sender_id.unwrap_or_else(|| ParticipantId::new(""));

    match broadcast.kind.as_str() {
        "player_update" => {
            let player: PlayerState = decode(&broadcast.kind, broadcast.data)?;
            Some(TransportEvent::PlayerUpdate { sender_id, player })
        }
        "object_update" => {
            let object: GameObjectUpdate = decode(&broadcast.kind, broadcast.data)?;
            Some(TransportEvent::ObjectUpdate { sender_id, object })
        }
        "player_joined" => {
            let who: PlayerRef = decode(&broadcast.kind, broadcast.data)?;
            Some(TransportEvent::PlayerJoined {
                player_id: who.player_id,
            })
        }
        "player_left" => {
            let who: PlayerRef = decode(&broadcast.kind, broadcast.data)?;
            Some(TransportEvent::PlayerLeft {
                player_id: who.player_id,
            })
        }
        other => {
            warn!(kind = %other, "unknown relay message type");
            None
        }
    }
}
