//! Per-connection handler: join, announce, then fan frames out.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use rally_common::{ParticipantId, SessionId};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::protocol::{session_ready, RelayHello};
use crate::session::SessionStore;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames buffered per member before fan-out starts dropping.
const MEMBER_BUFFER: usize = 256;

/// Handle a single WebSocket connection.
pub async fn handle_connection(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    store: SessionStore,
) {
    let (mut sink, mut stream) = ws.split();

    // 1. The first frame names the session.
    let Some((session_id, peer_id)) = read_join(&mut stream, addr).await else {
        return;
    };

    // 2. Create our receive channel and register.
    let (tx, mut rx) = mpsc::channel::<String>(MEMBER_BUFFER);
    let joined = store.join(&session_id, &peer_id, tx).await;

    tracing::info!(
        peer = %addr,
        session = %session_id,
        participant = %peer_id,
        "client joined"
    );

    // 3. Announce the joiner (and the host) to everyone, joiner included.
    if let Some(host) = &joined.host {
        match session_ready(&session_id, &peer_id, host) {
            Ok(json) => {
                for member in &joined.everyone {
                    deliver(member, json.clone(), &session_id);
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode SessionReady"),
        }
    }

    // 4. Forwarding loop.
    loop {
        tokio::select! {
            // Frames from other members -> this client's WebSocket
            Some(msg) = rx.recv() => {
                if sink.send(Message::Text(msg.into())).await.is_err() {
                    break;
                }
            }

            // Frames from this client -> every other member
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !is_relayable(&text) {
                            tracing::debug!(peer = %addr, "malformed frame ignored");
                            continue;
                        }
                        for other in store.others(&session_id, joined.member).await {
                            deliver(&other, text.to_string(), &session_id);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(peer = %addr, error = %e, "WS error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // 5. Cleanup.
    tracing::info!(
        peer = %addr,
        session = %session_id,
        participant = %peer_id,
        "client left"
    );
    if store.leave(&session_id, joined.member).await {
        tracing::debug!(session = %session_id, "session closed");
    }
}

/// Queue a frame for one member without waiting. A member that is not
/// draining its socket loses frames instead of stalling the sender.
fn deliver(member: &mpsc::Sender<String>, frame: String, session_id: &SessionId) {
    match member.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            tracing::debug!(session = %session_id, "member backlog full, frame dropped");
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(session = %session_id, "member channel closed");
        }
    }
}

/// JSON objects are relayed verbatim; anything else, and repeated joins, are
/// dropped.
fn is_relayable(text: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => value.is_object() && value.get("type").and_then(|t| t.as_str()) != Some("join"),
        Err(_) => false,
    }
}

/// Read and parse the first frame as a join request.
async fn read_join(
    stream: &mut SplitStream<WebSocketStream<TcpStream>>,
    addr: SocketAddr,
) -> Option<(SessionId, ParticipantId)> {
    let frame = tokio::time::timeout(JOIN_TIMEOUT, stream.next()).await;

    match frame {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<RelayHello>(&text) {
            Ok(RelayHello::Join {
                session_id,
                peer_id,
            }) => Some((session_id, peer_id)),
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "invalid join frame");
                None
            }
        },
        Ok(Some(Ok(_))) => {
            tracing::warn!(peer = %addr, "expected text join frame");
            None
        }
        Ok(Some(Err(e))) => {
            tracing::warn!(peer = %addr, error = %e, "WS error during join");
            None
        }
        Ok(None) => {
            tracing::debug!(peer = %addr, "connection closed before join");
            None
        }
        Err(_) => {
            tracing::warn!(peer = %addr, "join timeout ({}s)", JOIN_TIMEOUT.as_secs());
            None
        }
    }
}

/// Accept loop.
pub async fn serve(listener: tokio::net::TcpListener, store: SessionStore) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let store = store.clone();
                tokio::spawn(accept(stream, addr, store));
            }
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept error");
            }
        }
    }
}

async fn accept(stream: TcpStream, addr: SocketAddr, store: SessionStore) {
    match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => handle_connection(ws, addr, store).await,
        Err(e) => {
            tracing::warn!(peer = %addr, error = %e, "WS handshake failed");
        }
    }
}
