use rally_common::ParticipantId;
use tokio::sync::{mpsc, oneshot};

use super::types::{PeerEvent, PeerSnapshot};
use crate::protocol::GameMessage;

/// Cloneable handle to a running session peer.
///
/// The peer task stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<PeerEvent>,
    peer_id: ParticipantId,
}

impl SessionHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<PeerEvent>, peer_id: ParticipantId) -> Self {
        Self { tx, peer_id }
    }

    pub fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    /// Queue a payload for delivery. Returns `false` if the peer has stopped.
    pub fn send_message(&self, message: GameMessage) -> bool {
        self.tx.send(PeerEvent::Send(message)).is_ok()
    }

    pub async fn snapshot(&self) -> Option<PeerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PeerEvent::Snapshot(reply)).ok()?;
        rx.await.ok()
    }

    /// Close every connection and leave signaling. Waits for the peer task.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(PeerEvent::Shutdown(done)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}
