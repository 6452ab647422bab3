//! Peer-connection backends.
//!
//! A [`RtcBackend`] opens one [`RtcPeer`] per remote participant. The peer
//! owns the underlying RTC connection together with its locally created send
//! channel, and reports asynchronous happenings (state changes, gathered ICE
//! candidates, channel events, inbound text) through an [`RtcEventSink`].

mod loopback;
mod webrtc_backend;

pub use self::loopback::{LoopbackBackend, LoopbackNetwork};
pub use self::webrtc_backend::{IceServer, WebRtcBackend};

use std::sync::Arc;

use async_trait::async_trait;
use rally_common::ParticipantId;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::peer::PeerEvent;
use crate::protocol::{ConnectionState, IceCandidateInit, SessionDescription};

/// Label of the locally created data channel.
pub const SEND_CHANNEL_LABEL: &str = "sendChannel";

/// Factory for peer connections.
#[async_trait]
pub trait RtcBackend: Send + Sync {
    /// Create a peer connection towards `remote` with its send channel.
    async fn open(&self, remote: &ParticipantId, sink: RtcEventSink) -> Result<Arc<dyn RtcPeer>>;
}

/// One RTC peer connection.
#[async_trait]
pub trait RtcPeer: Send + Sync {
    /// Create an offer and apply it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Apply a remote offer, then create and apply the local answer.
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription>;

    /// Apply the remote answer to a previously created offer.
    async fn accept_answer(&self, answer: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()>;

    /// Send a text frame on the send channel.
    async fn send(&self, text: String) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Callback-side happenings of an [`RtcPeer`].
#[derive(Debug, Clone, PartialEq)]
pub enum RtcEvent {
    StateChanged(ConnectionState),
    LocalCandidate(IceCandidateInit),
    SendChannelOpen,
    SendChannelClosed,
    ReceiveChannelAttached,
    Message(String),
}

/// Posts [`RtcEvent`]s back to the owning session peer.
///
/// Holds only a weak reference to the peer's queue; events emitted after the
/// peer is gone are dropped.
#[derive(Clone)]
pub struct RtcEventSink {
    owner: mpsc::WeakUnboundedSender<PeerEvent>,
    remote: ParticipantId,
    connection_id: u64,
}

impl RtcEventSink {
    pub(crate) fn new(
        owner: mpsc::WeakUnboundedSender<PeerEvent>,
        remote: ParticipantId,
        connection_id: u64,
    ) -> Self {
        Self {
            owner,
            remote,
            connection_id,
        }
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    /// Returns `false` when the owner no longer exists.
    pub fn emit(&self, event: RtcEvent) -> bool {
        match self.owner.upgrade() {
            Some(tx) => tx
                .send(PeerEvent::Rtc {
                    remote: self.remote.clone(),
                    connection_id: self.connection_id,
                    event,
                })
                .is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for RtcEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcEventSink")
            .field("remote", &self.remote)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}
