//! One negotiated data-channel connection to a single remote participant.
//!
//! A `Connection` is owned by its [`SessionPeer`](crate::peer::SessionPeer)
//! and mutated only from the peer's task. It keeps a weak handle to the
//! peer's event queue, used to post heartbeat deadlines.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rally_common::ParticipantId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::error::{Result, SessionError};
use crate::peer::PeerEvent;
use crate::protocol::{ConnectionState, IceCandidateInit, P2pMessage, SessionDescription};
use crate::rtc::{RtcBackend, RtcEventSink, RtcPeer};

// ---------------------------------------------------------------------------
// Heartbeat configuration
// ---------------------------------------------------------------------------

/// Liveness probing for a connection's data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    interval_ms: u64,
    idle_timeout_ms: u64,
}

impl HeartbeatConfig {
    /// `idle_timeout_ms` must be strictly greater than `interval_ms`.
    pub fn new(interval_ms: u64, idle_timeout_ms: u64) -> Result<Self> {
        if interval_ms == 0 {
            return Err(SessionError::Config(
                "heartbeat interval must be positive".into(),
            ));
        }
        if idle_timeout_ms <= interval_ms {
            return Err(SessionError::Config(format!(
                "heartbeat idle timeout {idle_timeout_ms}ms must exceed interval {interval_ms}ms"
            )));
        }
        Ok(Self {
            interval_ms,
            idle_timeout_ms,
        })
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn idle_timeout_ms(&self) -> u64 {
        self.idle_timeout_ms
    }
}

/// Result of handling a heartbeat deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// No heartbeat configured.
    Disabled,
    /// A ping was sent and the next deadline scheduled.
    Pinged,
    /// The remote went silent; the connection is now `Disconnected`.
    Expired,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Which side of the offer/answer exchange this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Offerer,
    Answerer,
}

pub(crate) struct ConnectionParams {
    pub(crate) id: u64,
    pub(crate) local: ParticipantId,
    pub(crate) remote: ParticipantId,
    pub(crate) side: Side,
    pub(crate) heartbeat: Option<HeartbeatConfig>,
    pub(crate) owner: mpsc::WeakUnboundedSender<PeerEvent>,
    pub(crate) clock: Arc<dyn Clock>,
}

pub struct Connection {
    id: u64,
    local: ParticipantId,
    remote: ParticipantId,
    side: Side,
    state: ConnectionState,
    rtc: Arc<dyn RtcPeer>,
    send_open: bool,
    receive_attached: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidateInit>,
    seen_candidates: HashSet<String>,
    heartbeat: Option<HeartbeatConfig>,
    last_heartbeat: Option<u64>,
    heartbeat_task: Option<JoinHandle<()>>,
    owner: mpsc::WeakUnboundedSender<PeerEvent>,
    clock: Arc<dyn Clock>,
}

impl Connection {
    /// Create the RTC peer and its send channel.
    pub(crate) async fn open(backend: &dyn RtcBackend, params: ConnectionParams) -> Result<Self> {
        let sink = RtcEventSink::new(params.owner.clone(), params.remote.clone(), params.id);
        let rtc = backend.open(&params.remote, sink).await?;

        debug!(
            local = %params.local,
            remote = %params.remote,
            connection_id = params.id,
            side = ?params.side,
            "connection opened"
        );

        Ok(Self {
            id: params.id,
            local: params.local,
            remote: params.remote,
            side: params.side,
            state: ConnectionState::New,
            rtc,
            send_open: false,
            receive_attached: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
            heartbeat: params.heartbeat,
            last_heartbeat: None,
            heartbeat_task: None,
            owner: params.owner,
            clock: params.clock,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_send_open(&self) -> bool {
        self.send_open
    }

    pub fn is_receive_attached(&self) -> bool {
        self.receive_attached
    }

    pub fn last_heartbeat(&self) -> Option<u64> {
        self.last_heartbeat
    }

    /// Returns `true` if the state changed.
    pub(crate) fn set_state(&mut self, state: ConnectionState) -> bool {
        if self.state == state {
            return false;
        }
        debug!(remote = %self.remote, from = %self.state, to = %state, "connection state");
        self.state = state;
        true
    }

    // -- negotiation --------------------------------------------------------

    pub(crate) async fn create_offer(&mut self) -> Result<SessionDescription> {
        self.set_state(ConnectionState::Negotiating);
        self.rtc.create_offer().await
    }

    pub(crate) async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        self.set_state(ConnectionState::Negotiating);
        let answer = self.rtc.accept_offer(offer).await?;
        self.remote_description_applied().await;
        Ok(answer)
    }

    pub(crate) async fn accept_answer(&mut self, answer: SessionDescription) -> Result<()> {
        self.rtc.accept_answer(answer).await?;
        self.remote_description_applied().await;
        Ok(())
    }

    /// Apply a remote candidate, or queue it until the remote description
    /// is set. A candidate already seen is ignored.
    pub(crate) async fn add_ice_candidate(&mut self, candidate: IceCandidateInit) -> Result<()> {
        if !self.seen_candidates.insert(candidate.candidate.clone()) {
            trace!(remote = %self.remote, "duplicate ICE candidate ignored");
            return Ok(());
        }
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.rtc.add_ice_candidate(candidate).await
    }

    async fn remote_description_applied(&mut self) {
        self.remote_description_set = true;
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.rtc.add_ice_candidate(candidate).await {
                warn!(remote = %self.remote, error = %e, "queued ICE candidate rejected");
            }
        }
    }

    // -- channels -----------------------------------------------------------

    pub(crate) fn on_send_channel(&mut self, open: bool) {
        self.send_open = open;
        if open {
            if self.heartbeat.is_some() {
                self.schedule_heartbeat();
            }
        } else {
            self.stop_heartbeat();
        }
    }

    pub(crate) fn on_receive_channel(&mut self) {
        self.receive_attached = true;
    }

    /// Fire-and-forget; dropped when the send channel is not open.
    pub(crate) async fn send_message(&self, message: &P2pMessage) {
        if !self.send_open {
            trace!(remote = %self.remote, "send channel closed, message dropped");
            return;
        }
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode message");
                return;
            }
        };
        if let Err(e) = self.rtc.send(text).await {
            debug!(remote = %self.remote, error = %e, "send failed");
        }
    }

    // -- heartbeat ----------------------------------------------------------

    /// A heartbeat arrived from the remote.
    pub(crate) fn record_heartbeat(&mut self) {
        self.set_state(ConnectionState::Connected);
        self.last_heartbeat = Some(self.clock.now_millis());
    }

    /// Handle an expired heartbeat timer.
    pub(crate) async fn heartbeat_due(&mut self) -> HeartbeatOutcome {
        self.stop_heartbeat();
        let Some(config) = self.heartbeat else {
            return HeartbeatOutcome::Disabled;
        };

        let now = self.clock.now_millis();
        if let Some(last) = self.last_heartbeat {
            if now.saturating_sub(last) > config.idle_timeout_ms {
                info!(
                    remote = %self.remote,
                    silent_ms = now.saturating_sub(last),
                    "heartbeat timed out"
                );
                self.set_state(ConnectionState::Disconnected);
                return HeartbeatOutcome::Expired;
            }
        }

        self.send_message(&P2pMessage::heartbeat(self.local.clone()))
            .await;
        self.schedule_heartbeat();
        HeartbeatOutcome::Pinged
    }

    fn schedule_heartbeat(&mut self) {
        let Some(config) = self.heartbeat else {
            return;
        };
        self.stop_heartbeat();

        let owner = self.owner.clone();
        let remote = self.remote.clone();
        let connection_id = self.id;
        let delay = Duration::from_millis(config.interval_ms);
        self.heartbeat_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = owner.upgrade() {
                let _ = tx.send(PeerEvent::HeartbeatDue {
                    remote,
                    connection_id,
                });
            }
        }));
    }

    pub(crate) fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
    }

    pub(crate) fn heartbeat_scheduled(&self) -> bool {
        self.heartbeat_task.is_some()
    }

    // -- teardown -----------------------------------------------------------

    /// Stop local timers. The RTC peer stays up.
    pub(crate) fn close(&mut self) {
        self.stop_heartbeat();
    }

    /// Stop timers and close the RTC peer.
    pub(crate) async fn shutdown(&mut self) {
        self.close();
        self.send_open = false;
        if let Err(e) = self.rtc.close().await {
            debug!(remote = %self.remote, error = %e, "close failed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("side", &self.side)
            .field("state", &self.state)
            .field("send_open", &self.send_open)
            .field("last_heartbeat", &self.last_heartbeat)
            .finish()
    }
}
