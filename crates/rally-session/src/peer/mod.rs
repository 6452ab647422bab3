//! Per-participant session orchestrator.
//!
//! A [`SessionPeer`] runs as a single task that owns every [`Connection`]
//! of the local participant. Signaling frames, RTC callbacks, heartbeat
//! deadlines and outbound sends all arrive on one queue, so no peer state
//! is shared or locked.

mod handle;
mod negotiate;
mod types;

pub use handle::SessionHandle;
pub(crate) use types::PeerEvent;
pub use types::{IceRouting, Lifecycle, PeerSettings, PeerSnapshot, Role, SessionEvent};

use std::collections::HashMap;
use std::sync::Arc;

use rally_common::ParticipantId;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::connection::{Connection, HeartbeatOutcome};
use crate::protocol::{
    ConnectionState, ConnectionStatus, GameMessage, MessageKind, Negotiation, P2pMessage,
    SignalingMessage,
};
use crate::rtc::{RtcBackend, RtcEvent};
use crate::signaling::{Signaling, SignalingEvent};

pub struct SessionPeer {
    settings: PeerSettings,
    role: Role,
    host_peer_id: Option<ParticipantId>,
    joined: bool,
    connections: HashMap<ParticipantId, Connection>,
    connection_status: ConnectionStatus,
    next_connection_id: u64,
    signaling: Arc<dyn Signaling>,
    backend: Arc<dyn RtcBackend>,
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<SessionEvent>,
    queue: mpsc::WeakUnboundedSender<PeerEvent>,
}

impl SessionPeer {
    /// Start a peer task and connect its signaling channel.
    ///
    /// Lifecycle notifications and locally delivered messages arrive on the
    /// returned receiver.
    pub fn spawn(
        settings: PeerSettings,
        signaling: Arc<dyn Signaling>,
        backend: Arc<dyn RtcBackend>,
        clock: Arc<dyn Clock>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let queue = tx.downgrade();

        let forward = queue.clone();
        signaling.set_message_handler(Arc::new(move |event| {
            if let Some(tx) = forward.upgrade() {
                let _ = tx.send(PeerEvent::Signaling(event));
            }
        }));

        let handle = SessionHandle::new(tx, settings.peer_id.clone());
        let peer = SessionPeer {
            settings,
            role: Role::Client,
            host_peer_id: None,
            joined: false,
            connections: HashMap::new(),
            connection_status: ConnectionStatus::new(),
            next_connection_id: 0,
            signaling: Arc::clone(&signaling),
            backend,
            clock,
            events,
            queue,
        };
        tokio::spawn(peer.run(rx));
        signaling.connect();

        (handle, events_rx)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
        info!(
            session = %self.settings.session_id,
            peer = %self.settings.peer_id,
            "session peer started"
        );

        while let Some(event) = rx.recv().await {
            match event {
                PeerEvent::Signaling(event) => self.on_signaling(event).await,
                PeerEvent::Rtc {
                    remote,
                    connection_id,
                    event,
                } => self.on_rtc(remote, connection_id, event).await,
                PeerEvent::HeartbeatDue {
                    remote,
                    connection_id,
                } => self.on_heartbeat_due(remote, connection_id).await,
                PeerEvent::Send(message) => self.send_message(message).await,
                PeerEvent::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                PeerEvent::Shutdown(done) => {
                    self.shutdown().await;
                    let _ = done.send(());
                    return;
                }
            }
        }

        self.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Signaling
    // -----------------------------------------------------------------------

    async fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected if !self.joined => {
                self.joined = true;
                self.setup().await;
            }
            SignalingEvent::Connected => info!("signaling reconnected"),
            SignalingEvent::Message(value) => match SignalingMessage::from_value(value) {
                Ok(message) => self.negotiate(message).await,
                Err(e) => debug!(error = %e, "unrecognised signaling message dropped"),
            },
            SignalingEvent::Disconnected => info!("signaling disconnected"),
            SignalingEvent::Failed(reason) => {
                error!(reason = %reason, "signaling failed");
                self.emit_lifecycle(None, Lifecycle::Error);
            }
        }
    }

    /// Reset connections, announce ourselves and report `negotiating`.
    async fn setup(&mut self) {
        let stale: Vec<Connection> = self.connections.drain().map(|(_, c)| c).collect();
        for mut connection in stale {
            connection.shutdown().await;
        }
        self.signal(Negotiation::SessionJoin);
        self.emit_lifecycle(None, Lifecycle::Negotiating);
    }

    fn signal(&self, body: Negotiation) {
        let message = SignalingMessage::new(
            self.settings.session_id.clone(),
            self.settings.peer_id.clone(),
            body,
        );
        match message.to_value() {
            Ok(value) => self.signaling.send(value),
            Err(e) => warn!(error = %e, "failed to encode signaling message"),
        }
    }

    // -----------------------------------------------------------------------
    // RTC callbacks
    // -----------------------------------------------------------------------

    async fn on_rtc(&mut self, remote: ParticipantId, connection_id: u64, event: RtcEvent) {
        let is_host = self.role == Role::Host;
        let Some(connection) = self.connections.get_mut(&remote) else {
            trace!(remote = %remote, "event for unknown connection dropped");
            return;
        };
        if connection.id() != connection_id {
            trace!(remote = %remote, connection_id, "event from replaced connection dropped");
            return;
        }

        match event {
            RtcEvent::StateChanged(state) => {
                if connection.state().is_terminal() || !connection.set_state(state) {
                    return;
                }
                if state.is_terminal() {
                    connection.close();
                }
                self.update_connection_state(Some(remote)).await;
            }
            RtcEvent::LocalCandidate(candidate) => {
                self.signal(Negotiation::IceCandidate {
                    candidate,
                    target_peer_id: Some(remote),
                });
            }
            RtcEvent::SendChannelOpen => {
                connection.on_send_channel(true);
                // Bring the new participant up to date.
                if is_host {
                    self.update_connection_state(None).await;
                }
            }
            RtcEvent::SendChannelClosed => connection.on_send_channel(false),
            RtcEvent::ReceiveChannelAttached => connection.on_receive_channel(),
            RtcEvent::Message(text) => self.on_channel_message(remote, text).await,
        }
    }

    async fn on_channel_message(&mut self, from: ParticipantId, text: String) {
        let message: P2pMessage = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(e) => {
                debug!(remote = %from, error = %e, "malformed channel message dropped");
                return;
            }
        };

        match message.kind {
            MessageKind::Heartbeat => {
                let Some(connection) = self.connections.get_mut(&from) else {
                    return;
                };
                let before = connection.state();
                if before.is_terminal() {
                    trace!(remote = %from, "heartbeat on closed connection ignored");
                    return;
                }
                connection.record_heartbeat();
                if connection.state() != before {
                    self.update_connection_state(Some(from)).await;
                }
            }
            MessageKind::Data | MessageKind::ConnectionState => {
                self.received_message(&from, message).await;
            }
        }
    }

    async fn on_heartbeat_due(&mut self, remote: ParticipantId, connection_id: u64) {
        let Some(connection) = self.connections.get_mut(&remote) else {
            return;
        };
        if connection.id() != connection_id {
            return;
        }
        if connection.heartbeat_due().await == HeartbeatOutcome::Expired {
            connection.close();
            self.update_connection_state(Some(remote)).await;
        }
    }

    // -----------------------------------------------------------------------
    // Application messages
    // -----------------------------------------------------------------------

    /// The host delivers locally and fans out to every connection; a client
    /// sends to its single connection.
    async fn send_message(&mut self, payload: GameMessage) {
        let message = match P2pMessage::data(self.settings.peer_id.clone(), &payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "failed to encode payload");
                return;
            }
        };
        if self.role == Role::Host {
            self.emit(SessionEvent::Message(message.clone()));
        }
        for connection in self.connections.values() {
            connection.send_message(&message).await;
        }
    }

    /// The host forwards one hop to everyone but the origin, then every peer
    /// delivers locally.
    async fn received_message(&mut self, from: &ParticipantId, message: P2pMessage) {
        if self.role == Role::Host {
            for (remote, connection) in &self.connections {
                if remote != from {
                    connection.send_message(&message).await;
                }
            }
        }
        self.emit(SessionEvent::Message(message));
    }

    /// Recompute and broadcast the host's status map, then report the
    /// lifecycle of `changed`.
    async fn update_connection_state(&mut self, changed: Option<ParticipantId>) {
        if self.role == Role::Host {
            let mut status: ConnectionStatus = self
                .connections
                .iter()
                .map(|(remote, connection)| (remote.clone(), connection.state()))
                .collect();
            status.insert(self.settings.peer_id.clone(), ConnectionState::Connected);
            self.connection_status = status;

            match P2pMessage::connection_state(
                self.settings.peer_id.clone(),
                &self.connection_status,
            ) {
                Ok(message) => {
                    for connection in self.connections.values() {
                        connection.send_message(&message).await;
                    }
                    self.emit(SessionEvent::Message(message));
                }
                Err(e) => warn!(error = %e, "failed to encode connection status"),
            }
        }

        if let Some(remote) = changed {
            let state = self.connections.get(&remote).map(Connection::state);
            if let Some(lifecycle) = state.and_then(Lifecycle::from_state) {
                self.emit_lifecycle(Some(remote), lifecycle);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("session event receiver dropped");
        }
    }

    fn emit_lifecycle(&self, remote: Option<ParticipantId>, state: Lifecycle) {
        match &remote {
            Some(remote) => info!(remote = %remote, state = ?state, "connection lifecycle"),
            None => info!(state = ?state, "session lifecycle"),
        }
        self.emit(SessionEvent::Lifecycle { remote, state });
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: self.settings.peer_id.clone(),
            role: self.role,
            host_peer_id: self.host_peer_id.clone(),
            connections: self
                .connections
                .iter()
                .map(|(remote, connection)| (remote.clone(), connection.state()))
                .collect(),
            connection_status: self.connection_status.clone(),
        }
    }

    /// Stop every heartbeat, close every RTC peer and leave signaling.
    async fn shutdown(&mut self) {
        let connections: Vec<Connection> = self.connections.drain().map(|(_, c)| c).collect();
        for mut connection in connections {
            connection.shutdown().await;
        }
        self.signaling.disconnect();
        info!(peer = %self.settings.peer_id, "session peer stopped");
    }
}

#[cfg(test)]
mod tests;
