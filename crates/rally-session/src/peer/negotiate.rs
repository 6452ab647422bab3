//! Offer/answer/ICE handling and host election.

use std::collections::hash_map::Entry;

use rally_common::ParticipantId;
use tracing::{debug, error, info, trace, warn};

use super::types::{IceRouting, Lifecycle, Role};
use super::SessionPeer;
use crate::connection::{Connection, ConnectionParams, Side};
use crate::error::{Result, SessionError};
use crate::protocol::{
    ConnectionState, IceCandidateInit, Negotiation, SdpKind, SessionDescription, SignalingMessage,
};

impl SessionPeer {
    pub(super) async fn negotiate(&mut self, message: SignalingMessage) {
        if message.session_id != self.settings.session_id {
            debug!(session = %message.session_id, "message for another session ignored");
            return;
        }

        let from = message.peer_id;
        trace!(from = %from, state = message.body.state_name(), "negotiate");
        match message.body {
            Negotiation::SessionJoin => {}
            Negotiation::SessionReady { host_peer_id } => {
                self.on_session_ready(from, host_peer_id).await;
            }
            Negotiation::SdpOffer {
                host_peer_id,
                offer,
                target_peer_id,
            } => self.on_offer(host_peer_id, offer, target_peer_id).await,
            Negotiation::SdpAnswer {
                host_peer_id,
                answer,
            } => self.on_answer(from, host_peer_id, answer).await,
            Negotiation::IceCandidate {
                candidate,
                target_peer_id,
            } => self.on_candidate(from, candidate, target_peer_id).await,
            Negotiation::Error { message } => {
                warn!(
                    from = %from,
                    message = message.as_deref().unwrap_or("unspecified"),
                    "signaling error reported"
                );
            }
        }
    }

    // -- host election ------------------------------------------------------

    async fn on_session_ready(&mut self, announced: ParticipantId, host: ParticipantId) {
        match &self.host_peer_id {
            Some(current) if *current != host => {
                warn!(current = %current, announced = %host, "host is fixed, announcement ignored");
                return;
            }
            Some(_) => {}
            None => {
                info!(host = %host, "session host elected");
                self.host_peer_id = Some(host.clone());
            }
        }

        if host == self.settings.peer_id {
            self.role = Role::Host;
        }

        if announced == self.settings.peer_id {
            self.update_connection_state(None).await;
            return;
        }

        if self.role == Role::Host {
            self.offer_to(announced).await;
        }
    }

    // -- offer / answer -----------------------------------------------------

    async fn offer_to(&mut self, remote: ParticipantId) {
        match self.try_offer(&remote).await {
            Ok(()) => self.update_connection_state(Some(remote)).await,
            Err(e) => self.negotiation_failed(&remote, e).await,
        }
    }

    async fn try_offer(&mut self, remote: &ParticipantId) -> Result<()> {
        let connection = self.open_connection(remote, Side::Offerer).await?;
        let offer = connection.create_offer().await?.to_wire()?;
        self.signal(Negotiation::SdpOffer {
            host_peer_id: self.settings.peer_id.clone(),
            offer,
            target_peer_id: Some(remote.clone()),
        });
        Ok(())
    }

    async fn on_offer(
        &mut self,
        host: ParticipantId,
        offer: String,
        target: Option<ParticipantId>,
    ) {
        if host == self.settings.peer_id {
            return;
        }
        if target.as_ref().is_some_and(|t| *t != self.settings.peer_id) {
            trace!(host = %host, "offer for another participant ignored");
            return;
        }
        if self.role == Role::Host {
            debug!(from = %host, "host does not answer offers");
            return;
        }
        if target.is_none() {
            if let Some(existing) = self.connections.get(&host) {
                if !existing.state().is_terminal() {
                    debug!(host = %host, "connection to host already live, offer ignored");
                    return;
                }
            }
        }

        match self.try_answer(&host, &offer).await {
            Ok(()) => self.update_connection_state(Some(host)).await,
            Err(e) => self.negotiation_failed(&host, e).await,
        }
    }

    async fn try_answer(&mut self, host: &ParticipantId, offer: &str) -> Result<()> {
        let offer = SessionDescription::from_wire(offer, SdpKind::Offer)?;
        let connection = self.open_connection(host, Side::Answerer).await?;
        let answer = connection.accept_offer(offer).await?.to_wire()?;
        self.signal(Negotiation::SdpAnswer {
            host_peer_id: host.clone(),
            answer,
        });
        Ok(())
    }

    async fn on_answer(&mut self, from: ParticipantId, host: ParticipantId, answer: String) {
        if self.role != Role::Host || host != self.settings.peer_id {
            return;
        }
        let Some(connection) = self.connections.get_mut(&from) else {
            warn!(from = %from, "answer without a pending offer");
            return;
        };

        let applied = match SessionDescription::from_wire(&answer, SdpKind::Answer) {
            Ok(answer) => connection.accept_answer(answer).await,
            Err(e) => Err(e),
        };
        match applied {
            Ok(()) => self.update_connection_state(Some(from)).await,
            Err(e) => self.negotiation_failed(&from, e).await,
        }
    }

    // -- ICE ----------------------------------------------------------------

    async fn on_candidate(
        &mut self,
        from: ParticipantId,
        candidate: IceCandidateInit,
        target: Option<ParticipantId>,
    ) {
        if from == self.settings.peer_id {
            return;
        }

        match self.settings.ice_routing {
            IceRouting::Broadcast => {
                for connection in self.connections.values_mut() {
                    if let Err(e) = connection.add_ice_candidate(candidate.clone()).await {
                        warn!(remote = %connection.remote(), error = %e, "ICE candidate rejected");
                    }
                }
            }
            IceRouting::Targeted => {
                if target.as_ref().is_some_and(|t| *t != self.settings.peer_id) {
                    return;
                }
                match self.connections.get_mut(&from) {
                    Some(connection) => {
                        if let Err(e) = connection.add_ice_candidate(candidate).await {
                            warn!(remote = %from, error = %e, "ICE candidate rejected");
                        }
                    }
                    None => debug!(from = %from, "candidate without a connection dropped"),
                }
            }
        }
    }

    // -- connections --------------------------------------------------------

    /// Open a fresh connection to `remote`, replacing any existing one.
    async fn open_connection(
        &mut self,
        remote: &ParticipantId,
        side: Side,
    ) -> Result<&mut Connection> {
        if let Some(mut previous) = self.connections.remove(remote) {
            debug!(remote = %remote, "replacing connection");
            previous.shutdown().await;
        }

        self.next_connection_id += 1;
        let connection = Connection::open(
            self.backend.as_ref(),
            ConnectionParams {
                id: self.next_connection_id,
                local: self.settings.peer_id.clone(),
                remote: remote.clone(),
                side,
                heartbeat: self.settings.heartbeat,
                owner: self.queue.clone(),
                clock: self.clock.clone(),
            },
        )
        .await?;

        Ok(match self.connections.entry(remote.clone()) {
            Entry::Occupied(mut slot) => {
                slot.insert(connection);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(connection),
        })
    }

    /// Mark only the affected connection failed; the session carries on.
    async fn negotiation_failed(&mut self, remote: &ParticipantId, err: SessionError) {
        error!(remote = %remote, error = %err, "negotiation failed");
        match self.connections.get_mut(remote) {
            Some(connection) => {
                connection.set_state(ConnectionState::Failed);
                connection.shutdown().await;
                self.update_connection_state(Some(remote.clone())).await;
            }
            None => self.emit_lifecycle(Some(remote.clone()), Lifecycle::Error),
        }
    }
}
