//! In-process RTC fabric.
//!
//! Peers opened from the same [`LoopbackNetwork`] find each other through
//! tokens embedded in their descriptions (`"loopback <token>"`) and ICE
//! candidates (`"candidate:loopback <token>"`). A side reports itself
//! connected once it holds both the remote description and the matching
//! remote candidate. Links can be severed per direction and negotiation can
//! be made to fail for a given pair.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rally_common::ParticipantId;
use tracing::trace;

use super::{RtcBackend, RtcEvent, RtcEventSink, RtcPeer};
use crate::error::{Result, SessionError};
use crate::protocol::{ConnectionState, IceCandidateInit, SessionDescription};

const SDP_PREFIX: &str = "loopback ";
const CANDIDATE_PREFIX: &str = "candidate:loopback ";

type Link = (ParticipantId, ParticipantId);

struct Endpoint {
    token: u64,
    sink: RtcEventSink,
    remote_token: Option<u64>,
    remote_candidate: bool,
    connected: bool,
}

#[derive(Default)]
struct Fabric {
    endpoints: HashMap<Link, Endpoint>,
    severed: HashSet<Link>,
    failing: HashSet<Link>,
    next_token: u64,
}

impl Fabric {
    /// The endpoint for `link`, provided it still belongs to `token`.
    fn endpoint_mut(&mut self, link: &Link, token: u64) -> Result<&mut Endpoint> {
        match self.endpoints.get_mut(link) {
            Some(endpoint) if endpoint.token == token => Ok(endpoint),
            _ => Err(SessionError::Rtc("peer connection closed".into())),
        }
    }

    fn check_negotiation(&self, link: &Link) -> Result<()> {
        if self.failing.contains(link) {
            return Err(SessionError::Rtc(format!(
                "negotiation between {} and {} failed",
                link.0, link.1
            )));
        }
        Ok(())
    }

    /// Events to emit if `link` just became connected.
    fn try_connect(&mut self, link: &Link) -> Option<RtcEventSink> {
        let endpoint = self.endpoints.get_mut(link)?;
        if endpoint.connected || endpoint.remote_token.is_none() || !endpoint.remote_candidate {
            return None;
        }
        endpoint.connected = true;
        Some(endpoint.sink.clone())
    }
}

fn lock(fabric: &Mutex<Fabric>) -> MutexGuard<'_, Fabric> {
    fabric.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_token(text: &str, prefix: &str) -> Option<u64> {
    text.strip_prefix(prefix)?.trim().parse().ok()
}

fn announce_connected(sink: &RtcEventSink) {
    sink.emit(RtcEvent::StateChanged(ConnectionState::Connecting));
    sink.emit(RtcEvent::StateChanged(ConnectionState::Connected));
    sink.emit(RtcEvent::SendChannelOpen);
    sink.emit(RtcEvent::ReceiveChannelAttached);
}

/// Shared fabric; cheap to clone.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    fabric: Arc<Mutex<Fabric>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(&self, local: impl Into<ParticipantId>) -> LoopbackBackend {
        LoopbackBackend::new(self.clone(), local.into())
    }

    /// Drop every frame sent from `from` to `to`.
    pub fn sever(&self, from: &ParticipantId, to: &ParticipantId) {
        lock(&self.fabric).severed.insert((from.clone(), to.clone()));
    }

    pub fn heal(&self, from: &ParticipantId, to: &ParticipantId) {
        lock(&self.fabric).severed.remove(&(from.clone(), to.clone()));
    }

    /// Make description handling fail for peers opened by `local` towards
    /// `remote`.
    pub fn fail_negotiation(&self, local: &ParticipantId, remote: &ParticipantId) {
        lock(&self.fabric).failing.insert((local.clone(), remote.clone()));
    }

    pub fn is_connected(&self, local: &ParticipantId, remote: &ParticipantId) -> bool {
        lock(&self.fabric)
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .is_some_and(|endpoint| endpoint.connected)
    }
}

/// [`RtcBackend`] for one local participant on a [`LoopbackNetwork`].
pub struct LoopbackBackend {
    network: LoopbackNetwork,
    local: ParticipantId,
}

impl LoopbackBackend {
    pub fn new(network: LoopbackNetwork, local: ParticipantId) -> Self {
        Self { network, local }
    }
}

#[async_trait]
impl RtcBackend for LoopbackBackend {
    async fn open(&self, remote: &ParticipantId, sink: RtcEventSink) -> Result<Arc<dyn RtcPeer>> {
        let link = (self.local.clone(), remote.clone());
        let mut fabric = lock(&self.network.fabric);
        fabric.next_token += 1;
        let token = fabric.next_token;
        fabric.endpoints.insert(
            link.clone(),
            Endpoint {
                token,
                sink,
                remote_token: None,
                remote_candidate: false,
                connected: false,
            },
        );
        trace!(local = %link.0, remote = %link.1, token, "loopback peer opened");
        Ok(Arc::new(LoopbackPeer {
            fabric: Arc::clone(&self.network.fabric),
            link,
            token,
        }))
    }
}

struct LoopbackPeer {
    fabric: Arc<Mutex<Fabric>>,
    link: Link,
    token: u64,
}

impl LoopbackPeer {
    fn local_candidate(&self) -> IceCandidateInit {
        IceCandidateInit::new(format!("{CANDIDATE_PREFIX}{}", self.token))
    }

    fn local_sdp(&self) -> String {
        format!("{SDP_PREFIX}{}", self.token)
    }

    /// Record the remote description; returns the sink to announce on if the
    /// link just came up.
    fn apply_remote(&self, desc: &SessionDescription) -> Result<Option<RtcEventSink>> {
        let remote_token = parse_token(&desc.sdp, SDP_PREFIX)
            .ok_or_else(|| SessionError::Rtc(format!("malformed description: {}", desc.sdp)))?;
        let mut fabric = lock(&self.fabric);
        fabric.check_negotiation(&self.link)?;
        fabric.endpoint_mut(&self.link, self.token)?.remote_token = Some(remote_token);
        Ok(fabric.try_connect(&self.link))
    }

    fn emit_local_candidate(&self) -> Result<()> {
        let sink = lock(&self.fabric)
            .endpoint_mut(&self.link, self.token)?
            .sink
            .clone();
        sink.emit(RtcEvent::LocalCandidate(self.local_candidate()));
        Ok(())
    }
}

#[async_trait]
impl RtcPeer for LoopbackPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        {
            let mut fabric = lock(&self.fabric);
            fabric.check_negotiation(&self.link)?;
            fabric.endpoint_mut(&self.link, self.token)?;
        }
        self.emit_local_candidate()?;
        Ok(SessionDescription::offer(self.local_sdp()))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let connected = self.apply_remote(&offer)?;
        self.emit_local_candidate()?;
        if let Some(sink) = connected {
            announce_connected(&sink);
        }
        Ok(SessionDescription::answer(self.local_sdp()))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        if let Some(sink) = self.apply_remote(&answer)? {
            announce_connected(&sink);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        let token = parse_token(&candidate.candidate, CANDIDATE_PREFIX).ok_or_else(|| {
            SessionError::Rtc(format!("malformed candidate: {}", candidate.candidate))
        })?;
        let connected = {
            let mut fabric = lock(&self.fabric);
            let endpoint = fabric.endpoint_mut(&self.link, self.token)?;
            if endpoint.remote_token != Some(token) {
                trace!(local = %self.link.0, token, "foreign candidate ignored");
                return Ok(());
            }
            endpoint.remote_candidate = true;
            fabric.try_connect(&self.link)
        };
        if let Some(sink) = connected {
            announce_connected(&sink);
        }
        Ok(())
    }

    async fn send(&self, text: String) -> Result<()> {
        let target = {
            let mut fabric = lock(&self.fabric);
            let endpoint = fabric.endpoint_mut(&self.link, self.token)?;
            if !endpoint.connected {
                return Err(SessionError::Rtc("send channel not open".into()));
            }
            let remote_token = endpoint.remote_token;
            if fabric.severed.contains(&self.link) {
                trace!(from = %self.link.0, to = %self.link.1, "frame dropped on severed link");
                return Ok(());
            }
            let reverse = (self.link.1.clone(), self.link.0.clone());
            fabric
                .endpoints
                .get(&reverse)
                .filter(|remote| Some(remote.token) == remote_token)
                .map(|remote| remote.sink.clone())
        };
        if let Some(sink) = target {
            sink.emit(RtcEvent::Message(text));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let (own, remote) = {
            let mut fabric = lock(&self.fabric);
            let Some(endpoint) = fabric.endpoints.get(&self.link) else {
                return Ok(());
            };
            if endpoint.token != self.token {
                return Ok(());
            }
            let Some(endpoint) = fabric.endpoints.remove(&self.link) else {
                return Ok(());
            };
            let reverse = (self.link.1.clone(), self.link.0.clone());
            let remote = fabric
                .endpoints
                .get(&reverse)
                .filter(|remote| Some(remote.token) == endpoint.remote_token && remote.connected)
                .map(|remote| remote.sink.clone());
            (endpoint.sink, remote)
        };
        own.emit(RtcEvent::StateChanged(ConnectionState::Closed));
        if let Some(remote) = remote {
            remote.emit(RtcEvent::StateChanged(ConnectionState::Disconnected));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerEvent;
    use tokio::sync::mpsc;

    struct Side {
        peer: Arc<dyn RtcPeer>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        _tx: mpsc::UnboundedSender<PeerEvent>,
    }

    impl Side {
        fn drain(&mut self) -> Vec<RtcEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let PeerEvent::Rtc { event, .. } = event {
                    out.push(event);
                }
            }
            out
        }
    }

    async fn open(network: &LoopbackNetwork, local: &str, remote: &str) -> Side {
        let (tx, events) = mpsc::unbounded_channel();
        let sink = RtcEventSink::new(tx.downgrade(), remote.into(), 1);
        let peer = network
            .backend(local)
            .open(&remote.into(), sink)
            .await
            .unwrap();
        Side {
            peer,
            events,
            _tx: tx,
        }
    }

    fn candidate_of(events: &[RtcEvent]) -> IceCandidateInit {
        events
            .iter()
            .find_map(|e| match e {
                RtcEvent::LocalCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .expect("no local candidate")
    }

    async fn connect_pair(network: &LoopbackNetwork) -> (Side, Side) {
        let mut a = open(network, "p1", "p2").await;
        let mut b = open(network, "p2", "p1").await;
        let offer = a.peer.create_offer().await.unwrap();
        let answer = b.peer.accept_offer(offer).await.unwrap();
        a.peer.accept_answer(answer).await.unwrap();
        let a_candidate = candidate_of(&a.drain());
        let b_candidate = candidate_of(&b.drain());
        a.peer.add_ice_candidate(b_candidate).await.unwrap();
        b.peer.add_ice_candidate(a_candidate).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn offer_answer_and_candidates_connect_both_sides() {
        let network = LoopbackNetwork::new();
        let (mut a, mut b) = connect_pair(&network).await;

        let expected = vec![
            RtcEvent::StateChanged(ConnectionState::Connecting),
            RtcEvent::StateChanged(ConnectionState::Connected),
            RtcEvent::SendChannelOpen,
            RtcEvent::ReceiveChannelAttached,
        ];
        assert_eq!(a.drain(), expected);
        assert_eq!(b.drain(), expected);
        assert!(network.is_connected(&"p1".into(), &"p2".into()));
    }

    #[tokio::test]
    async fn send_delivers_unless_severed() {
        let network = LoopbackNetwork::new();
        let (a, mut b) = connect_pair(&network).await;
        b.drain();

        a.peer.send("hello".into()).await.unwrap();
        assert_eq!(b.drain(), vec![RtcEvent::Message("hello".into())]);

        network.sever(&"p1".into(), &"p2".into());
        a.peer.send("lost".into()).await.unwrap();
        assert!(b.drain().is_empty());

        network.heal(&"p1".into(), &"p2".into());
        a.peer.send("again".into()).await.unwrap();
        assert_eq!(b.drain(), vec![RtcEvent::Message("again".into())]);
    }

    #[tokio::test]
    async fn foreign_and_repeated_candidates_are_harmless() {
        let network = LoopbackNetwork::new();
        let (a, mut b) = connect_pair(&network).await;
        b.drain();

        a.peer
            .add_ice_candidate(IceCandidateInit::new("candidate:loopback 999"))
            .await
            .unwrap();
        assert!(network.is_connected(&"p1".into(), &"p2".into()));
        assert!(b.drain().is_empty());
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let network = LoopbackNetwork::new();
        let a = open(&network, "p1", "p2").await;
        assert!(a.peer.send("early".into()).await.is_err());
    }

    #[tokio::test]
    async fn failing_pair_rejects_descriptions() {
        let network = LoopbackNetwork::new();
        network.fail_negotiation(&"p2".into(), &"p1".into());
        let a = open(&network, "p1", "p2").await;
        let b = open(&network, "p2", "p1").await;

        let offer = a.peer.create_offer().await.unwrap();
        let err = b.peer.accept_offer(offer).await.unwrap_err();
        assert!(matches!(err, SessionError::Rtc(_)));
    }

    #[tokio::test]
    async fn malformed_description_is_an_error() {
        let network = LoopbackNetwork::new();
        let b = open(&network, "p2", "p1").await;
        let err = b
            .peer
            .accept_offer(SessionDescription::offer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Rtc(_)));
    }

    #[tokio::test]
    async fn close_notifies_both_sides() {
        let network = LoopbackNetwork::new();
        let (mut a, mut b) = connect_pair(&network).await;
        a.drain();
        b.drain();

        a.peer.close().await.unwrap();
        assert_eq!(
            a.drain(),
            vec![RtcEvent::StateChanged(ConnectionState::Closed)]
        );
        assert_eq!(
            b.drain(),
            vec![RtcEvent::StateChanged(ConnectionState::Disconnected)]
        );
        assert!(a.peer.send("gone".into()).await.is_err());
    }
}
