//! [`RtcBackend`] over the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use rally_common::ParticipantId;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{RtcBackend, RtcEvent, RtcEventSink, RtcPeer, SEND_CHANNEL_LABEL};
use crate::error::{Result, SessionError};
use crate::protocol::{ConnectionState, IceCandidateInit, SessionDescription};

/// STUN or TURN server handed to ICE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

fn rtc_err(context: &str) -> impl Fn(webrtc::Error) -> SessionError + '_ {
    move |e| SessionError::Rtc(format!("{context}: {e}"))
}

/// Opens real peer connections with data channels.
pub struct WebRtcBackend {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcBackend {
    pub fn new(ice_servers: &[IceServer]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(rtc_err("failed to register codecs"))?;

        let registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(rtc_err("failed to register interceptors"))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: vec![server.url.clone()],
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Ok(Self { api, ice_servers })
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

fn to_candidate_init(candidate: &RTCIceCandidate) -> Option<IceCandidateInit> {
    let json = candidate.to_json().ok()?;
    Some(IceCandidateInit {
        candidate: json.candidate,
        sdp_mid: json.sdp_mid,
        sdp_mline_index: json.sdp_mline_index,
        username_fragment: json.username_fragment,
    })
}

fn text_of(msg: &DataChannelMessage) -> Option<String> {
    String::from_utf8(msg.data.to_vec()).ok()
}

#[async_trait]
impl RtcBackend for WebRtcBackend {
    async fn open(&self, remote: &ParticipantId, sink: RtcEventSink) -> Result<Arc<dyn RtcPeer>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(rtc_err("failed to create peer connection"))?,
        );

        let state_sink = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            if let Some(state) = map_state(s) {
                state_sink.emit(RtcEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        let ice_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(init) = candidate.as_ref().and_then(to_candidate_init) {
                ice_sink.emit(RtcEvent::LocalCandidate(init));
            }
            Box::pin(async {})
        }));

        // Remote-initiated receive channel.
        let dc_sink = sink.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = dc_sink.clone();
            Box::pin(async move {
                debug!(remote = %sink.remote(), label = %dc.label(), "receive channel attached");
                let msg_sink = sink.clone();
                dc.on_message(Box::new(move |msg: DataChannelMessage| {
                    if let Some(text) = text_of(&msg) {
                        msg_sink.emit(RtcEvent::Message(text));
                    }
                    Box::pin(async {})
                }));
                sink.emit(RtcEvent::ReceiveChannelAttached);
            })
        }));

        let send_channel = pc
            .create_data_channel(SEND_CHANNEL_LABEL, None)
            .await
            .map_err(rtc_err("failed to create data channel"))?;

        let open_sink = sink.clone();
        send_channel.on_open(Box::new(move || {
            open_sink.emit(RtcEvent::SendChannelOpen);
            Box::pin(async {})
        }));

        let close_sink = sink.clone();
        send_channel.on_close(Box::new(move || {
            close_sink.emit(RtcEvent::SendChannelClosed);
            Box::pin(async {})
        }));

        info!(remote = %remote, "peer connection created");

        Ok(Arc::new(WebRtcPeer { pc, send_channel }))
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    send_channel: Arc<RTCDataChannel>,
}

impl WebRtcPeer {
    async fn local_sdp(&self) -> Result<String> {
        self.pc
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| SessionError::Negotiation("no local description".into()))
    }
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(rtc_err("failed to create offer"))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(rtc_err("failed to set local description"))?;

        Ok(SessionDescription::offer(self.local_sdp().await?))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let offer =
            RTCSessionDescription::offer(offer.sdp).map_err(rtc_err("failed to parse offer"))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(rtc_err("failed to set remote description"))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(rtc_err("failed to create answer"))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(rtc_err("failed to set local description"))?;

        Ok(SessionDescription::answer(self.local_sdp().await?))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        let answer =
            RTCSessionDescription::answer(answer.sdp).map_err(rtc_err("failed to parse answer"))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(rtc_err("failed to set remote description"))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(rtc_err("failed to add ICE candidate"))
    }

    async fn send(&self, text: String) -> Result<()> {
        self.send_channel
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(rtc_err("failed to send on data channel"))
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.send_channel.close().await {
            warn!(error = %e, "failed to close send channel");
        }
        self.pc
            .close()
            .await
            .map_err(rtc_err("failed to close peer connection"))
    }
}
