//! Start-up wiring: turn the loaded config into exactly one transport.

use std::sync::Arc;
use std::time::Duration;

use rally_common::{ParticipantId, RallyError, SessionId};
use rally_config::schema::{HeartbeatSettings, IceConfig, TransportKind};
use rally_config::RallyConfig;
use rally_session::{
    DevRelayTransport, DirectTransport, HeartbeatConfig, IceRouting, IceServer, MonotonicClock,
    PeerSettings, RelayOptions, RelayTransport, SignalingChannel, SignalingOptions, Transport,
    WebRtcBackend,
};

/// Who we are and where we are going.
#[derive(Debug, Clone)]
pub struct Target {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub kind: TransportKind,
}

pub fn heartbeat_config(settings: &HeartbeatSettings) -> Result<Option<HeartbeatConfig>, RallyError> {
    if !settings.enabled {
        return Ok(None);
    }
    HeartbeatConfig::new(settings.interval_ms, settings.idle_timeout_ms)
        .map(Some)
        .map_err(|e| RallyError::Session(e.to_string()))
}

pub fn ice_servers(config: &IceConfig) -> Vec<IceServer> {
    config
        .stun_servers
        .iter()
        .map(IceServer::stun)
        .chain(
            config
                .turn_servers
                .iter()
                .map(|t| IceServer::turn(&t.url, &t.username, &t.credential)),
        )
        .collect()
}

pub fn ice_routing(routing: rally_config::schema::IceRouting) -> IceRouting {
    match routing {
        rally_config::schema::IceRouting::Broadcast => IceRouting::Broadcast,
        rally_config::schema::IceRouting::Targeted => IceRouting::Targeted,
    }
}

pub fn signaling_options(config: &RallyConfig, target: &Target) -> SignalingOptions {
    let mut options = SignalingOptions::new(
        config.signaling.url.clone(),
        target.session_id.clone(),
        target.participant_id.clone(),
    );
    options.max_reconnect_attempts = config.signaling.max_reconnect_attempts;
    options.reconnect_base_delay = Duration::from_millis(config.signaling.reconnect_base_delay_ms);
    options.connect_timeout = Duration::from_secs(config.signaling.connect_timeout_secs);
    options
}

pub fn relay_options(config: &RallyConfig, target: &Target) -> RelayOptions {
    let mut options = RelayOptions::new(
        config.relay.url.clone(),
        target.session_id.clone(),
        target.participant_id.clone(),
    );
    options.channel = config.relay.channel.clone();
    options.reconnect_delay_secs = config.relay.reconnect_delay_secs;
    options.max_reconnect_delay_secs = config.relay.max_reconnect_delay_secs;
    options
}

pub fn peer_settings(config: &RallyConfig, target: &Target) -> Result<PeerSettings, RallyError> {
    let mut settings = PeerSettings::new(target.session_id.clone(), target.participant_id.clone())
        .with_ice_routing(ice_routing(config.session.ice_routing));
    if let Some(heartbeat) = heartbeat_config(&config.heartbeat)? {
        settings = settings.with_heartbeat(heartbeat);
    }
    Ok(settings)
}

/// Build the transport selected by `target.kind`. Must run inside a Tokio
/// runtime; every variant spawns its background tasks here.
pub fn build_transport(config: &RallyConfig, target: &Target) -> Result<Arc<dyn Transport>, RallyError> {
    let transport: Arc<dyn Transport> = match target.kind {
        TransportKind::Direct => {
            let backend = WebRtcBackend::new(&ice_servers(&config.ice))
                .map_err(|e| RallyError::Network(e.to_string()))?;
            Arc::new(DirectTransport::start(
                peer_settings(config, target)?,
                Arc::new(SignalingChannel::new(signaling_options(config, target))),
                Arc::new(backend),
                Arc::new(MonotonicClock::new()),
            ))
        }
        TransportKind::Relay => Arc::new(RelayTransport::connect(relay_options(config, target))),
        TransportKind::DevRelay => Arc::new(DevRelayTransport::start(
            target.participant_id.clone(),
            Arc::new(SignalingChannel::new(signaling_options(config, target))),
        )),
    };
    tracing::info!(
        session = %target.session_id,
        participant = %target.participant_id,
        transport = ?target.kind,
        "transport started"
    );
    Ok(transport)
}
