//! Session, heartbeat and logging configuration types.

use serde::{Deserialize, Serialize};

/// Which transport backs the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Direct data channels negotiated over signaling, host relays.
    #[default]
    Direct,
    /// Centrally relayed pub/sub channel.
    Relay,
    /// Plain development WebSocket relay, no negotiation.
    DevRelay,
}

/// How inbound ICE candidates are matched to connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IceRouting {
    /// Apply every candidate to every tracked connection.
    #[default]
    Broadcast,
    /// Apply a candidate only to the connection of its sender.
    Targeted,
}

/// Session selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Session to join. A fresh one is generated when unset.
    pub id: Option<String>,
    pub transport: TransportKind,
    pub ice_routing: IceRouting,
}

/// Data channel liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            idle_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "rally=info".into(),
        }
    }
}
