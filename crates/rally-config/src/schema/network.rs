//! Signaling, ICE and relay endpoint configuration.

use serde::{Deserialize, Serialize};

/// Signaling server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the signaling relay.
    pub url: String,
    /// Reconnect attempts before the session is given up.
    pub max_reconnect_attempts: u32,
    /// Delay unit for linear reconnect backoff.
    pub reconnect_base_delay_ms: u64,
    pub connect_timeout_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:42424".into(),
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1000,
            connect_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// ICE server list handed to the RTC stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
                "stun:stun2.l.google.com:19302".into(),
            ],
            turn_servers: Vec::new(),
        }
    }
}

/// Centralized relay (Action Cable) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub url: String,
    pub channel: String,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_delay_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000/cable".into(),
            channel: "ExperienceChannel".into(),
            reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 30,
        }
    }
}
