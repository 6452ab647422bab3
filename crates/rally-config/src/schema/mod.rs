//! Configuration schema types for rally.
//!
//! All structs use `serde(default)` so partial configs work correctly.

mod network;
mod session;

pub use network::{IceConfig, RelayConfig, SignalingConfig, TurnServer};
pub use session::{HeartbeatSettings, IceRouting, LoggingConfig, SessionSettings, TransportKind};

use serde::{Deserialize, Serialize};

/// Current config schema version.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RallyConfig {
    pub session: SessionSettings,
    pub signaling: SignalingConfig,
    pub ice: IceConfig,
    pub heartbeat: HeartbeatSettings,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}
