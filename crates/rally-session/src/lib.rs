//! Multiplayer session networking.
//!
//! A session is a star: one participant is the host, every other participant
//! keeps a single RTC connection to it, and the host relays messages between
//! clients. Peers find each other through a signaling side-channel. Two
//! fallbacks exist: the plain dev relay and a centralized Action Cable relay.

pub mod clock;
pub mod connection;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod rtc;
pub mod signaling;
pub mod transport;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use connection::{Connection, HeartbeatConfig, HeartbeatOutcome, Side};
pub use error::{Result, SessionError};
pub use peer::{
    IceRouting, Lifecycle, PeerSettings, PeerSnapshot, Role, SessionEvent, SessionHandle,
    SessionPeer,
};
pub use protocol::{
    ConnectionState, ConnectionStatus, GameMessage, GameObjectUpdate, Interaction,
    InteractionKind, MessageKind, ObjectShape, P2pMessage, PlayerState, SignalingMessage,
};
pub use relay::{RelayOptions, RelayTransport};
pub use rtc::{IceServer, LoopbackNetwork, RtcBackend, WebRtcBackend};
pub use signaling::{MemorySignaling, Signaling, SignalingChannel, SignalingOptions};
pub use transport::{DevRelayTransport, DirectTransport, Transport, TransportEvent};
