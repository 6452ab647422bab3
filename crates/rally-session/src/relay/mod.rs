//! Thin Action Cable client for the centralized relay mode.
//!
//! Subscribes to the session's experience channel, performs player and
//! object updates on it, and turns the server's broadcasts into
//! [`TransportEvent`](crate::transport::TransportEvent)s. Reconnects with
//! exponential backoff.

mod client;
mod connection;
mod handler;
mod types;

pub use client::RelayTransport;
pub use types::{CableCommand, CableFrame, ChannelIdentifier, RelayBroadcast, RelayOptions};
