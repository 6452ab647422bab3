//! rally-relay: development signaling relay.
//!
//! Accepts WebSocket connections, groups them by session id, and forwards
//! every text frame verbatim to the other members of the same session. The
//! relay never interprets negotiation payloads. With host election on (the
//! default), the first participant in a session is announced as its host.

mod connection;
mod protocol;
mod session;

use clap::Parser;
use tokio::net::TcpListener;

use crate::connection::serve;
use crate::session::SessionStore;

#[derive(Parser)]
#[command(name = "rally-relay", about = "WebSocket signaling relay for rally sessions")]
struct Args {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 42424)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Relay frames only; never send SessionReady announcements.
    #[arg(long)]
    no_elect_host: bool,

    /// Log filter, overrides RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "rally_relay=info".into()),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = SessionStore::new(!args.no_elect_host);

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind TCP listener");
            std::process::exit(1);
        }
    };

    tracing::info!(
        elect_host = !args.no_elect_host,
        "rally-relay listening on {}",
        addr
    );

    tokio::select! {
        _ = serve(listener, store.clone()) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(sessions = store.count().await, "shutting down");
        }
    }
}
