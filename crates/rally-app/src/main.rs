mod app_state;
mod boot;
mod cli;

use rally_common::{ParticipantId, SessionId};
use rally_config::RallyConfig;
use tracing_subscriber::EnvFilter;

use crate::boot::Target;

fn load_config(args: &cli::Args) -> RallyConfig {
    let loaded = match &args.config {
        Some(path) => {
            tracing::info!("Using config override: {}", path.display());
            rally_config::load_config_from(path)
        }
        None => rally_config::load_config(),
    };
    loaded.unwrap_or_else(|e| {
        tracing::warn!("Config load failed, using defaults: {e}");
        RallyConfig::default()
    })
}

fn resolve_participant(args: &cli::Args) -> ParticipantId {
    let path = match &args.identity {
        Some(path) => Ok(path.clone()),
        None => rally_config::default_identity_path(),
    };
    match path.and_then(|p| rally_config::load_or_create_participant_id(&p)) {
        Ok(id) => id,
        Err(e) => {
            let id = ParticipantId::generate();
            tracing::warn!("Identity unavailable ({e}), using ephemeral id {id}");
            id
        }
    }
}

#[tokio::main]
async fn main() {
    let args = cli::parse();

    // Logging: --log-level wins, then RUST_LOG, then the config file.
    let config = {
        let _bootstrap = tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new("rally=warn"))
                .finish(),
        );
        load_config(&args)
    };
    let log_directive = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) if args.log_level.is_none() => EnvFilter::from_default_env(),
        _ => EnvFilter::new(log_directive),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Rally v{} starting...", env!("CARGO_PKG_VERSION"));

    if args.print_config {
        println!("{}", rally_config::config_to_json(&config));
        return;
    }

    let session_id = args
        .session
        .clone()
        .or_else(|| config.session.id.clone())
        .map(SessionId::new)
        .unwrap_or_else(SessionId::generate);
    let participant_id = resolve_participant(&args);
    let target = Target {
        session_id,
        participant_id,
        kind: args
            .transport
            .map(Into::into)
            .unwrap_or(config.session.transport),
    };
    tracing::info!(
        session = %target.session_id,
        participant = %target.participant_id,
        "Share the session id with other players to join"
    );

    let transport = match boot::build_transport(&config, &target) {
        Ok(transport) => transport,
        Err(e) => {
            tracing::error!("Failed to start transport: {e}");
            std::process::exit(1);
        }
    };

    let name = args
        .name
        .clone()
        .unwrap_or_else(|| target.participant_id.to_string());
    app_state::RallyApp::new(transport, name).run().await;
    tracing::info!("Shutdown complete");
}
