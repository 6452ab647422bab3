use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use rally_config::schema::TransportKind;

/// Rally: join a multiplayer session and exchange player state.
#[derive(Parser, Debug)]
#[command(name = "rally", version, about)]
pub struct Args {
    /// Session to join. Overrides `session.id`; a fresh one is generated when
    /// neither is set.
    #[arg(short, long)]
    pub session: Option<String>,

    /// Transport override.
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportArg>,

    /// Display name sent with player updates.
    #[arg(short, long)]
    pub name: Option<String>,

    /// Config file path override.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Identity file path override.
    #[arg(long)]
    pub identity: Option<PathBuf>,

    /// Print the effective config as JSON and exit.
    #[arg(long)]
    pub print_config: bool,

    /// Log level override (debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    Direct,
    Relay,
    DevRelay,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Direct => TransportKind::Direct,
            TransportArg::Relay => TransportKind::Relay,
            TransportArg::DevRelay => TransportKind::DevRelay,
        }
    }
}

pub fn parse() -> Args {
    Args::parse()
}
