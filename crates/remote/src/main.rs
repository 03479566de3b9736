// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! lsync-remote: WebSocket relay server for lsync clients.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lsync_core::KeyPrefix;
use lsync_remote::{RelayOptions, RelayState};

/// lsync-remote: realtime key/value relay
#[derive(Parser, Debug)]
#[command(name = "lsync-remote")]
#[command(about = "WebSocket relay server for lsync clients")]
struct Args {
    /// Address to bind the server to
    #[arg(short, long, default_value = "0.0.0.0:7890")]
    bind: SocketAddr,

    /// Directory for the write log (in-memory when omitted)
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Refuse writes under this prefix (repeatable)
    #[arg(long = "read-only", value_name = "PREFIX")]
    read_only: Vec<KeyPrefix>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting lsync-remote");
    info!("  Bind address: {}", args.bind);
    match &args.data {
        Some(dir) => info!("  Data directory: {}", dir.display()),
        None => info!("  Data directory: none (in-memory)"),
    }
    for prefix in &args.read_only {
        info!("  Read-only: {}", prefix);
    }

    let options = RelayOptions { data_dir: args.data, read_only: args.read_only };
    let state = RelayState::open(&options)?;
    lsync_remote::run(args.bind, state).await
}
