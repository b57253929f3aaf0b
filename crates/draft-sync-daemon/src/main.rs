//! draft-sync-daemon: serves collaborative drafts to editor clients over
//! WebSocket, keeping uncommitted state in memory and committed documents
//! on disk.

use anyhow::Result;
use clap::Parser;
use draft_sync_core::{DraftSync, InMemoryKv, SystemClock};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use draft_sync_daemon::{
    Args, ClientRegistry, Daemon, Engine, JsonDocumentStore, Sweeper, WebSocketServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,draft_sync_daemon=debug"
    } else {
        "info,draft_sync_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting draft-sync-daemon");
    info!("Data directory: {:?}", args.data_dir);
    info!("Listen address: {}", args.listen);

    tokio::fs::create_dir_all(&args.data_dir).await?;

    let config = args.sync_config();
    info!(
        "Draft TTL {:?}, lock TTL {:?}, typing TTL {:?}, {:?}",
        config.draft_ttl, config.lock_ttl, config.typing_ttl, config.concurrency
    );

    let clock = Arc::new(SystemClock);
    let engine: Arc<Engine> = Arc::new(DraftSync::new(
        config,
        Arc::new(InMemoryKv::new(clock.clone())),
        Arc::new(JsonDocumentStore::new(args.data_dir.clone())),
        ClientRegistry::new(),
        clock,
    ));

    let listener = WebSocketServer::bind(&args.listen).await?;
    let sweeper = Sweeper::start(Arc::clone(&engine), args.sweep_interval());
    let daemon = Daemon::new(engine);

    info!("Daemon running. Press Ctrl+C to stop.");

    daemon
        .run(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    sweeper.stop().await;
    info!("Shutting down");
    Ok(())
}
