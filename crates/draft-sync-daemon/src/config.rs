//! Command-line configuration.

use clap::Parser;
use draft_sync_core::{ConcurrencyMode, SyncConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "draft-sync-daemon")]
#[command(about = "Collaborative draft synchronization daemon")]
pub struct Args {
    /// Address to listen on for WebSocket clients
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Directory holding committed documents
    #[arg(short, long)]
    pub data_dir: PathBuf,

    /// Lifetime of an uncommitted draft, refreshed on every accepted write
    #[arg(long, default_value_t = 3600)]
    pub draft_ttl_secs: u64,

    /// Lifetime of a field lock
    #[arg(long, default_value_t = 300)]
    pub lock_ttl_secs: u64,

    /// Lifetime of a typing marker
    #[arg(long, default_value_t = 30)]
    pub typing_ttl_secs: u64,

    /// Seconds between advisory sweeps of expired entries
    #[arg(long, default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Write accepted drafts without compare-and-swap
    #[arg(long)]
    pub last_writer_wins: bool,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

impl Args {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            draft_ttl: Duration::from_secs(self.draft_ttl_secs),
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            typing_ttl: Duration::from_secs(self.typing_ttl_secs),
            concurrency: if self.last_writer_wins {
                ConcurrencyMode::LastWriterWins
            } else {
                ConcurrencyMode::CompareAndSwap
            },
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
