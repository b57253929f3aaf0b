//! Periodic advisory sweep, owned by the daemon.
//!
//! The task only runs between `Sweeper::start` and `Sweeper::stop`.

use draft_sync_core::{BroadcastTransport, DraftSync, DurableStore, KvStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct Sweeper {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn the sweep loop. The first pass runs immediately.
    pub fn start<S, D, T>(engine: Arc<DraftSync<S, D, T>>, period: Duration) -> Self
    where
        S: KvStore + 'static,
        D: DurableStore + 'static,
        T: BroadcastTransport + 'static,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.sweep().await {
                            Ok(stats) if stats.purged > 0 => info!(
                                "Sweep purged {} expired entr(ies); live: {} draft(s), {} lock(s), {} typing marker(s)",
                                stats.purged, stats.drafts, stats.locks, stats.typing_markers
                            ),
                            Ok(stats) => debug!("Sweep: {:?}", stats),
                            Err(e) => warn!("Sweep failed: {}", e),
                        }
                    }
                    // Stop requested, or the Sweeper was dropped
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Sweeper stopped");
        });

        Self { shutdown, task }
    }

    /// Signal the loop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Sweeper task ended abnormally: {}", e);
        }
    }
}
