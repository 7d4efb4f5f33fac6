//! The metadata flusher.
//!
//! A periodic task that walks every mounted filesystem and persists dirty
//! nodes. Transient faults are retried next tick; anything else is
//! published to the fatal channel to trigger coordinated shutdown.

use std::sync::Arc;
use std::time::Duration;

use fluid_core::error::Error;
use fluid_fs::Filesystem;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

pub async fn run_flusher(
    filesystems: Arc<Vec<Arc<Filesystem>>>,
    delay: Duration,
    mut stop: broadcast::Receiver<()>,
    fatal: mpsc::Sender<Error>,
) {
    let mut ticker = tokio::time::interval(delay);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            _ = ticker.tick() => {}
        }
        flush_pass(&filesystems, &fatal).await;
    }
    // Final pass so queued metadata lands before the engines close.
    flush_pass(&filesystems, &fatal).await;
    debug!("flusher stopped");
}

async fn flush_pass(filesystems: &[Arc<Filesystem>], fatal: &mpsc::Sender<Error>) {
    for fs in filesystems {
        match fs.flush_all().await {
            Ok(0) => {}
            Ok(stored) => info!(prefix = fs.prefix(), stored, "flushed dirty nodes"),
            Err(err) if err.is_transient() => {
                warn!(prefix = fs.prefix(), "flush deferred: {err}");
            }
            Err(err) => {
                warn!(prefix = fs.prefix(), "flush failed fatally: {err}");
                let _ = fatal.send(err).await;
            }
        }
    }
}
