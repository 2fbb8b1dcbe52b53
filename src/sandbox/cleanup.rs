//! Periodic reclamation of stale executions, orphaned units and workspaces.

use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::Inner;

/// Background task that runs a sweep every `interval` until stopped or
/// until the sandbox it belongs to is dropped.
#[derive(Debug)]
pub(crate) struct CleanupLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CleanupLoop {
    pub fn start(inner: Weak<Inner>, interval: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; nothing is stale at startup
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stopped.wait_for(|stop| *stop) => break,
                    _ = ticker.tick() => {}
                }

                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let report = inner.sweep().await;
                if report.is_empty() {
                    debug!("Cleanup sweep found nothing to reclaim");
                } else {
                    info!(
                        "Cleanup sweep: {} stale executions killed, {} orphaned units reaped, {} workspaces removed",
                        report.killed_stale, report.reaped_units, report.removed_workspaces
                    );
                }
            }

            debug!("Cleanup loop stopped");
        });

        Self { stop, handle }
    }

    /// Signals the loop and waits for an in-flight sweep to finish.
    pub async fn stop(self) {
        self.stop.send_replace(true);
        let _ = self.handle.await;
    }
}
