//! Background trimmer.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::manager::ConnManager;
use crate::traits::ConnectionHandle;
use crate::trim::TrimOutcome;

impl<C: ConnectionHandle> ConnManager<C> {
    /// Spawn the background trimmer on the current tokio runtime.
    ///
    /// Every `trim_interval` the trimmer runs a [`trim`](Self::trim) if the
    /// connection count exceeds the high watermark. It exits on
    /// [`shutdown`](Self::shutdown); a trim already running is left to finish.
    pub fn spawn_trimmer(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let stopped = *shutdown.borrow_and_update();
            if stopped {
                return;
            }
            debug!(interval = ?this.config.trim_interval, "connection trimmer started");

            loop {
                tokio::select! {
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow_and_update() {
                            debug!("connection trimmer shutting down");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(this.config.trim_interval) => {
                        this.on_tick();
                    }
                }
            }
        })
    }

    /// Stop the background trimmer. Idempotent.
    pub fn shutdown(&self) {
        let was_stopped = self.shutdown_tx.send_replace(true);
        if !was_stopped {
            debug!("connection manager shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// One trimmer tick: trim only above the high watermark.
    pub(crate) fn on_tick(&self) -> Option<TrimOutcome> {
        let count = self.connection_count();
        if count <= self.config.high_watermark {
            trace!(count, high = self.config.high_watermark, "below high watermark");
            return None;
        }
        Some(self.trim())
    }
}
