//! Fixed-delay scheduling of poll cycles.
//!
//! The next cycle starts `delay` after the previous one finished, so cycles of one
//! poller never overlap.

use crate::config::ReadConfig;
use crate::poller::ReplayPoller;
use replay_outbox_core::TransactionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

/// Drives a [`ReplayPoller`] at a fixed delay.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelayScheduler {
    delay: Duration,
}

impl FixedDelayScheduler {
    /// Scheduler waiting `delay` between cycles.
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Scheduler using `read.fixed_delay_ms`.
    #[must_use]
    pub const fn from_config(config: &ReadConfig) -> Self {
        Self::new(config.fixed_delay())
    }

    /// Delay between cycles.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Spawn the polling loop on the current tokio runtime.
    ///
    /// The loop stops after [`SchedulerHandle::shutdown`] or when the handle is
    /// dropped; a cycle in progress always runs to completion first.
    pub fn spawn<M>(self, poller: Arc<ReplayPoller<M>>) -> SchedulerHandle
    where
        M: TransactionManager + 'static,
    {
        let (shutdown, mut stop) = watch::channel(false);
        let delay = self.delay;

        let task = tokio::spawn(async move {
            tracing::info!(delay = ?delay, "Replay scheduler started");
            loop {
                match poller.poll_once().await {
                    Ok(report) => tracing::trace!(%report, "Scheduled poll finished"),
                    Err(error) => tracing::warn!(error = %error, "Scheduled poll failed"),
                }

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Replay scheduler stopped");
        });

        SchedulerHandle { shutdown, task }
    }
}

/// Handle to a running scheduler loop.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop to stop and wait for it.
    ///
    /// # Errors
    ///
    /// Returns the [`JoinError`] if the loop task panicked or was aborted.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        // The loop may already be gone; nothing to signal then.
        let _ = self.shutdown.send(true);
        self.task.await
    }

    /// Whether the loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
