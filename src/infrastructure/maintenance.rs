//! Periodic store maintenance.
//!
//! [`MemoryStore`](crate::MemoryStore) evicts expired entries lazily, on
//! access. Keys that are never touched again stay resident until something
//! sweeps them; [`PurgeTask`] does that on a tokio interval.

use crate::application::ports::CounterStore;
use crate::infrastructure::config::ConfigError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Background sweep calling [`CounterStore::purge_expired`].
#[derive(Debug)]
pub struct PurgeTask {
    store: Arc<dyn CounterStore>,
    every: Duration,
}

impl PurgeTask {
    /// # Errors
    /// Returns `ConfigError::Zero` if `every` is zero.
    pub fn new(store: Arc<dyn CounterStore>, every: Duration) -> Result<Self, ConfigError> {
        if every.is_zero() {
            return Err(ConfigError::Zero("purge interval"));
        }
        Ok(Self { store, every })
    }

    /// Spawn the sweep on the current tokio runtime.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn start(self) -> PurgeHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }
                match self.store.purge_expired() {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "purged expired governance state"),
                    Err(e) => tracing::warn!(error = %e, "store purge failed"),
                }
            }
        });

        PurgeHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

/// Handle to a running [`PurgeTask`].
#[derive(Debug)]
pub struct PurgeHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PurgeHandle {
    /// Stop the sweep and wait for it to finish.
    ///
    /// # Errors
    /// Returns the join error if the task panicked.
    pub async fn shutdown(mut self) -> Result<(), tokio::task::JoinError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.task).await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PurgeHandle {
    fn drop(&mut self) {
        if self.stop.is_some() {
            self.task.abort();
        }
    }
}
