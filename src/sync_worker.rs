//! Background outbox replay.
//!
//! Runs a sync cycle on a fixed interval and whenever the front end reports
//! that connectivity came back. The summary of the latest cycle is published
//! on a watch channel so a UI can poll it without blocking. A slow reader
//! skips intermediate cycles instead of piling them up.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::library::ClauseLibrary;
use crate::outbox::DrainSummary;
use crate::remote::Remote;

pub struct SyncWorker {
  wake: Arc<Notify>,
  shutdown: watch::Sender<bool>,
  summaries: watch::Receiver<Option<DrainSummary>>,
  handle: JoinHandle<()>,
}

impl SyncWorker {
  /// Start the worker. The first cycle runs immediately.
  pub fn spawn<R: Remote>(library: Arc<ClauseLibrary<R>>, interval: Duration) -> Self {
    let wake = Arc::new(Notify::new());
    let (shutdown, mut stop) = watch::channel(false);
    let (latest, summaries) = watch::channel(None);

    let notified = Arc::clone(&wake);
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          _ = ticker.tick() => {}
          _ = notified.notified() => debug!("connectivity regained, syncing"),
          _ = stop.changed() => break,
        }

        if !library.sync_enabled() {
          continue;
        }
        match library.sync().await {
          // Stored even when nobody is listening
          Ok(summary) => {
            latest.send_replace(Some(summary));
          }
          Err(error) => library.engine().report("sync", &error),
        }
      }
      info!("sync worker stopped");
    });

    Self {
      wake,
      shutdown,
      summaries,
      handle,
    }
  }

  /// Run a cycle now instead of waiting for the next tick.
  pub fn connectivity_regained(&self) {
    self.wake.notify_one();
  }

  /// Non-blocking check for a cycle finished since the last look.
  pub fn try_summary(&mut self) -> Option<DrainSummary> {
    if !self.summaries.has_changed().unwrap_or(false) {
      return None;
    }
    self.summaries.borrow_and_update().clone()
  }

  /// Wait for the next finished cycle. `None` once the worker has stopped.
  pub async fn next_summary(&mut self) -> Option<DrainSummary> {
    self.summaries.changed().await.ok()?;
    self.summaries.borrow_and_update().clone()
  }

  /// Stop after the current cycle.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    let _ = self.handle.await;
  }
}
