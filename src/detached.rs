//! Fire-and-forget tasks whose failures are reported, not returned.
//!
//! Usage tracking and background refreshes must never block or fail the
//! user action that triggered them. They run as detached tasks, and every
//! detached task has an [`ErrorSink`] that receives its error.

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

/// Receives failures from work nobody is waiting on.
pub trait ErrorSink: Send + Sync {
  fn report(&self, task: &str, error: &CacheError);
}

/// Logs failures through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
  fn report(&self, task: &str, error: &CacheError) {
    warn!(task, error = %error, "background task failed");
  }
}

/// Keeps failures so a front end can show them later (e.g. in a status line).
#[derive(Debug, Default)]
pub struct CollectingSink {
  errors: Mutex<Vec<(String, String)>>,
}

impl CollectingSink {
  pub fn new() -> Self {
    Self::default()
  }

  /// Drain collected `(task, message)` pairs.
  pub fn take(&self) -> Vec<(String, String)> {
    self
      .errors
      .lock()
      .map(|mut errors| std::mem::take(&mut *errors))
      .unwrap_or_default()
  }
}

impl ErrorSink for CollectingSink {
  fn report(&self, task: &str, error: &CacheError) {
    warn!(task, error = %error, "background task failed");
    if let Ok(mut errors) = self.errors.lock() {
      errors.push((task.to_string(), error.to_string()));
    }
  }
}

/// Run `future` on the runtime without waiting for it.
///
/// The returned handle may be awaited, but dropping it does not cancel the
/// task. An `Err` outcome goes to `sink`.
pub fn spawn_detached<F>(sink: Arc<dyn ErrorSink>, task: &'static str, future: F) -> JoinHandle<()>
where
  F: Future<Output = Result<()>> + Send + 'static,
{
  tokio::spawn(async move {
    match future.await {
      Ok(()) => debug!(task, "background task finished"),
      Err(error) => sink.report(task, &error),
    }
  })
}
