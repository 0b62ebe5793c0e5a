//! Session-wide context shared by every component of the data layer.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

use crate::clock::{Clock, MonotonicClock, SystemClock};
use crate::config::CacheConfig;
use crate::detached::{ErrorSink, TracingSink};
use crate::error::{CacheError, Result};
use crate::metadata;
use crate::store::{MemoryStore, PartitionStore, SqliteStore};

enum StoreLocation {
  /// The configured path, or the default data directory
  Disk(Option<PathBuf>),
  InMemory,
  Provided(Arc<dyn PartitionStore>),
}

struct EngineInner {
  config: CacheConfig,
  location: StoreLocation,
  store: OnceLock<Arc<dyn PartitionStore>>,
  degraded: OnceLock<String>,
  warned: AtomicBool,
  clock: MonotonicClock,
  sink: Arc<dyn ErrorSink>,
}

/// Handle to the local data layer for one session.
///
/// Constructed once and cloned into every component that needs storage,
/// time or error reporting. Clones share the same store.
#[derive(Clone)]
pub struct CacheEngine {
  inner: Arc<EngineInner>,
}

pub struct CacheEngineBuilder {
  config: CacheConfig,
  location: StoreLocation,
  clock: Arc<dyn Clock>,
  sink: Arc<dyn ErrorSink>,
}

impl CacheEngineBuilder {
  /// Keep everything in memory (nothing survives the session).
  pub fn in_memory(mut self) -> Self {
    self.location = StoreLocation::InMemory;
    self
  }

  /// Use an already-open store.
  pub fn store(mut self, store: Arc<dyn PartitionStore>) -> Self {
    self.location = StoreLocation::Provided(store);
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
    self.sink = sink;
    self
  }

  pub fn build(self) -> CacheEngine {
    CacheEngine {
      inner: Arc::new(EngineInner {
        config: self.config,
        location: self.location,
        store: OnceLock::new(),
        degraded: OnceLock::new(),
        warned: AtomicBool::new(false),
        clock: MonotonicClock::new(self.clock),
        sink: self.sink,
      }),
    }
  }
}

impl CacheEngine {
  /// Start building an engine that stores to `config.path` (or the default
  /// data directory).
  pub fn builder(config: CacheConfig) -> CacheEngineBuilder {
    let location = StoreLocation::Disk(config.path.clone());
    CacheEngineBuilder {
      config,
      location,
      clock: Arc::new(SystemClock),
      sink: Arc::new(TracingSink),
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.inner.config
  }

  /// The shared store, opened on first use.
  ///
  /// Concurrent first calls converge on a single handle. If the durable
  /// store cannot be opened the session continues on an in-memory store;
  /// see [`CacheEngine::storage_warning`].
  pub fn store(&self) -> Arc<dyn PartitionStore> {
    Arc::clone(self.inner.store.get_or_init(|| self.open_store()))
  }

  fn open_store(&self) -> Arc<dyn PartitionStore> {
    let opened = match &self.inner.location {
      StoreLocation::Provided(store) => return Arc::clone(store),
      StoreLocation::InMemory => return Arc::new(MemoryStore::new()),
      StoreLocation::Disk(path) => {
        let path = match path {
          Some(path) => Ok(path.clone()),
          None => SqliteStore::default_path(),
        };
        path.and_then(|path| {
          let store = SqliteStore::open(&path, self.inner.config.max_db_pages)?;
          info!(path = %path.display(), "opened local store");
          Ok(store)
        })
      }
    };

    match opened {
      Ok(store) => Arc::new(store),
      Err(error) => {
        warn!(error = %error, "local store unavailable, continuing in memory");
        let _ = self.inner.degraded.set(error.to_string());
        Arc::new(MemoryStore::new())
      }
    }
  }

  /// Whether the session fell back to memory-only storage.
  pub fn is_degraded(&self) -> bool {
    self.store();
    self.inner.degraded.get().is_some()
  }

  /// The reason storage is degraded, returned once per session so the user
  /// sees a single non-blocking warning.
  pub fn storage_warning(&self) -> Option<String> {
    self.store();
    let reason = self.inner.degraded.get()?;
    if self.inner.warned.swap(true, Ordering::SeqCst) {
      return None;
    }
    Some(format!(
      "Offline storage is unavailable ({}); changes will not survive this session",
      reason
    ))
  }

  /// Event stamp; strictly increasing across the session.
  pub fn now(&self) -> DateTime<Utc> {
    self.inner.clock.stamp()
  }

  /// Wall time for age calculations.
  pub fn wall_now(&self) -> DateTime<Utc> {
    self.inner.clock.wall()
  }

  pub fn error_sink(&self) -> Arc<dyn ErrorSink> {
    Arc::clone(&self.inner.sink)
  }

  /// Report a failure that must not interrupt the caller.
  pub fn report(&self, task: &str, error: &CacheError) {
    self.inner.sink.report(task, error);
  }

  /// Run a write against the store. If the store is full, evict the oldest
  /// half of tracked cache items and retry exactly once.
  pub fn write_with_eviction<R>(
    &self,
    mut write: impl FnMut(&dyn PartitionStore) -> Result<R>,
  ) -> Result<R> {
    let store = self.store();
    match write(store.as_ref()) {
      Err(CacheError::QuotaExceeded(reason)) => {
        warn!(reason = %reason, "storage quota exceeded, evicting oldest cached items");
        let evicted = metadata::evict_oldest_half(store.as_ref())?;
        info!(count = evicted.len(), "evicted cached items");
        write(store.as_ref())
      }
      other => other,
    }
  }
}
