//! Stale-while-revalidate loading of a cached collection.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::detached::spawn_detached;
use crate::engine::CacheEngine;
use crate::entities::{Cacheable, EntityCache};
use crate::error::{CacheError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the data in a load result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
  /// Freshly fetched from the remote
  Network,
  /// Served from a fresh cache; a background refresh was started
  CacheFresh,
  /// The remote failed; served from the cache regardless of age
  Offline,
}

/// Result of a load with source metadata.
#[derive(Debug)]
pub struct LoadResult<T> {
  pub data: Vec<T>,
  pub source: LoadSource,
  /// When the returned collection was last synchronized
  pub cached_at: Option<DateTime<Utc>>,
  /// Background refresh started by this load, if any
  pub refresh: Option<JoinHandle<()>>,
}

impl<T> LoadResult<T> {
  pub fn from_cache(&self) -> bool {
    self.source != LoadSource::Network
  }

  pub fn offline(&self) -> bool {
    self.source == LoadSource::Offline
  }
}

/// Decides per load whether to answer from the cache or the network.
///
/// 1. Cache non-empty and younger than the freshness threshold: answer from
///    the cache and refresh in the background
/// 2. Otherwise fetch in the foreground and replace the cache
/// 3. If that fetch fails, answer from the cache even if stale
/// 4. If the cache is empty too, return the fetch error
pub struct LoadOrchestrator<T> {
  cache: EntityCache<T>,
  engine: CacheEngine,
  freshness: Duration,
  timeout: Duration,
  /// Bumped by every refresh; a background refresh only stores its result
  /// if no newer refresh started in the meantime
  generation: Arc<AtomicU64>,
}

impl<T: Cacheable> LoadOrchestrator<T> {
  pub fn new(engine: CacheEngine) -> Self {
    Self {
      cache: EntityCache::new(engine.clone()),
      freshness: engine.config().freshness_threshold(),
      timeout: DEFAULT_TIMEOUT,
      engine,
      generation: Arc::new(AtomicU64::new(0)),
    }
  }

  pub fn with_freshness_threshold(mut self, freshness: Duration) -> Self {
    self.freshness = freshness;
    self
  }

  /// Bound on every network fetch
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn cache(&self) -> &EntityCache<T> {
    &self.cache
  }

  pub async fn load<F, Fut>(&self, fetch: F) -> Result<LoadResult<T>>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    let cached: Vec<T> = self.cache.get_all()?.into_iter().map(|r| r.data).collect();
    let last_sync = self.cache.last_sync()?;
    let age = self.cache.age()?;

    if !cached.is_empty() && age < self.freshness {
      debug!(entity_type = T::entity_type(), ?age, "serving fresh cache");
      return Ok(LoadResult {
        data: cached,
        source: LoadSource::CacheFresh,
        cached_at: last_sync,
        refresh: Some(self.spawn_refresh(fetch)),
      });
    }

    // A foreground fetch supersedes any refresh still in flight
    self.generation.fetch_add(1, Ordering::SeqCst);

    match fetch_within(self.timeout, fetch).await {
      Ok(records) => {
        if let Err(error) = self.cache.replace_all(&records) {
          self.engine.report("cache_refresh", &error);
        }
        Ok(LoadResult {
          data: records,
          source: LoadSource::Network,
          cached_at: self.cache.last_sync().unwrap_or(None),
          refresh: None,
        })
      }
      Err(error) if !cached.is_empty() => {
        warn!(
          entity_type = T::entity_type(),
          error = %error,
          "fetch failed, serving cached data"
        );
        Ok(LoadResult {
          data: cached,
          source: LoadSource::Offline,
          cached_at: last_sync,
          refresh: None,
        })
      }
      Err(error) => Err(error),
    }
  }

  fn spawn_refresh<F, Fut>(&self, fetch: F) -> JoinHandle<()>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let latest = Arc::clone(&self.generation);
    let cache = self.cache.clone();
    let timeout = self.timeout;

    spawn_detached(self.engine.error_sink(), "background_refresh", async move {
      let records = fetch_within(timeout, fetch).await?;
      if latest.load(Ordering::SeqCst) != generation {
        debug!(entity_type = T::entity_type(), "background refresh superseded, discarding");
        return Ok(());
      }
      cache.replace_all(&records)?;
      debug!(
        entity_type = T::entity_type(),
        count = records.len(),
        "background refresh stored"
      );
      Ok(())
    })
  }
}

async fn fetch_within<T, F, Fut>(timeout: Duration, fetch: F) -> Result<Vec<T>>
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<Vec<T>>>,
{
  tokio::time::timeout(timeout, fetch())
    .await
    .map_err(|_| CacheError::timeout(timeout))?
}
