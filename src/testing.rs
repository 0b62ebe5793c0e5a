//! Test doubles shared by the unit tests.

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::ManualClock;
use crate::config::CacheConfig;
use crate::engine::CacheEngine;
use crate::error::{CacheError, Result};
use crate::remote::{Clause, Remote};
use crate::store::{MemoryStore, Partition, PartitionStore, Scan, UpdateWithFn, WriteOp};

pub fn start_time() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

pub fn clause(id: &str, title: &str) -> Clause {
  Clause {
    id: id.to_string(),
    title: title.to_string(),
    body: format!("{} body", title),
    category: None,
    tags: Vec::new(),
    client_id: None,
    updated_at: None,
    extra: Map::new(),
  }
}

/// In-memory engine driven by a manual clock.
pub fn engine_with_clock() -> (CacheEngine, Arc<ManualClock>) {
  engine_with_config(CacheConfig::default())
}

pub fn engine_with_config(config: CacheConfig) -> (CacheEngine, Arc<ManualClock>) {
  let clock = Arc::new(ManualClock::new(start_time()));
  let engine = CacheEngine::builder(config)
    .in_memory()
    .clock(clock.clone())
    .build();
  (engine, clock)
}

/// Memory store that rejects writes with `QuotaExceeded` on demand.
///
/// Only writes that add data fail: batches containing a `Put` and
/// read-modify-write updates. Pure deletions always go through, the way a
/// full disk still accepts deletes.
pub struct FlakyStore {
  inner: MemoryStore,
  failures: AtomicUsize,
}

impl FlakyStore {
  pub fn new() -> Self {
    Self {
      inner: MemoryStore::new(),
      failures: AtomicUsize::new(0),
    }
  }

  pub fn fail_next_writes(&self, count: usize) {
    self.failures.store(count, Ordering::SeqCst);
  }

  pub fn pending_failures(&self) -> usize {
    self.failures.load(Ordering::SeqCst)
  }

  fn take_failure(&self) -> Result<()> {
    let took = self
      .failures
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if took {
      Err(CacheError::QuotaExceeded("injected".to_string()))
    } else {
      Ok(())
    }
  }
}

impl PartitionStore for FlakyStore {
  fn get(&self, partition: Partition, key: &str) -> Result<Option<Value>> {
    self.inner.get(partition, key)
  }

  fn get_prefix(&self, partition: Partition, prefix: &str) -> Result<Vec<(String, Value)>> {
    self.inner.get_prefix(partition, prefix)
  }

  fn scan(&self, scan: &Scan) -> Result<Vec<Value>> {
    self.inner.scan(scan)
  }

  fn apply(&self, ops: Vec<WriteOp>) -> Result<()> {
    if ops.iter().any(|op| matches!(op, WriteOp::Put { .. })) {
      self.take_failure()?;
    }
    self.inner.apply(ops)
  }

  fn update_with(
    &self,
    partition: Partition,
    key: &str,
    f: &mut UpdateWithFn<'_>,
  ) -> Result<Option<Value>> {
    self.take_failure()?;
    self.inner.update_with(partition, key, f)
  }
}

/// Scriptable clause service.
#[derive(Default)]
pub struct FakeRemote {
  online: AtomicBool,
  records: Mutex<Vec<Clause>>,
  missing: Mutex<HashSet<String>>,
  delay: Mutex<Option<Duration>>,
  mutation_delay: Mutex<Option<Duration>>,
  pub list_calls: AtomicUsize,
  pub use_calls: AtomicUsize,
  /// Mutations in the order they reached the service, e.g. "update:c1"
  pub log: Mutex<Vec<String>>,
}

impl FakeRemote {
  pub fn new(records: Vec<Clause>) -> Self {
    Self {
      online: AtomicBool::new(true),
      records: Mutex::new(records),
      ..Self::default()
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn set_records(&self, records: Vec<Clause>) {
    *self.records.lock().unwrap() = records;
  }

  pub fn records(&self) -> Vec<Clause> {
    self.records.lock().unwrap().clone()
  }

  /// Answer 404 for every mutation of `id`.
  pub fn reject(&self, id: &str) {
    self.missing.lock().unwrap().insert(id.to_string());
  }

  /// Take mutations of `id` again after [`FakeRemote::reject`].
  pub fn accept(&self, id: &str) {
    self.missing.lock().unwrap().remove(id);
  }

  /// Delay every list response.
  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  /// Delay every create, update and delete before it takes effect.
  pub fn set_mutation_delay(&self, delay: Duration) {
    *self.mutation_delay.lock().unwrap() = Some(delay);
  }

  pub fn list_count(&self) -> usize {
    self.list_calls.load(Ordering::SeqCst)
  }

  pub fn log(&self) -> Vec<String> {
    self.log.lock().unwrap().clone()
  }

  fn check(&self, id: &str) -> Result<()> {
    if !self.online.load(Ordering::SeqCst) {
      return Err(CacheError::NetworkUnreachable("fake remote offline".to_string()));
    }
    if self.missing.lock().unwrap().contains(id) {
      return Err(CacheError::Remote {
        status: 404,
        message: format!("no clause {}", id),
      });
    }
    Ok(())
  }

  async fn mutate(&self, action: &str, id: &str) -> Result<()> {
    let delay = *self.mutation_delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    self.check(id)?;
    self.log.lock().unwrap().push(format!("{}:{}", action, id));
    Ok(())
  }
}

impl Remote for FakeRemote {
  fn list(&self) -> BoxFuture<'_, Result<Vec<Clause>>> {
    async move {
      self.list_calls.fetch_add(1, Ordering::SeqCst);
      // Answer with the records as they were when the request arrived
      let online = self.online.load(Ordering::SeqCst);
      let records = self.records();
      let delay = *self.delay.lock().unwrap();
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }
      if !online {
        return Err(CacheError::NetworkUnreachable("fake remote offline".to_string()));
      }
      Ok(records)
    }
    .boxed()
  }

  fn create<'a>(&'a self, clause: &'a Clause) -> BoxFuture<'a, Result<Clause>> {
    async move {
      self.mutate("create", &clause.id).await?;
      self.records.lock().unwrap().push(clause.clone());
      Ok(clause.clone())
    }
    .boxed()
  }

  fn update<'a>(&'a self, clause: &'a Clause) -> BoxFuture<'a, Result<Clause>> {
    async move {
      self.mutate("update", &clause.id).await?;
      let mut records = self.records.lock().unwrap();
      match records.iter_mut().find(|r| r.id == clause.id) {
        Some(existing) => *existing = clause.clone(),
        None => records.push(clause.clone()),
      }
      Ok(clause.clone())
    }
    .boxed()
  }

  fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
    async move {
      self.mutate("delete", id).await?;
      self.records.lock().unwrap().retain(|r| r.id != id);
      Ok(())
    }
    .boxed()
  }

  fn record_use<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
    async move {
      self.check(id)?;
      self.use_calls.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
    .boxed()
  }
}
