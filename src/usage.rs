//! Usage ledger: per-record use counts, last use and a sliding window of
//! recent use times.
//!
//! Entries survive cache refreshes; they are keyed by record id only and are
//! never deleted automatically.

use chrono::serde::ts_milliseconds_option;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::CacheEngine;
use crate::error::{CacheError, Result};
use crate::store::{Direction, Index, Partition, Scan};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntry {
  pub record_id: String,
  pub use_count: u64,
  #[serde(default, with = "ts_milliseconds_option")]
  pub last_used: Option<DateTime<Utc>>,
  /// Oldest first, bounded by `max_recent_uses`
  #[serde(default, with = "millis_vec")]
  pub recent_uses: Vec<DateTime<Utc>>,
}

impl UsageEntry {
  /// The entry of a record that was never used.
  pub fn zero(record_id: &str) -> Self {
    Self {
      record_id: record_id.to_string(),
      use_count: 0,
      last_used: None,
      recent_uses: Vec::new(),
    }
  }

  fn register(&mut self, now: DateTime<Utc>, max_recent: usize) {
    self.use_count += 1;
    self.last_used = Some(now);
    self.recent_uses.push(now);
    if self.recent_uses.len() > max_recent {
      let excess = self.recent_uses.len() - max_recent;
      self.recent_uses.drain(..excess);
    }
  }
}

mod millis_vec {
  use chrono::{DateTime, Utc};
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S>(times: &[DateTime<Utc>], serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.collect_seq(times.iter().map(|t| t.timestamp_millis()))
  }

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<DateTime<Utc>>, D::Error>
  where
    D: Deserializer<'de>,
  {
    let millis = Vec::<i64>::deserialize(deserializer)?;
    Ok(millis.into_iter().map(crate::clock::from_millis).collect())
  }
}

#[derive(Clone)]
pub struct UsageLedger {
  engine: CacheEngine,
}

impl UsageLedger {
  pub fn new(engine: CacheEngine) -> Self {
    Self { engine }
  }

  /// Count one use of `record_id`.
  ///
  /// The read-modify-write runs as a single store transaction, so concurrent
  /// callers never lose increments.
  pub fn record_use(&self, record_id: &str) -> Result<UsageEntry> {
    let now = self.engine.now();
    let max_recent = self.engine.config().max_recent_uses;

    let written = self.engine.write_with_eviction(|store| {
      let mut bump = |current: Option<Value>| -> Result<Option<Value>> {
        let mut entry = match current {
          Some(value) => serde_json::from_value::<UsageEntry>(value)?,
          None => UsageEntry::zero(record_id),
        };
        entry.register(now, max_recent);
        Ok(Some(serde_json::to_value(&entry)?))
      };
      store.update(Partition::Usage, record_id, &mut bump)
    })?;

    let entry = written
      .map(serde_json::from_value::<UsageEntry>)
      .transpose()?
      .ok_or_else(|| CacheError::NotFound(format!("usage entry {}", record_id)))?;
    tracing::debug!(record_id, use_count = entry.use_count, "recorded use");
    Ok(entry)
  }

  /// Entries ordered by last use, newest first.
  pub fn most_recently_used(&self, limit: usize) -> Result<Vec<UsageEntry>> {
    self.scan(Scan::new(Index::LastUsed, Direction::Descending).limit(limit))
  }

  /// Entries ordered by use count, highest first. Records used no more than
  /// `most_frequent_min_count` times are left out.
  pub fn most_frequently_used(&self, limit: usize) -> Result<Vec<UsageEntry>> {
    let min_count = self.engine.config().most_frequent_min_count;
    let ranked = self.scan(Scan::new(Index::UseCount, Direction::Descending))?;
    Ok(
      ranked
        .into_iter()
        .take_while(|entry| entry.use_count > min_count)
        .take(limit)
        .collect(),
    )
  }

  /// Usage of one record; a zeroed entry if it was never used.
  pub fn stats_for(&self, record_id: &str) -> Result<UsageEntry> {
    match self.engine.store().get(Partition::Usage, record_id)? {
      Some(value) => Ok(serde_json::from_value(value)?),
      None => Ok(UsageEntry::zero(record_id)),
    }
  }

  fn scan(&self, scan: Scan) -> Result<Vec<UsageEntry>> {
    self
      .engine
      .store()
      .scan(&scan)?
      .into_iter()
      .map(|value| serde_json::from_value(value).map_err(Into::into))
      .collect()
  }
}
