//! Append-only version history.
//!
//! Every meaningful mutation of a record stores a full snapshot. Snapshots
//! are never modified after they are written; restoring one is a read and
//! the caller decides how to apply it.

use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::engine::CacheEngine;
use crate::entities::Cacheable;
use crate::error::{CacheError, Result};
use crate::store::{Direction, Index, Partition, Scan, WriteOp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
  /// `{record_id}_{created_at in ms}`
  pub version_id: String,
  pub record_id: String,
  /// Full field state at capture time
  pub payload: Value,
  pub change_note: Option<String>,
  #[serde(with = "ts_milliseconds")]
  pub created_at: DateTime<Utc>,
  pub created_by: String,
}

impl VersionSnapshot {
  /// Decode the captured record.
  pub fn restore<T: DeserializeOwned>(&self) -> Result<T> {
    Ok(serde_json::from_value(self.payload.clone())?)
  }
}

#[derive(Clone)]
pub struct VersionHistory {
  engine: CacheEngine,
  author: String,
}

impl VersionHistory {
  pub fn new(engine: CacheEngine, author: impl Into<String>) -> Self {
    Self {
      engine,
      author: author.into(),
    }
  }

  /// Capture the current state of `record`.
  pub fn save_version<T: Cacheable>(
    &self,
    record: &T,
    change_note: Option<&str>,
  ) -> Result<VersionSnapshot> {
    let created_at = self.engine.now();
    let record_id = record.cache_key();
    let snapshot = VersionSnapshot {
      version_id: format!("{}_{}", record_id, created_at.timestamp_millis()),
      record_id,
      payload: serde_json::to_value(record)?,
      change_note: change_note.map(str::to_string),
      created_at,
      created_by: self.author.clone(),
    };

    self.append(&snapshot)?;
    if let Some(keep) = self.engine.config().max_versions_retained {
      self.prune(&snapshot.record_id, keep)?;
    }
    tracing::debug!(version_id = %snapshot.version_id, "saved version");
    Ok(snapshot)
  }

  /// Newest first. `None` uses the configured default limit.
  pub fn list_versions(
    &self,
    record_id: &str,
    limit: Option<usize>,
  ) -> Result<Vec<VersionSnapshot>> {
    let limit = limit.unwrap_or(self.engine.config().max_versions_returned_default);
    self.scan(
      Scan::new(Index::CreatedAt, Direction::Descending)
        .filter(Index::RecordId, record_id)
        .limit(limit),
    )
  }

  pub fn get_version(&self, version_id: &str) -> Result<Option<VersionSnapshot>> {
    self
      .engine
      .store()
      .get(Partition::Versions, version_id)?
      .map(serde_json::from_value)
      .transpose()
      .map_err(Into::into)
  }

  fn append(&self, snapshot: &VersionSnapshot) -> Result<()> {
    let value = serde_json::to_value(snapshot)?;
    let version_id = snapshot.version_id.as_str();

    self.engine.write_with_eviction(|store| {
      let mut insert = |current: Option<Value>| -> Result<Option<Value>> {
        match current {
          Some(_) => Err(CacheError::VersionExists(version_id.to_string())),
          None => Ok(Some(value.clone())),
        }
      };
      store.update(Partition::Versions, version_id, &mut insert)
    })?;
    Ok(())
  }

  /// Drop everything but the newest `keep` snapshots of a record.
  fn prune(&self, record_id: &str, keep: usize) -> Result<()> {
    let all = self.scan(
      Scan::new(Index::CreatedAt, Direction::Descending).filter(Index::RecordId, record_id),
    )?;
    let ops: Vec<WriteOp> = all
      .into_iter()
      .skip(keep)
      .map(|old| WriteOp::delete(Partition::Versions, old.version_id))
      .collect();
    if ops.is_empty() {
      return Ok(());
    }
    tracing::debug!(record_id, count = ops.len(), "pruning old versions");
    self.engine.store().apply(ops)
  }

  fn scan(&self, scan: Scan) -> Result<Vec<VersionSnapshot>> {
    self
      .engine
      .store()
      .scan(&scan)?
      .into_iter()
      .map(|value| serde_json::from_value(value).map_err(Into::into))
      .collect()
  }
}
