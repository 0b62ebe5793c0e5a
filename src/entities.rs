//! Entity cache: whole collections of remote records, stored locally.

use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::marker::PhantomData;
use std::time::Duration;

use crate::engine::CacheEngine;
use crate::error::Result;
use crate::metadata::{self, ItemMeta, ItemSource, SyncState};
use crate::store::{Direction, Index, Partition, Scan, WriteOp};

/// Trait for entities that can be cached.
///
/// Implementors must provide a unique cache key and optionally an updated_at
/// timestamp.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier within the entity type (e.g. clause id)
  fn cache_key(&self) -> String;

  /// Last modification time reported by the remote, if tracked.
  fn updated_at(&self) -> Option<DateTime<Utc>>;

  /// Entity type name for storage organization (e.g. "clause")
  fn entity_type() -> &'static str;
}

/// A snapshot of a remote record as stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord<T> {
  pub entity_type: String,
  pub id: String,
  /// When this copy was written locally
  #[serde(with = "ts_milliseconds")]
  pub cached_at: DateTime<Utc>,
  /// Position in the last fetched collection
  pub position: usize,
  /// Copy of the record's own modification time, stored as a number so
  /// index order is time order
  #[serde(default, with = "ts_milliseconds_option")]
  pub updated_at: Option<DateTime<Utc>>,
  pub data: T,
}

/// Reads and writes whole collections of one entity type.
pub struct EntityCache<T> {
  engine: CacheEngine,
  _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for EntityCache<T> {
  fn clone(&self) -> Self {
    Self {
      engine: self.engine.clone(),
      _marker: PhantomData,
    }
  }
}

fn entity_prefix<T: Cacheable>() -> String {
  format!("{}/", T::entity_type())
}

fn entity_key<T: Cacheable>(id: &str) -> String {
  format!("{}/{}", T::entity_type(), id)
}

impl<T: Cacheable> EntityCache<T> {
  pub fn new(engine: CacheEngine) -> Self {
    Self {
      engine,
      _marker: PhantomData,
    }
  }

  /// The full current snapshot in collection order. Empty if never populated.
  pub fn get_all(&self) -> Result<Vec<CachedRecord<T>>> {
    let store = self.engine.store();
    let mut records = store
      .get_prefix(Partition::Entities, &entity_prefix::<T>())?
      .into_iter()
      .map(|(_, value)| serde_json::from_value::<CachedRecord<T>>(value))
      .collect::<serde_json::Result<Vec<_>>>()?;
    records.sort_by_key(|record| record.position);
    Ok(records)
  }

  pub fn get(&self, id: &str) -> Result<Option<CachedRecord<T>>> {
    self
      .engine
      .store()
      .get(Partition::Entities, &entity_key::<T>(id))?
      .map(serde_json::from_value)
      .transpose()
      .map_err(Into::into)
  }

  /// Replace every cached record of this type with `records` and mark the
  /// collection as synchronized now. All-or-nothing.
  pub fn replace_all(&self, records: &[T]) -> Result<()> {
    let now = self.engine.now();
    let entity_type = T::entity_type();

    let mut ops = vec![
      WriteOp::clear_prefix(Partition::Entities, entity_prefix::<T>()),
      WriteOp::clear_prefix(Partition::Meta, metadata::item_prefix(entity_type)),
    ];
    for (position, record) in records.iter().enumerate() {
      ops.extend(self.record_ops(record, now, position, ItemSource::Network)?);
    }
    ops.push(WriteOp::put(
      Partition::Meta,
      metadata::sync_key(entity_type),
      serde_json::to_value(SyncState { last_sync: now })?,
    ));

    self
      .engine
      .write_with_eviction(|store| store.apply(ops.clone()))?;
    tracing::debug!(entity_type, count = records.len(), "replaced cached collection");
    Ok(())
  }

  /// Write one whole record, keeping its collection position if it was
  /// already cached and appending it otherwise.
  pub fn upsert(&self, record: &T, source: ItemSource) -> Result<CachedRecord<T>> {
    let now = self.engine.now();
    let id = record.cache_key();

    let position = match self.get(&id)? {
      Some(existing) => existing.position,
      None => self
        .get_all()?
        .iter()
        .map(|r| r.position + 1)
        .max()
        .unwrap_or(0),
    };

    let ops = self.record_ops(record, now, position, source)?;
    self
      .engine
      .write_with_eviction(|store| store.apply(ops.clone()))?;

    Ok(CachedRecord {
      entity_type: T::entity_type().to_string(),
      id,
      cached_at: now,
      position,
      updated_at: record.updated_at(),
      data: record.clone(),
    })
  }

  /// Drop one record and its metadata.
  pub fn remove(&self, id: &str) -> Result<()> {
    let key = entity_key::<T>(id);
    self.engine.store().apply(vec![
      WriteOp::delete(Partition::Entities, key.clone()),
      WriteOp::delete(Partition::Meta, metadata::item_key(&key)),
    ])
  }

  pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
    let store = self.engine.store();
    Ok(metadata::read_sync_state(store.as_ref(), T::entity_type())?.map(|s| s.last_sync))
  }

  /// Time since the last full refresh; `Duration::MAX` if there never was one.
  pub fn age(&self) -> Result<Duration> {
    Ok(match self.last_sync()? {
      Some(last_sync) => (self.engine.wall_now() - last_sync)
        .to_std()
        .unwrap_or(Duration::ZERO),
      None => Duration::MAX,
    })
  }

  pub fn is_stale(&self, threshold: Duration) -> Result<bool> {
    Ok(self.age()? >= threshold)
  }

  /// Tracking metadata for one cached record.
  pub fn item_meta(&self, id: &str) -> Result<Option<ItemMeta>> {
    let store = self.engine.store();
    metadata::read_item(store.as_ref(), &entity_key::<T>(id))
  }

  pub fn by_category(&self, category: &str) -> Result<Vec<CachedRecord<T>>> {
    self.scan(
      Scan::new(Index::UpdatedAt, Direction::Descending)
        .prefix(entity_prefix::<T>())
        .filter(Index::Category, category),
    )
  }

  pub fn by_client(&self, client_id: &str) -> Result<Vec<CachedRecord<T>>> {
    self.scan(
      Scan::new(Index::UpdatedAt, Direction::Descending)
        .prefix(entity_prefix::<T>())
        .filter(Index::Client, client_id),
    )
  }

  /// Most recently modified records first.
  pub fn recently_updated(&self, limit: usize) -> Result<Vec<CachedRecord<T>>> {
    self.scan(
      Scan::new(Index::UpdatedAt, Direction::Descending)
        .prefix(entity_prefix::<T>())
        .limit(limit),
    )
  }

  fn scan(&self, scan: Scan) -> Result<Vec<CachedRecord<T>>> {
    self
      .engine
      .store()
      .scan(&scan)?
      .into_iter()
      .map(|value| serde_json::from_value(value).map_err(Into::into))
      .collect()
  }

  fn record_ops(
    &self,
    record: &T,
    now: DateTime<Utc>,
    position: usize,
    source: ItemSource,
  ) -> Result<Vec<WriteOp>> {
    let id = record.cache_key();
    let key = entity_key::<T>(&id);
    let bytes = serde_json::to_vec(record)?;
    let cached = CachedRecord {
      entity_type: T::entity_type().to_string(),
      id,
      cached_at: now,
      position,
      updated_at: record.updated_at(),
      data: record.clone(),
    };
    let meta = ItemMeta::describe(&key, &bytes, now, source);

    Ok(vec![
      WriteOp::put(Partition::Entities, key.clone(), serde_json::to_value(&cached)?),
      WriteOp::put(
        Partition::Meta,
        metadata::item_key(&key),
        serde_json::to_value(&meta)?,
      ),
    ])
  }
}
