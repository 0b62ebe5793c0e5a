//! Sync metadata kept in the `meta` partition.
//!
//! Two kinds of records live here:
//! - `sync:{entity_type}` holds the time of the last successful full refresh
//! - `item:{entity_key}` tracks one cached item (timestamp, size, etag, source)
//!   and drives quota eviction

use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CacheError, Result};
use crate::store::{Direction, Index, Partition, PartitionStore, Scan, WriteOp};

const SYNC_PREFIX: &str = "sync:";
const ITEM_PREFIX: &str = "item:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
  #[serde(with = "ts_milliseconds")]
  pub last_sync: DateTime<Utc>,
}

/// Where a cached item's current content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemSource {
  /// Fetched from the remote service
  Network,
  /// Written locally, possibly not yet acknowledged by the remote
  Local,
}

/// Bookkeeping for one cached item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMeta {
  /// Key of the tracked value in the `entities` partition
  pub key: String,
  #[serde(with = "ts_milliseconds")]
  pub timestamp: DateTime<Utc>,
  /// Serialized size in bytes
  pub size: usize,
  pub etag: String,
  pub source: ItemSource,
}

impl ItemMeta {
  pub fn describe(key: &str, bytes: &[u8], timestamp: DateTime<Utc>, source: ItemSource) -> Self {
    Self {
      key: key.to_string(),
      timestamp,
      size: bytes.len(),
      etag: etag_for(bytes),
      source,
    }
  }
}

/// SHA256 content tag, stable across processes.
pub fn etag_for(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  hex::encode(hasher.finalize())
}

pub fn sync_key(entity_type: &str) -> String {
  format!("{}{}", SYNC_PREFIX, entity_type)
}

pub fn item_key(entity_key: &str) -> String {
  format!("{}{}", ITEM_PREFIX, entity_key)
}

/// Item-metadata key prefix covering every item of an entity type.
pub fn item_prefix(entity_type: &str) -> String {
  format!("{}{}/", ITEM_PREFIX, entity_type)
}

pub fn read_sync_state(store: &dyn PartitionStore, entity_type: &str) -> Result<Option<SyncState>> {
  store
    .get(Partition::Meta, &sync_key(entity_type))?
    .map(serde_json::from_value)
    .transpose()
    .map_err(Into::into)
}

pub fn read_item(store: &dyn PartitionStore, entity_key: &str) -> Result<Option<ItemMeta>> {
  store
    .get(Partition::Meta, &item_key(entity_key))?
    .map(serde_json::from_value)
    .transpose()
    .map_err(Into::into)
}

/// Every tracked item, oldest first.
pub fn tracked_items(store: &dyn PartitionStore) -> Result<Vec<ItemMeta>> {
  let scan = Scan::new(Index::Timestamp, Direction::Ascending).prefix(ITEM_PREFIX);
  store
    .scan(&scan)?
    .into_iter()
    .map(|value| serde_json::from_value::<ItemMeta>(value).map_err(CacheError::from))
    .collect()
}

/// Drop the oldest half (rounded up) of tracked items together with the
/// cached values they describe. Returns the evicted entity keys.
pub fn evict_oldest_half(store: &dyn PartitionStore) -> Result<Vec<String>> {
  let items = tracked_items(store)?;
  let count = items.len().div_ceil(2);

  let evicted: Vec<String> = items.into_iter().take(count).map(|item| item.key).collect();
  if evicted.is_empty() {
    return Ok(evicted);
  }

  let ops = evicted
    .iter()
    .flat_map(|key| {
      [
        WriteOp::delete(Partition::Meta, item_key(key)),
        WriteOp::delete(Partition::Entities, key.clone()),
      ]
    })
    .collect();
  store.apply(ops)?;

  Ok(evicted)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::from_millis;
  use crate::store::MemoryStore;
  use serde_json::json;

  fn track(store: &dyn PartitionStore, key: &str, at: i64) {
    let meta = ItemMeta::describe(key, key.as_bytes(), from_millis(at), ItemSource::Network);
    store
      .apply(vec![
        WriteOp::put(Partition::Entities, key, json!({ "id": key })),
        WriteOp::put(Partition::Meta, item_key(key), serde_json::to_value(&meta).unwrap()),
      ])
      .unwrap();
  }

  #[test]
  fn test_etag_is_stable_hex_sha256() {
    assert_eq!(etag_for(b"abc"), etag_for(b"abc"));
    assert_ne!(etag_for(b"abc"), etag_for(b"abd"));
    assert_eq!(etag_for(b"").len(), 64);
  }

  #[test]
  fn test_evicts_oldest_half_with_their_items() {
    let store = MemoryStore::new();
    // Insert out of order; eviction goes by timestamp, not key
    for (key, at) in [("clause/c", 30), ("clause/a", 10), ("clause/d", 40), ("clause/b", 20)] {
      track(&store, key, at);
    }
    store
      .put(Partition::Meta, &sync_key("clause"), &json!({"last_sync": 1}))
      .unwrap();

    let evicted = evict_oldest_half(&store).unwrap();
    assert_eq!(evicted, vec!["clause/a", "clause/b"]);

    let remaining: Vec<String> = tracked_items(&store)
      .unwrap()
      .into_iter()
      .map(|item| item.key)
      .collect();
    assert_eq!(remaining, vec!["clause/c", "clause/d"]);
    assert!(store.get(Partition::Entities, "clause/a").unwrap().is_none());
    assert!(store.get(Partition::Entities, "clause/c").unwrap().is_some());
    // The sync marker is not an item and survives
    assert!(read_sync_state(&store, "clause").unwrap().is_some());
  }

  #[test]
  fn test_odd_count_rounds_up() {
    let store = MemoryStore::new();
    for (key, at) in [("clause/a", 1), ("clause/b", 2), ("clause/c", 3)] {
      track(&store, key, at);
    }
    assert_eq!(evict_oldest_half(&store).unwrap().len(), 2);
    assert_eq!(evict_oldest_half(&store).unwrap().len(), 1);
    assert!(evict_oldest_half(&store).unwrap().is_empty());
  }
}
