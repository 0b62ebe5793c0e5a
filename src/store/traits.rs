//! Partition, index and store trait definitions.

use serde_json::Value;
use std::cmp::Ordering;

use crate::error::{CacheError, Result};

/// Named partitions of the local store. Each is keyed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Partition {
  /// Cached remote records, keyed by `{entity_type}/{id}`
  Entities,
  /// Per-record usage entries, keyed by record id
  Usage,
  /// Version snapshots, keyed by version id
  Versions,
  /// Singleton values and per-item cache metadata
  Meta,
  /// Pending remote operations, keyed by operation id
  Outbox,
}

impl Partition {
  pub const ALL: [Partition; 5] = [
    Partition::Entities,
    Partition::Usage,
    Partition::Versions,
    Partition::Meta,
    Partition::Outbox,
  ];

  pub fn name(&self) -> &'static str {
    match self {
      Partition::Entities => "entities",
      Partition::Usage => "usage",
      Partition::Versions => "versions",
      Partition::Meta => "meta",
      Partition::Outbox => "outbox",
    }
  }
}

/// Secondary indexes. Each belongs to exactly one partition and orders
/// values by one field of the stored JSON document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Index {
  Category,
  Client,
  UpdatedAt,
  UseCount,
  LastUsed,
  RecordId,
  CreatedAt,
  Timestamp,
  Sequence,
}

impl Index {
  pub fn partition(&self) -> Partition {
    match self {
      Index::Category | Index::Client | Index::UpdatedAt => Partition::Entities,
      Index::UseCount | Index::LastUsed => Partition::Usage,
      Index::RecordId | Index::CreatedAt => Partition::Versions,
      Index::Timestamp => Partition::Meta,
      Index::Sequence => Partition::Outbox,
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      Index::Category => "category",
      Index::Client => "client",
      Index::UpdatedAt => "updated_at",
      Index::UseCount => "use_count",
      Index::LastUsed => "last_used",
      Index::RecordId => "record_id",
      Index::CreatedAt => "created_at",
      Index::Timestamp => "timestamp",
      Index::Sequence => "sequence",
    }
  }

  /// SQLite JSON path of the indexed field.
  pub fn json_path(&self) -> &'static str {
    match self {
      Index::Category => "$.data.category",
      Index::Client => "$.data.client_id",
      Index::UpdatedAt => "$.updated_at",
      Index::UseCount => "$.use_count",
      Index::LastUsed => "$.last_used",
      Index::RecordId => "$.record_id",
      Index::CreatedAt => "$.created_at",
      Index::Timestamp => "$.timestamp",
      Index::Sequence => "$.sequence",
    }
  }

  /// JSON pointer of the indexed field, for in-memory evaluation.
  pub fn pointer(&self) -> &'static str {
    match self {
      Index::Category => "/data/category",
      Index::Client => "/data/client_id",
      Index::UpdatedAt => "/updated_at",
      Index::UseCount => "/use_count",
      Index::LastUsed => "/last_used",
      Index::RecordId => "/record_id",
      Index::CreatedAt => "/created_at",
      Index::Timestamp => "/timestamp",
      Index::Sequence => "/sequence",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  Ascending,
  Descending,
}

/// An ordered traversal of one partition along one of its indexes.
#[derive(Debug, Clone)]
pub struct Scan {
  pub index: Index,
  pub direction: Direction,
  /// Keep only values whose `filter.0` field equals `filter.1`
  pub filter: Option<(Index, Value)>,
  /// Keep only keys starting with this prefix
  pub prefix: Option<String>,
  pub limit: Option<usize>,
}

impl Scan {
  pub fn new(index: Index, direction: Direction) -> Self {
    Self {
      index,
      direction,
      filter: None,
      prefix: None,
      limit: None,
    }
  }

  pub fn filter(mut self, index: Index, value: impl Into<Value>) -> Self {
    self.filter = Some((index, value.into()));
    self
  }

  pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefix = Some(prefix.into());
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn partition(&self) -> Partition {
    self.index.partition()
  }

  /// Reject filters on an index of another partition.
  pub(crate) fn validate(&self) -> Result<()> {
    if let Some((filter, _)) = &self.filter {
      if filter.partition() != self.partition() {
        return Err(CacheError::InvalidIndex {
          index: *filter,
          partition: self.partition(),
        });
      }
    }
    Ok(())
  }
}

/// One write inside an atomic batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
  Put {
    partition: Partition,
    key: String,
    value: Value,
  },
  Delete {
    partition: Partition,
    key: String,
  },
  /// Delete every key of the partition starting with `prefix`
  ClearPrefix { partition: Partition, prefix: String },
}

impl WriteOp {
  pub fn put(partition: Partition, key: impl Into<String>, value: Value) -> Self {
    WriteOp::Put {
      partition,
      key: key.into(),
      value,
    }
  }

  pub fn delete(partition: Partition, key: impl Into<String>) -> Self {
    WriteOp::Delete {
      partition,
      key: key.into(),
    }
  }

  pub fn clear_prefix(partition: Partition, prefix: impl Into<String>) -> Self {
    WriteOp::ClearPrefix {
      partition,
      prefix: prefix.into(),
    }
  }
}

/// Read-modify-write callback for [`PartitionStore::update`].
///
/// Receives the current value (if any) and returns the new value; `None`
/// deletes the key. Returning an error aborts the update without writing.
pub type UpdateFn<'a> = dyn FnMut(Option<Value>) -> Result<Option<Value>> + 'a;

/// Read-modify-write callback for [`PartitionStore::update_with`].
///
/// Like [`UpdateFn`], and additionally returns writes to other keys that
/// commit in the same transaction.
pub type UpdateWithFn<'a> =
  dyn FnMut(Option<Value>) -> Result<(Option<Value>, Vec<WriteOp>)> + 'a;

/// Durable, schema-free key-value store organized into partitions.
///
/// Implementations serialize concurrent transactions, so every method is
/// atomic with respect to every other.
pub trait PartitionStore: Send + Sync {
  fn get(&self, partition: Partition, key: &str) -> Result<Option<Value>>;

  /// All values of a partition, ordered by key.
  fn get_all(&self, partition: Partition) -> Result<Vec<Value>> {
    Ok(
      self
        .get_prefix(partition, "")?
        .into_iter()
        .map(|(_, value)| value)
        .collect(),
    )
  }

  /// All `(key, value)` pairs whose key starts with `prefix`, ordered by key.
  fn get_prefix(&self, partition: Partition, prefix: &str) -> Result<Vec<(String, Value)>>;

  /// Ordered traversal along an index.
  fn scan(&self, scan: &Scan) -> Result<Vec<Value>>;

  /// Apply all writes in one transaction: either all are visible or none.
  fn apply(&self, ops: Vec<WriteOp>) -> Result<()>;

  /// Atomic read-modify-write of `key` plus the extra writes the callback
  /// returns, all in one transaction. Returns the value written to `key`.
  fn update_with(
    &self,
    partition: Partition,
    key: &str,
    f: &mut UpdateWithFn<'_>,
  ) -> Result<Option<Value>>;

  /// Atomic read-modify-write of a single key. Returns the value written.
  fn update(
    &self,
    partition: Partition,
    key: &str,
    f: &mut UpdateFn<'_>,
  ) -> Result<Option<Value>> {
    let mut only_key = |current: Option<Value>| -> Result<(Option<Value>, Vec<WriteOp>)> {
      Ok((f(current)?, Vec::new()))
    };
    self.update_with(partition, key, &mut only_key)
  }

  fn put(&self, partition: Partition, key: &str, value: &Value) -> Result<()> {
    self.apply(vec![WriteOp::put(partition, key, value.clone())])
  }

  fn delete(&self, partition: Partition, key: &str) -> Result<()> {
    self.apply(vec![WriteOp::delete(partition, key)])
  }

  /// Whole-partition traversal in index order.
  fn iterate(
    &self,
    partition: Partition,
    index: Index,
    direction: Direction,
  ) -> Result<Vec<Value>> {
    if index.partition() != partition {
      return Err(CacheError::InvalidIndex { index, partition });
    }
    self.scan(&Scan::new(index, direction))
  }
}

/// Ordering of indexed JSON fields: missing/null, then booleans, numbers, strings.
pub(crate) fn compare_indexed(a: Option<&Value>, b: Option<&Value>) -> Ordering {
  fn rank(v: Option<&Value>) -> u8 {
    match v {
      None | Some(Value::Null) => 0,
      Some(Value::Bool(_)) => 1,
      Some(Value::Number(_)) => 2,
      Some(Value::String(_)) => 3,
      Some(_) => 4,
    }
  }

  match (a, b) {
    (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
    (Some(Value::Number(x)), Some(Value::Number(y))) => {
      match (x.as_i64(), y.as_i64()) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => x
          .as_f64()
          .unwrap_or(0.0)
          .partial_cmp(&y.as_f64().unwrap_or(0.0))
          .unwrap_or(Ordering::Equal),
      }
    }
    (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
    _ => rank(a).cmp(&rank(b)),
  }
}
