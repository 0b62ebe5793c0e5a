//! In-memory store used when durable storage is unavailable.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::traits::{
  compare_indexed, Direction, Partition, PartitionStore, Scan, UpdateWithFn, WriteOp,
};
use crate::error::{CacheError, Result};

type Partitions = HashMap<Partition, BTreeMap<String, Value>>;

/// Store that keeps everything in process memory.
/// Same semantics as the SQLite store, nothing survives the session.
#[derive(Default)]
pub struct MemoryStore {
  partitions: Mutex<Partitions>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Partitions>> {
    self
      .partitions
      .lock()
      .map_err(|e| CacheError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }
}

fn apply_op(partitions: &mut Partitions, op: WriteOp) {
  match op {
    WriteOp::Put {
      partition,
      key,
      value,
    } => {
      partitions.entry(partition).or_default().insert(key, value);
    }
    WriteOp::Delete { partition, key } => {
      if let Some(map) = partitions.get_mut(&partition) {
        map.remove(&key);
      }
    }
    WriteOp::ClearPrefix { partition, prefix } => {
      if let Some(map) = partitions.get_mut(&partition) {
        map.retain(|key, _| !key.starts_with(&prefix));
      }
    }
  }
}

impl PartitionStore for MemoryStore {
  fn get(&self, partition: Partition, key: &str) -> Result<Option<Value>> {
    let partitions = self.lock()?;
    Ok(partitions.get(&partition).and_then(|map| map.get(key)).cloned())
  }

  fn get_prefix(&self, partition: Partition, prefix: &str) -> Result<Vec<(String, Value)>> {
    let partitions = self.lock()?;
    Ok(
      partitions
        .get(&partition)
        .map(|map| {
          map
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  fn scan(&self, scan: &Scan) -> Result<Vec<Value>> {
    scan.validate()?;
    let partitions = self.lock()?;
    let Some(map) = partitions.get(&scan.partition()) else {
      return Ok(Vec::new());
    };

    let mut rows: Vec<(&String, &Value)> = map
      .iter()
      .filter(|(key, _)| {
        scan
          .prefix
          .as_deref()
          .map_or(true, |prefix| key.starts_with(prefix))
      })
      .filter(|(_, value)| match &scan.filter {
        Some((index, expected)) => value.pointer(index.pointer()) == Some(expected),
        None => true,
      })
      .collect();

    let pointer = scan.index.pointer();
    rows.sort_by(|(ka, a), (kb, b)| {
      compare_indexed(a.pointer(pointer), b.pointer(pointer)).then_with(|| ka.cmp(kb))
    });
    if scan.direction == Direction::Descending {
      rows.reverse();
    }

    let limit = scan.limit.unwrap_or(usize::MAX);
    Ok(
      rows
        .into_iter()
        .take(limit)
        .map(|(_, value)| value.clone())
        .collect(),
    )
  }

  fn apply(&self, ops: Vec<WriteOp>) -> Result<()> {
    let mut partitions = self.lock()?;
    for op in ops {
      apply_op(&mut partitions, op);
    }
    Ok(())
  }

  fn update_with(
    &self,
    partition: Partition,
    key: &str,
    f: &mut UpdateWithFn<'_>,
  ) -> Result<Option<Value>> {
    let mut partitions = self.lock()?;
    let current = partitions.get(&partition).and_then(|map| map.get(key)).cloned();
    let (next, writes) = f(current)?;
    let own = match &next {
      Some(value) => WriteOp::put(partition, key, value.clone()),
      None => WriteOp::delete(partition, key),
    };
    apply_op(&mut partitions, own);
    for op in writes {
      apply_op(&mut partitions, op);
    }
    Ok(next)
  }
}
