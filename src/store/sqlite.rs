//! SQLite implementation of the partitioned store.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{Direction, Partition, PartitionStore, Scan, UpdateWithFn, WriteOp};
use crate::error::{CacheError, Result};

/// SQLite-backed partitioned store.
///
/// Every partition lives in one `kv` table; values are JSON documents and
/// each secondary index is a JSON expression index.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`.
  ///
  /// `max_pages` caps the database size; writes beyond it fail with
  /// [`CacheError::QuotaExceeded`].
  pub fn open(path: &Path, max_pages: Option<u32>) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        CacheError::StorageUnavailable(format!("Failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::StorageUnavailable(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;

    Self::init(conn, max_pages)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory(max_pages: Option<u32>) -> Result<Self> {
    Self::init(Connection::open_in_memory()?, max_pages)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| {
        CacheError::StorageUnavailable("Could not determine data directory".to_string())
      })?;

    Ok(data_dir.join("clausebook").join("cache.db"))
  }

  fn init(conn: Connection, max_pages: Option<u32>) -> Result<Self> {
    conn.execute_batch(SCHEMA)?;
    if let Some(pages) = max_pages {
      conn.execute_batch(&format!("PRAGMA max_page_count = {};", pages))?;
    }
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| CacheError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }
}

/// Schema for the partitioned store.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    partition TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (partition, key)
);

-- entities
CREATE INDEX IF NOT EXISTS idx_entities_category
    ON kv(partition, json_extract(value, '$.data.category'));
CREATE INDEX IF NOT EXISTS idx_entities_client
    ON kv(partition, json_extract(value, '$.data.client_id'));
CREATE INDEX IF NOT EXISTS idx_entities_updated_ms
    ON kv(partition, json_extract(value, '$.updated_at'));

-- usage
CREATE INDEX IF NOT EXISTS idx_usage_count
    ON kv(partition, json_extract(value, '$.use_count'));
CREATE INDEX IF NOT EXISTS idx_usage_last_used
    ON kv(partition, json_extract(value, '$.last_used'));

-- versions
CREATE INDEX IF NOT EXISTS idx_versions_record
    ON kv(partition, json_extract(value, '$.record_id'), json_extract(value, '$.created_at'));

-- meta (per-item cache metadata)
CREATE INDEX IF NOT EXISTS idx_meta_timestamp
    ON kv(partition, json_extract(value, '$.timestamp'));

-- outbox
CREATE INDEX IF NOT EXISTS idx_outbox_sequence
    ON kv(partition, json_extract(value, '$.sequence'));
"#;

fn decode(raw: String) -> Result<Value> {
  Ok(serde_json::from_str(&raw)?)
}

/// Convert a JSON scalar to the value `json_extract` yields for it.
fn json_to_sql(value: &Value) -> SqlValue {
  match value {
    Value::Null => SqlValue::Null,
    Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
    Value::Number(n) => match n.as_i64() {
      Some(i) => SqlValue::Integer(i),
      None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
    },
    Value::String(s) => SqlValue::Text(s.clone()),
    other => SqlValue::Text(other.to_string()),
  }
}

fn write_op(tx: &Transaction<'_>, op: &WriteOp) -> Result<()> {
  match op {
    WriteOp::Put {
      partition,
      key,
      value,
    } => {
      let raw = serde_json::to_string(value)?;
      tx.execute(
        "INSERT OR REPLACE INTO kv (partition, key, value) VALUES (?1, ?2, ?3)",
        params![partition.name(), key, raw],
      )?;
    }
    WriteOp::Delete { partition, key } => {
      tx.execute(
        "DELETE FROM kv WHERE partition = ?1 AND key = ?2",
        params![partition.name(), key],
      )?;
    }
    WriteOp::ClearPrefix { partition, prefix } => {
      tx.execute(
        "DELETE FROM kv WHERE partition = ?1 AND substr(key, 1, length(?2)) = ?2",
        params![partition.name(), prefix],
      )?;
    }
  }
  Ok(())
}

impl PartitionStore for SqliteStore {
  fn get(&self, partition: Partition, key: &str) -> Result<Option<Value>> {
    let conn = self.lock()?;
    let raw: Option<String> = conn
      .query_row(
        "SELECT value FROM kv WHERE partition = ?1 AND key = ?2",
        params![partition.name(), key],
        |row| row.get(0),
      )
      .optional()?;
    raw.map(decode).transpose()
  }

  fn get_prefix(&self, partition: Partition, prefix: &str) -> Result<Vec<(String, Value)>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT key, value FROM kv
       WHERE partition = ?1 AND substr(key, 1, length(?2)) = ?2
       ORDER BY key",
    )?;

    let rows = stmt
      .query_map(params![partition.name(), prefix], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    rows
      .into_iter()
      .map(|(key, raw)| Ok((key, decode(raw)?)))
      .collect()
  }

  fn scan(&self, scan: &Scan) -> Result<Vec<Value>> {
    scan.validate()?;

    let mut sql = String::from("SELECT value FROM kv WHERE partition = ?1");
    let mut args = vec![SqlValue::Text(scan.partition().name().to_string())];

    if let Some(prefix) = &scan.prefix {
      args.push(SqlValue::Text(prefix.clone()));
      let n = args.len();
      sql.push_str(&format!(" AND substr(key, 1, length(?{n})) = ?{n}"));
    }
    if let Some((index, expected)) = &scan.filter {
      args.push(json_to_sql(expected));
      sql.push_str(&format!(
        " AND json_extract(value, '{}') = ?{}",
        index.json_path(),
        args.len()
      ));
    }

    let order = match scan.direction {
      Direction::Ascending => "ASC",
      Direction::Descending => "DESC",
    };
    sql.push_str(&format!(
      " ORDER BY json_extract(value, '{}') {order}, key {order}",
      scan.index.json_path()
    ));

    if let Some(limit) = scan.limit {
      args.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
      sql.push_str(&format!(" LIMIT ?{}", args.len()));
    }

    let conn = self.lock()?;
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
      .query_map(params_from_iter(args), |row| row.get::<_, String>(0))?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter().map(decode).collect()
  }

  fn apply(&self, ops: Vec<WriteOp>) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    for op in &ops {
      write_op(&tx, op)?;
    }
    tx.commit()?;
    Ok(())
  }

  fn update_with(
    &self,
    partition: Partition,
    key: &str,
    f: &mut UpdateWithFn<'_>,
  ) -> Result<Option<Value>> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let raw: Option<String> = tx
      .query_row(
        "SELECT value FROM kv WHERE partition = ?1 AND key = ?2",
        params![partition.name(), key],
        |row| row.get(0),
      )
      .optional()?;
    let current = raw.map(decode).transpose()?;

    // An error from `f` drops the transaction, which rolls it back
    let (next, writes) = f(current)?;
    match &next {
      Some(value) => write_op(&tx, &WriteOp::put(partition, key, value.clone()))?,
      None => write_op(&tx, &WriteOp::delete(partition, key))?,
    }
    for op in &writes {
      write_op(&tx, op)?;
    }
    tx.commit()?;

    Ok(next)
  }
}
