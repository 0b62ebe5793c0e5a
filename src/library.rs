//! The clause library: everything a front end needs, wired together.
//!
//! Writes are optimistic: the local cache and history change first, then the
//! change is sent to the remote or queued in the outbox when it cannot be
//! sent right now.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{Config, SyncConfig};
use crate::detached::spawn_detached;
use crate::engine::CacheEngine;
use crate::entities::EntityCache;
use crate::error::{CacheError, Result};
use crate::loader::{LoadOrchestrator, LoadResult};
use crate::metadata::ItemSource;
use crate::outbox::{
  DrainPolicy, DrainSummary, NewOperation, OperationKind, OutboxOperation, SyncOutbox,
};
use crate::remote::{Clause, ClauseDraft, Remote};
use crate::usage::{UsageEntry, UsageLedger};
use crate::versions::{VersionHistory, VersionSnapshot};

/// The editing surface clause text is inserted into.
pub trait DocumentHost {
  fn apply_to_document(&self, text: &str) -> Result<()>;
}

/// What happened to the remote side of a local write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
  /// The remote acknowledged the change
  Applied,
  /// Waiting in the outbox under this operation id
  Queued(String),
  /// Cancelled out against an unsent queued operation; the remote never
  /// needs to hear about it
  Cancelled,
}

#[derive(Debug, Clone)]
pub struct WriteOutcome {
  pub clause: Clause,
  pub version: VersionSnapshot,
  pub delivery: Delivery,
}

/// Result of inserting a clause into a document.
#[derive(Debug)]
pub struct Insertion {
  pub clause: Clause,
  /// Mirror of the use to the remote, if sync is enabled
  pub mirror: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone)]
pub struct LibraryOptions {
  /// Recorded on version snapshots
  pub author: String,
  pub sync: SyncConfig,
  pub request_timeout: Duration,
}

impl Default for LibraryOptions {
  fn default() -> Self {
    Self {
      author: "local".to_string(),
      sync: SyncConfig::default(),
      request_timeout: Duration::from_secs(10),
    }
  }
}

impl LibraryOptions {
  pub fn from_config(config: &Config) -> Self {
    Self {
      author: config.author(),
      sync: config.sync.clone(),
      request_timeout: config.api.request_timeout(),
    }
  }
}

pub struct ClauseLibrary<R> {
  engine: CacheEngine,
  remote: Arc<R>,
  cache: EntityCache<Clause>,
  loader: LoadOrchestrator<Clause>,
  usage: UsageLedger,
  history: VersionHistory,
  outbox: SyncOutbox,
  policy: DrainPolicy,
  sync_enabled: AtomicBool,
}

impl<R: Remote> ClauseLibrary<R> {
  pub fn new(engine: CacheEngine, remote: Arc<R>, options: LibraryOptions) -> Self {
    Self {
      cache: EntityCache::new(engine.clone()),
      loader: LoadOrchestrator::new(engine.clone()).with_timeout(options.request_timeout),
      usage: UsageLedger::new(engine.clone()),
      history: VersionHistory::new(engine.clone(), options.author),
      outbox: SyncOutbox::new(engine.clone()),
      policy: DrainPolicy::from_config(&options.sync),
      sync_enabled: AtomicBool::new(options.sync.enabled),
      engine,
      remote,
    }
  }

  pub fn engine(&self) -> &CacheEngine {
    &self.engine
  }

  pub fn cache(&self) -> &EntityCache<Clause> {
    &self.cache
  }

  pub fn usage(&self) -> &UsageLedger {
    &self.usage
  }

  pub fn outbox(&self) -> &SyncOutbox {
    &self.outbox
  }

  pub fn policy(&self) -> &DrainPolicy {
    &self.policy
  }

  pub fn sync_enabled(&self) -> bool {
    self.sync_enabled.load(Ordering::SeqCst)
  }

  /// While disabled every mutation is queued instead of sent.
  pub fn set_sync_enabled(&self, enabled: bool) {
    self.sync_enabled.store(enabled, Ordering::SeqCst);
  }

  /// The clause collection, stale-while-revalidate.
  pub async fn load(&self) -> Result<LoadResult<Clause>> {
    let remote = Arc::clone(&self.remote);
    self
      .loader
      .load(move || async move { remote.list().await })
      .await
  }

  pub fn get(&self, id: &str) -> Result<Option<Clause>> {
    Ok(self.cache.get(id)?.map(|record| record.data))
  }

  pub async fn create(&self, draft: ClauseDraft) -> Result<WriteOutcome> {
    let id = uuid::Uuid::new_v4().to_string();
    let clause = draft.into_clause(id, self.engine.now());
    self.save(clause, OperationKind::Create, Some("Created")).await
  }

  /// Replace a cached clause with an edited copy.
  pub async fn update(&self, clause: Clause, change_note: Option<&str>) -> Result<WriteOutcome> {
    if self.cache.get(&clause.id)?.is_none() {
      return Err(CacheError::NotFound(format!("clause {}", clause.id)));
    }
    self.save(clause, OperationKind::Update, change_note).await
  }

  pub async fn delete(&self, id: &str) -> Result<WriteOutcome> {
    let existing = self
      .get(id)?
      .ok_or_else(|| CacheError::NotFound(format!("clause {}", id)))?;

    let version = self.history.save_version(&existing, Some("Deleted"))?;
    self.cache.remove(id)?;
    let delivery = self.deliver(NewOperation::delete(id)).await?;
    info!(id, ?delivery, "deleted clause");

    Ok(WriteOutcome {
      clause: existing,
      version,
      delivery,
    })
  }

  /// Make a snapshot the current state of its clause again. A clause that
  /// was deleted since is recreated.
  pub async fn restore(&self, version_id: &str) -> Result<WriteOutcome> {
    let snapshot = self
      .history
      .get_version(version_id)?
      .ok_or_else(|| CacheError::NotFound(format!("version {}", version_id)))?;
    let clause: Clause = snapshot.restore()?;

    let kind = if self.cache.get(&clause.id)?.is_some() {
      OperationKind::Update
    } else {
      OperationKind::Create
    };
    let note = format!("Restored from {}", version_id);
    self.save(clause, kind, Some(&note)).await
  }

  pub fn history(&self, id: &str, limit: Option<usize>) -> Result<Vec<VersionSnapshot>> {
    self.history.list_versions(id, limit)
  }

  /// Insert a clause's body into the document and count the use.
  ///
  /// Counting is best-effort: a failed ledger write is reported to the
  /// engine's error sink and the insertion still succeeds. The remote is
  /// told about the use in the background. Must run inside a Tokio runtime.
  pub fn insert_into(&self, id: &str, host: &dyn DocumentHost) -> Result<Insertion> {
    let clause = self
      .get(id)?
      .ok_or_else(|| CacheError::NotFound(format!("clause {}", id)))?;

    host.apply_to_document(&clause.body)?;

    if let Err(error) = self.usage.record_use(id) {
      self.engine.report("record_use", &error);
    }

    let mirror = self.sync_enabled().then(|| {
      let remote = Arc::clone(&self.remote);
      let id = id.to_string();
      spawn_detached(self.engine.error_sink(), "remote_use", async move {
        remote.record_use(&id).await
      })
    });

    Ok(Insertion { clause, mirror })
  }

  /// Most used clauses that are still cached, with their usage.
  pub fn most_used(&self, limit: usize) -> Result<Vec<(Clause, UsageEntry)>> {
    self.join_usage(self.usage.most_frequently_used(limit)?)
  }

  pub fn recently_used(&self, limit: usize) -> Result<Vec<(Clause, UsageEntry)>> {
    self.join_usage(self.usage.most_recently_used(limit)?)
  }

  /// Replay the outbox against the remote.
  ///
  /// Failures other than connectivity problems are recorded as conflicts on
  /// the operation and left for the user to resolve.
  pub async fn sync(&self) -> Result<DrainSummary> {
    let remote = Arc::clone(&self.remote);
    self
      .outbox
      .drain(&self.policy, move |op| {
        let remote = Arc::clone(&remote);
        async move { replay(remote.as_ref(), op).await }
      })
      .await
  }

  async fn save(
    &self,
    mut clause: Clause,
    kind: OperationKind,
    change_note: Option<&str>,
  ) -> Result<WriteOutcome> {
    clause.updated_at = Some(self.engine.now());
    self.cache.upsert(&clause, ItemSource::Local)?;
    let version = self.history.save_version(&clause, change_note)?;

    let payload = serde_json::to_value(&clause)?;
    let op = match kind {
      OperationKind::Create => NewOperation::create(clause.id.clone(), payload),
      _ => NewOperation::update(clause.id.clone(), payload),
    };
    let delivery = self.deliver(op).await?;
    info!(id = %clause.id, kind = kind.as_str(), ?delivery, "saved clause");

    Ok(WriteOutcome {
      clause,
      version,
      delivery,
    })
  }

  /// Send a mutation now, or queue it. A write the remote fails or rejects
  /// is queued too; a rejection then surfaces as a conflict on replay.
  ///
  /// Unsent queued operations for the same record are superseded first: an
  /// update replaces a queued update or folds into a queued create, and a
  /// delete drops queued updates and cancels out against a queued create.
  /// An operation a sync is sending right now is left alone and the new one
  /// queues behind it.
  async fn deliver(&self, op: NewOperation) -> Result<Delivery> {
    let mut queued = self.outbox.pending_for(&op.record_id)?;

    match op.kind {
      OperationKind::Update => {
        if let Some(last) = queued
          .last()
          .filter(|last| last.is_unsent() && last.kind != OperationKind::Delete)
        {
          if let Some(folded) = self
            .outbox
            .replace_payload(&last.operation_id, op.payload.clone())?
          {
            debug!(operation_id = %folded.operation_id, "folded update into queued operation");
            return Ok(Delivery::Queued(folded.operation_id));
          }
        }
      }
      OperationKind::Delete => {
        while let Some(last) = queued.last() {
          if !last.is_unsent() || last.kind == OperationKind::Delete {
            break;
          }
          let (operation_id, kind) = (last.operation_id.clone(), last.kind);
          if !self.outbox.withdraw(&operation_id)? {
            break;
          }
          queued.pop();
          debug!(%operation_id, "dropped queued operation superseded by delete");
          if kind == OperationKind::Create {
            if queued.is_empty() {
              return Ok(Delivery::Cancelled);
            }
            break;
          }
        }
      }
      OperationKind::Create => {}
    }

    if !self.sync_enabled() || !queued.is_empty() {
      return self.enqueue(op);
    }

    match send(self.remote.as_ref(), op.kind, &op.record_id, &op.payload).await {
      Ok(Some(acknowledged)) => {
        self.cache.upsert(&acknowledged, ItemSource::Network)?;
        Ok(Delivery::Applied)
      }
      Ok(None) => Ok(Delivery::Applied),
      // The local write already happened; the remote catches up from the outbox
      Err(error @ (CacheError::NetworkUnreachable(_) | CacheError::Remote { .. })) => {
        info!(record_id = %op.record_id, error = %error, "remote write failed, queueing");
        self.enqueue(op)
      }
      Err(error) => Err(error),
    }
  }

  fn enqueue(&self, op: NewOperation) -> Result<Delivery> {
    let queued = self.outbox.enqueue(op)?;
    Ok(Delivery::Queued(queued.operation_id))
  }

  fn join_usage(&self, entries: Vec<UsageEntry>) -> Result<Vec<(Clause, UsageEntry)>> {
    let mut joined = Vec::with_capacity(entries.len());
    for entry in entries {
      if let Some(clause) = self.get(&entry.record_id)? {
        joined.push((clause, entry));
      }
    }
    Ok(joined)
  }
}

async fn send<R: Remote>(
  remote: &R,
  kind: OperationKind,
  record_id: &str,
  payload: &serde_json::Value,
) -> Result<Option<Clause>> {
  match kind {
    OperationKind::Create => {
      let clause: Clause = serde_json::from_value(payload.clone())?;
      remote.create(&clause).await.map(Some)
    }
    OperationKind::Update => {
      let clause: Clause = serde_json::from_value(payload.clone())?;
      remote.update(&clause).await.map(Some)
    }
    OperationKind::Delete => remote.delete(record_id).await.map(|()| None),
  }
}

async fn replay<R: Remote>(remote: &R, op: OutboxOperation) -> Result<()> {
  debug!(operation_id = %op.operation_id, kind = op.kind.as_str(), "replaying");
  match send(remote, op.kind, &op.record_id, &op.payload).await {
    Ok(_) => Ok(()),
    Err(error) if error.is_transient() => Err(error),
    Err(error) => Err(CacheError::ConflictOnReplay {
      operation_id: op.operation_id,
      reason: error.to_string(),
    }),
  }
}
