//! Durable queue of remote mutations that have not reached the service yet.
//!
//! Operations are replayed in enqueue order. An operation leaves the queue
//! only once the remote acknowledged it, or when the user removes it.

use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::engine::CacheEngine;
use crate::error::{CacheError, Result};
use crate::store::{Direction, Index, Partition, Scan, WriteOp};

const SEQUENCE_KEY: &str = "outbox:seq";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  Create,
  Update,
  Delete,
}

impl OperationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      OperationKind::Create => "create",
      OperationKind::Update => "update",
      OperationKind::Delete => "delete",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxOperation {
  pub operation_id: String,
  /// Enqueue order; replay follows it
  pub sequence: u64,
  pub kind: OperationKind,
  pub record_id: String,
  pub payload: Value,
  #[serde(with = "ts_milliseconds")]
  pub enqueued_at: DateTime<Utc>,
  /// Failed replays so far; never reset
  pub attempts: u32,
  /// Failed replays the remote rejected outright. Connectivity failures
  /// do not count here.
  #[serde(default)]
  pub conflicts: u32,
  /// Set while a drain is sending this operation
  #[serde(default)]
  pub in_flight: bool,
  #[serde(default, with = "ts_milliseconds_option")]
  pub last_attempt: Option<DateTime<Utc>>,
  #[serde(default)]
  pub last_error: Option<String>,
}

impl OutboxOperation {
  /// Never sent and not being sent, so a newer local change may still
  /// rewrite or withdraw it.
  pub fn is_unsent(&self) -> bool {
    self.attempts == 0 && !self.in_flight
  }
}

/// An operation about to be queued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
  pub kind: OperationKind,
  pub record_id: String,
  pub payload: Value,
}

impl NewOperation {
  pub fn create(record_id: impl Into<String>, payload: Value) -> Self {
    Self {
      kind: OperationKind::Create,
      record_id: record_id.into(),
      payload,
    }
  }

  pub fn update(record_id: impl Into<String>, payload: Value) -> Self {
    Self {
      kind: OperationKind::Update,
      record_id: record_id.into(),
      payload,
    }
  }

  pub fn delete(record_id: impl Into<String>) -> Self {
    Self {
      kind: OperationKind::Delete,
      record_id: record_id.into(),
      payload: Value::Null,
    }
  }
}

/// How a drain cycle treats failures.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainPolicy {
  /// Keep replaying operations of other records after a failure
  pub continue_on_failure: bool,
  /// Operations the remote rejected this many times are parked until removed
  pub max_attempts: Option<u32>,
  pub backoff_base: Duration,
  pub backoff_max: Duration,
}

impl DrainPolicy {
  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      continue_on_failure: config.continue_on_failure,
      max_attempts: Some(config.max_attempts),
      backoff_base: Duration::from_millis(config.backoff_base_ms),
      backoff_max: Duration::from_millis(config.backoff_max_ms),
    }
  }

  /// Replay everything right away and never give up on an operation.
  pub fn immediate() -> Self {
    Self {
      continue_on_failure: true,
      max_attempts: None,
      backoff_base: Duration::ZERO,
      backoff_max: Duration::ZERO,
    }
  }

  pub fn is_dead(&self, op: &OutboxOperation) -> bool {
    self.max_attempts.is_some_and(|max| op.conflicts >= max)
  }

  /// Wait after `attempts` failures: base * 2^(attempts - 1), capped.
  pub fn backoff(&self, attempts: u32) -> Duration {
    if attempts == 0 {
      return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
    self
      .backoff_base
      .checked_mul(factor)
      .unwrap_or(self.backoff_max)
      .min(self.backoff_max)
  }

  pub fn is_ready(&self, op: &OutboxOperation, now: DateTime<Utc>) -> bool {
    let wait = self.backoff(op.attempts);
    if wait.is_zero() {
      return true;
    }
    match (op.last_attempt, chrono::Duration::from_std(wait)) {
      (Some(last), Ok(wait)) => now >= last + wait,
      _ => true,
    }
  }
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainSummary {
  pub applied: usize,
  pub failed: usize,
  /// Skipped this cycle: backing off, or behind an earlier operation of the
  /// same record that did not go through
  pub deferred: usize,
  /// Operation ids parked after too many attempts
  pub dead_lettered: Vec<String>,
  /// The cycle ended before every operation was visited
  pub stopped_early: bool,
}

impl DrainSummary {
  pub fn is_clean(&self) -> bool {
    self.failed == 0 && self.deferred == 0 && self.dead_lettered.is_empty()
  }
}

#[derive(Clone)]
pub struct SyncOutbox {
  engine: CacheEngine,
  /// One drain at a time, so no operation is replayed twice concurrently
  draining: Arc<Mutex<()>>,
}

impl SyncOutbox {
  pub fn new(engine: CacheEngine) -> Self {
    Self {
      engine,
      draining: Arc::new(Mutex::new(())),
    }
  }

  /// Append an operation. The sequence number and the operation are
  /// written in one transaction.
  pub fn enqueue(&self, op: NewOperation) -> Result<OutboxOperation> {
    let mut queued = OutboxOperation {
      operation_id: uuid::Uuid::new_v4().to_string(),
      sequence: 0,
      kind: op.kind,
      record_id: op.record_id,
      payload: op.payload,
      enqueued_at: self.engine.now(),
      attempts: 0,
      conflicts: 0,
      in_flight: false,
      last_attempt: None,
      last_error: None,
    };

    let written = self.engine.write_with_eviction(|store| {
      let mut allocate = |current: Option<Value>| -> Result<(Option<Value>, Vec<WriteOp>)> {
        let sequence = current.and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        let op = OutboxOperation {
          sequence,
          ..queued.clone()
        };
        let write = WriteOp::put(
          Partition::Outbox,
          op.operation_id.clone(),
          serde_json::to_value(&op)?,
        );
        Ok((Some(Value::from(sequence)), vec![write]))
      };
      store.update_with(Partition::Meta, SEQUENCE_KEY, &mut allocate)
    })?;
    queued.sequence = written.and_then(|v| v.as_u64()).unwrap_or(0);

    debug!(
      operation_id = %queued.operation_id,
      kind = queued.kind.as_str(),
      record_id = %queued.record_id,
      "queued remote operation"
    );
    Ok(queued)
  }

  /// Every queued operation in replay order.
  pub fn list_pending(&self) -> Result<Vec<OutboxOperation>> {
    self
      .engine
      .store()
      .iterate(Partition::Outbox, Index::Sequence, Direction::Ascending)?
      .into_iter()
      .map(|value| serde_json::from_value(value).map_err(Into::into))
      .collect()
  }

  pub fn pending_for(&self, record_id: &str) -> Result<Vec<OutboxOperation>> {
    Ok(
      self
        .list_pending()?
        .into_iter()
        .filter(|op| op.record_id == record_id)
        .collect(),
    )
  }

  pub fn get(&self, operation_id: &str) -> Result<Option<OutboxOperation>> {
    self
      .engine
      .store()
      .get(Partition::Outbox, operation_id)?
      .map(serde_json::from_value)
      .transpose()
      .map_err(Into::into)
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.engine.store().get_all(Partition::Outbox)?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Count a failed replay. The operation stays queued.
  pub fn mark_attempt(&self, operation_id: &str) -> Result<OutboxOperation> {
    self.record_attempt(operation_id, None)
  }

  /// Count a failed replay and remember why it failed. A rejection by the
  /// remote also counts toward parking the operation.
  pub fn mark_failed(&self, operation_id: &str, error: &CacheError) -> Result<OutboxOperation> {
    self.record_attempt(operation_id, Some(error))
  }

  /// Swap the payload of an unsent operation, e.g. when a newer local edit
  /// supersedes it. Returns `None` without writing if the operation is gone
  /// or has been sent.
  pub fn replace_payload(
    &self,
    operation_id: &str,
    payload: Value,
  ) -> Result<Option<OutboxOperation>> {
    let mut replaced = None;
    self.modify_unsent(operation_id, |mut op| {
      op.payload = payload.clone();
      replaced = Some(op.clone());
      Some(op)
    })?;
    Ok(replaced)
  }

  /// Remove an unsent operation. Returns `false` without removing anything
  /// if the operation is gone or has been sent.
  pub fn withdraw(&self, operation_id: &str) -> Result<bool> {
    self.modify_unsent(operation_id, |_| None)
  }

  /// Drop an operation. Removing an unknown id is not an error.
  pub fn remove(&self, operation_id: &str) -> Result<()> {
    self.engine.store().delete(Partition::Outbox, operation_id)
  }

  /// Operations parked under `policy`, for the user to resolve.
  pub fn dead_lettered(&self, policy: &DrainPolicy) -> Result<Vec<OutboxOperation>> {
    Ok(
      self
        .list_pending()?
        .into_iter()
        .filter(|op| policy.is_dead(op))
        .collect(),
    )
  }

  /// Replay queued operations in order.
  ///
  /// Successful operations are removed; failed ones get their attempt count
  /// bumped and stay queued. A connectivity failure ends the cycle, as does
  /// any failure when `continue_on_failure` is off. Later operations for a
  /// record whose earlier operation did not go through are deferred so each
  /// record's mutations reach the remote in order.
  pub async fn drain<F, Fut>(&self, policy: &DrainPolicy, mut replay: F) -> Result<DrainSummary>
  where
    F: FnMut(OutboxOperation) -> Fut,
    Fut: Future<Output = Result<()>>,
  {
    let _guard = self.draining.lock().await;
    let pending = self.list_pending()?;
    let now = self.engine.wall_now();
    let mut blocked: HashSet<String> = HashSet::new();
    let mut summary = DrainSummary::default();

    for op in pending {
      if blocked.contains(&op.record_id) {
        summary.deferred += 1;
        continue;
      }
      if policy.is_dead(&op) {
        blocked.insert(op.record_id.clone());
        summary.dead_lettered.push(op.operation_id);
        continue;
      }
      if !policy.is_ready(&op, now) {
        blocked.insert(op.record_id.clone());
        summary.deferred += 1;
        continue;
      }

      let operation_id = op.operation_id.clone();
      let record_id = op.record_id.clone();
      // Withdrawn by a newer local change since the queue was listed
      let Some(op) = self.begin_replay(&operation_id)? else {
        continue;
      };
      match replay(op).await {
        Ok(()) => {
          self.remove(&operation_id)?;
          summary.applied += 1;
        }
        Err(error) => {
          warn!(operation_id = %operation_id, error = %error, "outbox replay failed");
          match self.mark_failed(&operation_id, &error) {
            Ok(_) | Err(CacheError::NotFound(_)) => {}
            Err(e) => return Err(e),
          }
          summary.failed += 1;
          blocked.insert(record_id);
          if error.is_connectivity() || !policy.continue_on_failure {
            summary.stopped_early = true;
            break;
          }
        }
      }
    }

    if summary.applied > 0 || !summary.is_clean() {
      info!(
        applied = summary.applied,
        failed = summary.failed,
        deferred = summary.deferred,
        dead = summary.dead_lettered.len(),
        stopped_early = summary.stopped_early,
        "outbox drain finished"
      );
    }
    Ok(summary)
  }

  /// Flag an operation as being sent and return what is stored now, which
  /// may carry a payload folded in after the queue was listed.
  fn begin_replay(&self, operation_id: &str) -> Result<Option<OutboxOperation>> {
    let mut mark = |current: Option<Value>| -> Result<Option<Value>> {
      let Some(value) = current else {
        return Ok(None);
      };
      let mut op: OutboxOperation = serde_json::from_value(value)?;
      op.in_flight = true;
      Ok(Some(serde_json::to_value(&op)?))
    };
    self
      .engine
      .store()
      .update(Partition::Outbox, operation_id, &mut mark)?
      .map(serde_json::from_value)
      .transpose()
      .map_err(Into::into)
  }

  fn record_attempt(
    &self,
    operation_id: &str,
    error: Option<&CacheError>,
  ) -> Result<OutboxOperation> {
    let now = self.engine.now();
    self.modify(operation_id, |op| {
      op.attempts += 1;
      op.in_flight = false;
      op.last_attempt = Some(now);
      if let Some(error) = error {
        if !error.is_transient() {
          op.conflicts += 1;
        }
        op.last_error = Some(error.to_string());
      }
    })
  }

  /// Rewrite (`Some`) or delete (`None`) an operation, but only while it is
  /// unsent. Returns whether `change` ran.
  fn modify_unsent(
    &self,
    operation_id: &str,
    mut change: impl FnMut(OutboxOperation) -> Option<OutboxOperation>,
  ) -> Result<bool> {
    let mut changed = false;
    let mut apply = |current: Option<Value>| -> Result<Option<Value>> {
      let Some(value) = current else {
        return Ok(None);
      };
      let op: OutboxOperation = serde_json::from_value(value.clone())?;
      if !op.is_unsent() {
        return Ok(Some(value));
      }
      changed = true;
      match change(op) {
        Some(next) => Ok(Some(serde_json::to_value(&next)?)),
        None => Ok(None),
      }
    };
    self
      .engine
      .store()
      .update(Partition::Outbox, operation_id, &mut apply)?;
    Ok(changed)
  }

  fn modify(
    &self,
    operation_id: &str,
    mut change: impl FnMut(&mut OutboxOperation),
  ) -> Result<OutboxOperation> {
    let mut apply = |current: Option<Value>| -> Result<Option<Value>> {
      let value =
        current.ok_or_else(|| CacheError::NotFound(format!("outbox operation {}", operation_id)))?;
      let mut op: OutboxOperation = serde_json::from_value(value)?;
      change(&mut op);
      Ok(Some(serde_json::to_value(&op)?))
    };
    let written = self
      .engine
      .store()
      .update(Partition::Outbox, operation_id, &mut apply)?;
    let value =
      written.ok_or_else(|| CacheError::NotFound(format!("outbox operation {}", operation_id)))?;
    Ok(serde_json::from_value(value)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::CacheConfig;
  use crate::testing::{engine_with_clock, FlakyStore};
  use chrono::Duration as ChronoDuration;
  use serde_json::json;
  use std::sync::Mutex as StdMutex;

  fn outbox() -> (SyncOutbox, Arc<crate::clock::ManualClock>) {
    let (engine, clock) = engine_with_clock();
    (SyncOutbox::new(engine), clock)
  }

  fn conflict() -> CacheError {
    CacheError::ConflictOnReplay {
      operation_id: "x".into(),
      reason: "record no longer exists".into(),
    }
  }

  /// Replay that records record ids and fails for the given ones.
  fn scripted(
    seen: Arc<StdMutex<Vec<String>>>,
    fail: &'static [&'static str],
    error: fn() -> CacheError,
  ) -> impl FnMut(OutboxOperation) -> std::future::Ready<Result<()>> {
    move |op| {
      seen.lock().unwrap().push(op.record_id.clone());
      if fail.contains(&op.record_id.as_str()) {
        std::future::ready(Err(error()))
      } else {
        std::future::ready(Ok(()))
      }
    }
  }

  fn enqueue_abc(outbox: &SyncOutbox) -> Vec<OutboxOperation> {
    ["a", "b", "c"]
      .iter()
      .map(|id| {
        outbox
          .enqueue(NewOperation::update(*id, json!({ "id": id })))
          .unwrap()
      })
      .collect()
  }

  #[test]
  fn test_enqueue_starts_unattempted_in_fifo_order() {
    let (outbox, _) = outbox();
    let queued = enqueue_abc(&outbox);

    let pending = outbox.list_pending().unwrap();
    assert_eq!(pending, queued);
    assert!(pending.iter().all(|op| op.attempts == 0 && op.last_attempt.is_none()));
    assert!(pending.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert_eq!(outbox.len().unwrap(), 3);
  }

  #[test]
  fn test_mark_attempt_keeps_operation() {
    let (outbox, clock) = outbox();
    let op = outbox.enqueue(NewOperation::delete("a")).unwrap();

    clock.advance(ChronoDuration::seconds(5));
    let marked = outbox.mark_attempt(&op.operation_id).unwrap();
    assert_eq!(marked.attempts, 1);
    assert_eq!(marked.conflicts, 0);
    assert!(marked.last_attempt.unwrap() >= clock_now(&clock));
    assert_eq!(outbox.len().unwrap(), 1);

    let marked = outbox
      .mark_failed(&op.operation_id, &CacheError::NetworkUnreachable("down".into()))
      .unwrap();
    assert_eq!((marked.attempts, marked.conflicts), (2, 0));

    let marked = outbox.mark_failed(&op.operation_id, &conflict()).unwrap();
    assert_eq!((marked.attempts, marked.conflicts), (3, 1));
    assert!(marked.last_error.unwrap().contains("no longer exists"));
  }

  #[test]
  fn test_failed_enqueue_leaves_no_trace() {
    let flaky = Arc::new(FlakyStore::new());
    let outbox = SyncOutbox::new(
      CacheEngine::builder(CacheConfig::default())
        .store(flaky.clone())
        .build(),
    );

    // The write and its one retry after eviction both fail
    flaky.fail_next_writes(2);
    assert!(matches!(
      outbox.enqueue(NewOperation::delete("a")),
      Err(CacheError::QuotaExceeded(_))
    ));
    assert!(outbox.is_empty().unwrap());

    let op = outbox.enqueue(NewOperation::delete("a")).unwrap();
    assert_eq!(op.sequence, 1);
    assert_eq!(outbox.list_pending().unwrap(), vec![op]);
  }

  #[test]
  fn test_only_unsent_operations_can_be_superseded() {
    let (outbox, _) = outbox();
    let op = outbox
      .enqueue(NewOperation::update("a", json!({"title": "First"})))
      .unwrap();
    assert!(op.is_unsent());

    let folded = outbox
      .replace_payload(&op.operation_id, json!({"title": "Second"}))
      .unwrap()
      .unwrap();
    assert_eq!(folded.payload, json!({"title": "Second"}));

    outbox.mark_attempt(&op.operation_id).unwrap();
    assert!(outbox
      .replace_payload(&op.operation_id, json!({"title": "Third"}))
      .unwrap()
      .is_none());
    assert!(!outbox.withdraw(&op.operation_id).unwrap());
    let kept = outbox.get(&op.operation_id).unwrap().unwrap();
    assert_eq!(kept.payload, json!({"title": "Second"}));

    assert!(outbox.replace_payload("missing", json!({})).unwrap().is_none());
    assert!(!outbox.withdraw("missing").unwrap());
  }

  #[tokio::test]
  async fn test_operation_in_flight_is_not_superseded() {
    let (outbox, _) = outbox();
    let op = outbox
      .enqueue(NewOperation::update("a", json!({"title": "First"})))
      .unwrap();
    let during = Arc::new(StdMutex::new(Vec::new()));

    let summary = outbox
      .drain(&DrainPolicy::immediate(), |sent: OutboxOperation| {
        let folded = outbox
          .replace_payload(&sent.operation_id, json!({"title": "Second"}))
          .unwrap();
        let withdrawn = outbox.withdraw(&sent.operation_id).unwrap();
        during
          .lock()
          .unwrap()
          .push((sent.in_flight, folded.is_some(), withdrawn));
        std::future::ready(Ok(()))
      })
      .await
      .unwrap();

    assert_eq!(*during.lock().unwrap(), vec![(true, false, false)]);
    assert_eq!(summary.applied, 1);
    assert!(outbox.get(&op.operation_id).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_operation_withdrawn_during_drain_is_skipped() {
    let (outbox, _) = outbox();
    let queued = enqueue_abc(&outbox);
    let seen = Arc::new(StdMutex::new(Vec::new()));

    let summary = outbox
      .drain(&DrainPolicy::immediate(), |sent: OutboxOperation| {
        if sent.record_id == "a" {
          assert!(outbox.withdraw(&queued[1].operation_id).unwrap());
        }
        seen.lock().unwrap().push(sent.record_id);
        std::future::ready(Ok(()))
      })
      .await
      .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["a", "c"]);
    assert_eq!(summary.applied, 2);
    assert!(summary.is_clean());
    assert!(outbox.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_failed_replay_clears_in_flight() {
    let (outbox, _) = outbox();
    let op = outbox.enqueue(NewOperation::delete("a")).unwrap();
    let seen = Arc::new(StdMutex::new(Vec::new()));

    outbox
      .drain(&DrainPolicy::immediate(), scripted(seen, &["a"], conflict))
      .await
      .unwrap();

    let failed = outbox.get(&op.operation_id).unwrap().unwrap();
    assert!(!failed.in_flight);
    assert!(!failed.is_unsent());
  }

  fn clock_now(clock: &crate::clock::ManualClock) -> DateTime<Utc> {
    use crate::clock::Clock;
    clock.now()
  }

  #[test]
  fn test_unknown_operation() {
    let (outbox, _) = outbox();
    assert!(matches!(outbox.mark_attempt("missing"), Err(CacheError::NotFound(_))));
    outbox.remove("missing").unwrap();
    outbox.remove("missing").unwrap();
  }

  #[tokio::test]
  async fn test_drain_applies_in_order_and_empties() {
    let (outbox, _) = outbox();
    enqueue_abc(&outbox);
    let seen = Arc::new(StdMutex::new(Vec::new()));

    let summary = outbox
      .drain(&DrainPolicy::immediate(), scripted(seen.clone(), &[], conflict))
      .await
      .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(summary.applied, 3);
    assert!(summary.is_clean());
    assert!(outbox.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_conflict_on_one_record_does_not_block_others() {
    let (outbox, _) = outbox();
    let queued = enqueue_abc(&outbox);
    let seen = Arc::new(StdMutex::new(Vec::new()));

    let summary = outbox
      .drain(&DrainPolicy::immediate(), scripted(seen.clone(), &["b"], conflict))
      .await
      .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(summary.applied, 2);
    assert_eq!(summary.failed, 1);
    assert!(!summary.stopped_early);

    let pending = outbox.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation_id, queued[1].operation_id);
    assert_eq!(pending[0].attempts, 1);
  }

  #[tokio::test]
  async fn test_stop_on_failure_policy_leaves_rest_queued() {
    let (outbox, _) = outbox();
    enqueue_abc(&outbox);
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let policy = DrainPolicy {
      continue_on_failure: false,
      ..DrainPolicy::immediate()
    };

    let summary = outbox
      .drain(&policy, scripted(seen.clone(), &["b"], conflict))
      .await
      .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    assert!(summary.stopped_early);
    let remaining: Vec<String> = outbox
      .list_pending()
      .unwrap()
      .into_iter()
      .map(|op| op.record_id)
      .collect();
    assert_eq!(remaining, vec!["b", "c"]);
  }

  #[tokio::test]
  async fn test_connectivity_failure_ends_cycle() {
    let (outbox, _) = outbox();
    enqueue_abc(&outbox);
    let seen = Arc::new(StdMutex::new(Vec::new()));

    let summary = outbox
      .drain(
        &DrainPolicy::immediate(),
        scripted(seen.clone(), &["a"], || CacheError::NetworkUnreachable("down".into())),
      )
      .await
      .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["a"]);
    assert!(summary.stopped_early);
    assert_eq!(outbox.len().unwrap(), 3);
  }

  #[tokio::test]
  async fn test_later_operations_of_failed_record_are_deferred() {
    let (outbox, _) = outbox();
    outbox
      .enqueue(NewOperation::create("r1", json!({"id": "r1"})))
      .unwrap();
    outbox
      .enqueue(NewOperation::create("r2", json!({"id": "r2"})))
      .unwrap();
    let follow_up = outbox
      .enqueue(NewOperation::update("r1", json!({"id": "r1"})))
      .unwrap();
    let seen = Arc::new(StdMutex::new(Vec::new()));

    let summary = outbox
      .drain(&DrainPolicy::immediate(), scripted(seen.clone(), &["r1"], conflict))
      .await
      .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["r1", "r2"]);
    assert_eq!(summary.deferred, 1);
    assert_eq!(outbox.get(&follow_up.operation_id).unwrap().unwrap().attempts, 0);
  }

  #[tokio::test]
  async fn test_dead_letter_after_max_attempts() {
    let (outbox, _) = outbox();
    let poison = outbox
      .enqueue(NewOperation::delete("gone"))
      .unwrap();
    let policy = DrainPolicy {
      max_attempts: Some(2),
      ..DrainPolicy::immediate()
    };
    let seen = Arc::new(StdMutex::new(Vec::new()));

    for _ in 0..2 {
      outbox
        .drain(&policy, scripted(seen.clone(), &["gone"], conflict))
        .await
        .unwrap();
    }
    outbox
      .enqueue(NewOperation::update("fine", json!({})))
      .unwrap();
    let summary = outbox
      .drain(&policy, scripted(seen.clone(), &["gone"], conflict))
      .await
      .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["gone", "gone", "fine"]);
    assert_eq!(summary.dead_lettered, vec![poison.operation_id.clone()]);
    assert_eq!(summary.applied, 1);

    let parked = outbox.dead_lettered(&policy).unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!((parked[0].attempts, parked[0].conflicts), (2, 2));
    outbox.remove(&poison.operation_id).unwrap();
    assert!(outbox.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_connectivity_failures_never_park_an_operation() {
    let (outbox, _) = outbox();
    let op = outbox
      .enqueue(NewOperation::update("a", json!({"id": "a"})))
      .unwrap();
    let policy = DrainPolicy {
      max_attempts: Some(2),
      ..DrainPolicy::immediate()
    };
    let seen = Arc::new(StdMutex::new(Vec::new()));

    for _ in 0..5 {
      let summary = outbox
        .drain(
          &policy,
          scripted(seen.clone(), &["a"], || CacheError::NetworkUnreachable("down".into())),
        )
        .await
        .unwrap();
      assert!(summary.dead_lettered.is_empty());
    }
    let waiting = outbox.get(&op.operation_id).unwrap().unwrap();
    assert_eq!((waiting.attempts, waiting.conflicts), (5, 0));
    assert!(outbox.dead_lettered(&policy).unwrap().is_empty());

    let summary = outbox
      .drain(&policy, scripted(seen.clone(), &[], conflict))
      .await
      .unwrap();
    assert_eq!(summary.applied, 1);
    assert_eq!(seen.lock().unwrap().len(), 6);
    assert!(outbox.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_failed_operation_backs_off() {
    let (outbox, clock) = outbox();
    outbox.enqueue(NewOperation::delete("a")).unwrap();
    let policy = DrainPolicy {
      backoff_base: Duration::from_secs(2),
      backoff_max: Duration::from_secs(60),
      ..DrainPolicy::immediate()
    };
    let seen = Arc::new(StdMutex::new(Vec::new()));

    outbox
      .drain(&policy, scripted(seen.clone(), &["a"], conflict))
      .await
      .unwrap();
    let summary = outbox
      .drain(&policy, scripted(seen.clone(), &[], conflict))
      .await
      .unwrap();
    assert_eq!(summary.deferred, 1);
    assert_eq!(seen.lock().unwrap().len(), 1);

    clock.advance(ChronoDuration::seconds(3));
    let summary = outbox
      .drain(&policy, scripted(seen.clone(), &[], conflict))
      .await
      .unwrap();
    assert_eq!(summary.applied, 1);
    assert!(outbox.is_empty().unwrap());
  }

  #[test]
  fn test_backoff_doubles_up_to_cap() {
    let policy = DrainPolicy {
      backoff_base: Duration::from_secs(2),
      backoff_max: Duration::from_secs(30),
      ..DrainPolicy::immediate()
    };
    assert_eq!(policy.backoff(0), Duration::ZERO);
    assert_eq!(policy.backoff(1), Duration::from_secs(2));
    assert_eq!(policy.backoff(3), Duration::from_secs(8));
    assert_eq!(policy.backoff(5), Duration::from_secs(30));
    assert_eq!(policy.backoff(40), Duration::from_secs(30));
  }

  #[test]
  fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
      path: Some(dir.path().join("cache.db")),
      ..CacheConfig::default()
    };

    let first = SyncOutbox::new(CacheEngine::builder(config.clone()).build());
    let queued = first
      .enqueue(NewOperation::update("a", json!({"title": "Offline edit"})))
      .unwrap();
    drop(first);

    let second = SyncOutbox::new(CacheEngine::builder(config).build());
    assert_eq!(second.list_pending().unwrap(), vec![queued]);
    let next = second.enqueue(NewOperation::delete("b")).unwrap();
    assert!(next.sequence > 1);
  }
}
