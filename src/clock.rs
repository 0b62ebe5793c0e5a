//! Time sources.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  millis: AtomicI64,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      millis: AtomicI64::new(start.timestamp_millis()),
    }
  }

  pub fn advance(&self, by: Duration) {
    self
      .millis
      .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
  }

  pub fn set(&self, to: DateTime<Utc>) {
    self.millis.store(to.timestamp_millis(), Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    from_millis(self.millis.load(Ordering::SeqCst))
  }
}

/// Stamps events with strictly increasing millisecond timestamps.
///
/// Two stamps taken within the same millisecond are pushed apart by one
/// millisecond, so ids derived from a stamp stay unique and sequences of
/// stamps stay ordered.
pub struct MonotonicClock {
  inner: Arc<dyn Clock>,
  last: AtomicI64,
}

impl MonotonicClock {
  pub fn new(inner: Arc<dyn Clock>) -> Self {
    Self {
      inner,
      last: AtomicI64::new(0),
    }
  }

  /// Next event stamp, strictly greater than every previous one.
  pub fn stamp(&self) -> DateTime<Utc> {
    let wall = self.inner.now().timestamp_millis();
    let mut prev = self.last.load(Ordering::SeqCst);
    loop {
      let next = wall.max(prev + 1);
      match self
        .last
        .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
      {
        Ok(_) => return from_millis(next),
        Err(actual) => prev = actual,
      }
    }
  }

  /// Unadjusted wall time, for age computations.
  pub fn wall(&self) -> DateTime<Utc> {
    self.inner.now()
  }
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
