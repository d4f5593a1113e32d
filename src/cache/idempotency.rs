//! Client-side de-duplication of side-effecting operations.
//!
//! Every upload/download is identified by a fingerprint: a SHA256 digest of the
//! operation name and its canonicalized parameters. The first caller to
//! [`IdempotencyRegistry::begin`] a fingerprint gets a [`Reservation`] and is
//! the only one allowed to touch the network; later callers either receive the
//! captured result or wait for the owner to finish.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Compute the fingerprint for an operation.
///
/// Object keys are sorted at every depth before hashing, so the result does not
/// depend on the order parameters were inserted in.
pub fn fingerprint(operation: &str, params: &Value) -> String {
  let mut canonical = String::new();
  canonical.push_str(operation);
  canonical.push(':');
  write_canonical(params, &mut canonical);

  let mut hasher = Sha256::new();
  hasher.update(canonical.as_bytes());
  hex::encode(hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      out.push('{');
      for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(&Value::String(key.clone()), out);
        out.push(':');
        write_canonical(&map[key.as_str()], out);
      }
      out.push('}');
    }
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    scalar => {
      // Scalars have exactly one JSON rendering.
      let _ = write!(out, "{}", scalar);
    }
  }
}

enum RecordState<R> {
  Pending {
    reservation_id: u64,
    // Dropping the sender wakes every waiter.
    _done: watch::Sender<()>,
    waiters: watch::Receiver<()>,
  },
  Completed(R),
}

struct Record<R> {
  created_at: DateTime<Utc>,
  state: RecordState<R>,
}

/// Outcome of [`IdempotencyRegistry::begin`].
pub enum Begin<R> {
  /// No live record existed; the caller owns the operation.
  Reserved(Reservation<R>),
  /// Another caller owns the operation and has not finished yet.
  InFlight(Waiter),
  /// The operation already completed; this is its captured result.
  Completed(R),
}

impl<R> Begin<R> {
  pub fn is_duplicate(&self) -> bool {
    !matches!(self, Begin::Reserved(_))
  }
}

/// Handle to wait for an in-flight operation owned by someone else.
pub struct Waiter {
  rx: watch::Receiver<()>,
}

impl Waiter {
  /// Resolves once the owning reservation completes, fails or is dropped.
  ///
  /// Callers should then call `begin` again.
  pub async fn wait(mut self) {
    // Nothing is ever sent: the sender is dropped when the record leaves
    // the pending state, which makes `changed` return.
    while self.rx.changed().await.is_ok() {}
  }
}

/// Ownership of a pending fingerprint.
///
/// Dropping a reservation without calling [`Reservation::complete`] releases the
/// fingerprint, so a failed or abandoned attempt never blocks a retry.
pub struct Reservation<R> {
  registry: Arc<IdempotencyRegistry<R>>,
  fingerprint: String,
  reservation_id: u64,
  finished: bool,
}

impl<R: Clone> Reservation<R> {
  /// Store the result and move the record to the completed state.
  pub fn complete(mut self, result: R) {
    self.finished = true;
    self
      .registry
      .finish(&self.fingerprint, Some(self.reservation_id), Some(result));
  }

  /// Release the fingerprint without caching anything.
  pub fn release(mut self) {
    self.finished = true;
    self
      .registry
      .finish(&self.fingerprint, Some(self.reservation_id), None);
  }
}

impl<R> Drop for Reservation<R> {
  fn drop(&mut self) {
    if !self.finished {
      debug!(fingerprint = %self.fingerprint, "Reservation dropped without completing, releasing");
      self.registry.release_abandoned(&self.fingerprint, self.reservation_id);
    }
  }
}

/// In-memory registry of operation fingerprints.
pub struct IdempotencyRegistry<R> {
  records: Mutex<HashMap<String, Record<R>>>,
  retention: Duration,
  max_entries: usize,
  next_id: AtomicU64,
}

impl<R> IdempotencyRegistry<R> {
  pub fn new(retention: Duration, max_entries: usize) -> Self {
    Self {
      records: Mutex::new(HashMap::new()),
      retention,
      max_entries,
      next_id: AtomicU64::new(1),
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, Record<R>>> {
    self.records.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn release_abandoned(&self, fingerprint: &str, reservation_id: u64) {
    let mut records = self.lock();
    let owned = matches!(
      records.get(fingerprint),
      Some(Record { state: RecordState::Pending { reservation_id: id, .. }, .. }) if *id == reservation_id
    );
    if owned {
      records.remove(fingerprint);
    }
  }

  /// Drop every record. Pending owners keep running but their results are discarded.
  pub fn reset(&self) {
    let mut records = self.lock();
    let count = records.len();
    records.clear();
    debug!(count, "Idempotency registry reset");
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  /// Drop a completed record so the next dispatch goes to the network.
  pub fn forget(&self, fingerprint: &str) -> bool {
    let mut records = self.lock();
    if matches!(
      records.get(fingerprint),
      Some(Record {
        state: RecordState::Completed(_),
        ..
      })
    ) {
      records.remove(fingerprint);
      return true;
    }
    false
  }

  /// Release a pending fingerprint without caching a result.
  pub fn release(&self, fingerprint: &str) -> bool {
    let mut records = self.lock();
    if matches!(
      records.get(fingerprint),
      Some(Record {
        state: RecordState::Pending { .. },
        ..
      })
    ) {
      records.remove(fingerprint);
      return true;
    }
    false
  }

  fn is_expired(&self, record: &Record<R>, now: DateTime<Utc>) -> bool {
    matches!(record.state, RecordState::Completed(_)) && now - record.created_at > self.retention
  }

  fn evict_expired(&self, records: &mut HashMap<String, Record<R>>, now: DateTime<Utc>) {
    let before = records.len();
    records.retain(|_, record| !self.is_expired(record, now));
    let evicted = before - records.len();
    if evicted > 0 {
      trace!(evicted, "Evicted expired idempotency records");
    }
  }

  /// Discard the oldest completed records until the registry fits its bound.
  fn enforce_bound(&self, records: &mut HashMap<String, Record<R>>) {
    if records.len() <= self.max_entries {
      return;
    }

    let mut completed: Vec<(DateTime<Utc>, String)> = records
      .iter()
      .filter(|(_, r)| matches!(r.state, RecordState::Completed(_)))
      .map(|(k, r)| (r.created_at, k.clone()))
      .collect();
    completed.sort();

    let excess = records.len() - self.max_entries;
    for (_, key) in completed.into_iter().take(excess) {
      records.remove(&key);
    }
    debug!(size = records.len(), "Idempotency registry trimmed to size bound");
  }
}

impl<R: Clone> IdempotencyRegistry<R> {
  /// Look up a fingerprint, reserving it if nothing live exists.
  ///
  /// The reservation is made under the registry lock before returning, so two
  /// callers can never both receive [`Begin::Reserved`] for one fingerprint.
  pub fn begin(self: &Arc<Self>, fingerprint: &str) -> Begin<R> {
    let now = Utc::now();
    let mut records = self.lock();
    self.evict_expired(&mut records, now);

    if let Some(record) = records.get(fingerprint) {
      return match &record.state {
        RecordState::Completed(result) => {
          debug!(%fingerprint, "Duplicate operation, returning captured result");
          Begin::Completed(result.clone())
        }
        RecordState::Pending { waiters, .. } => {
          debug!(%fingerprint, "Duplicate operation in flight, waiting");
          Begin::InFlight(Waiter {
            rx: waiters.clone(),
          })
        }
      };
    }

    let reservation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (done, waiters) = watch::channel(());
    records.insert(
      fingerprint.to_string(),
      Record {
        created_at: now,
        state: RecordState::Pending {
          reservation_id,
          _done: done,
          waiters,
        },
      },
    );
    self.enforce_bound(&mut records);

    Begin::Reserved(Reservation {
      registry: Arc::clone(self),
      fingerprint: fingerprint.to_string(),
      reservation_id,
      finished: false,
    })
  }

  /// Move a pending fingerprint to the completed state.
  ///
  /// Returns false when no pending record exists (e.g. after a session reset).
  pub fn complete(&self, fingerprint: &str, result: R) -> bool {
    self.finish(fingerprint, None, Some(result))
  }

  /// The captured result of a completed, unexpired operation.
  pub fn get(&self, fingerprint: &str) -> Option<R> {
    let now = Utc::now();
    let records = self.lock();
    match records.get(fingerprint) {
      Some(record) if !self.is_expired(record, now) => match &record.state {
        RecordState::Completed(result) => Some(result.clone()),
        RecordState::Pending { .. } => None,
      },
      _ => None,
    }
  }

  fn finish(&self, fingerprint: &str, reservation_id: Option<u64>, result: Option<R>) -> bool {
    let mut records = self.lock();
    let owned = match records.get(fingerprint) {
      Some(Record {
        state: RecordState::Pending {
          reservation_id: id, ..
        },
        ..
      }) => reservation_id.map_or(true, |expected| *id == expected),
      _ => false,
    };

    if !owned {
      debug!(%fingerprint, "No matching pending record, result discarded");
      return false;
    }

    match result {
      Some(result) => {
        records.insert(
          fingerprint.to_string(),
          Record {
            created_at: Utc::now(),
            state: RecordState::Completed(result),
          },
        );
        self.enforce_bound(&mut records);
      }
      None => {
        records.remove(fingerprint);
      }
    }
    true
  }
}
