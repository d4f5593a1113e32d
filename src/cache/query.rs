//! In-memory store of last-known-good response bodies.
//!
//! The conditional cache only remembers validators; when the server answers
//! 304 the body comes from here. Entries younger than the stale time are
//! served without any request, and stale entries back up reads while offline.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::debug;

use crate::api::ResourceKey;

/// A cached body and when the server last vouched for it.
#[derive(Debug, Clone)]
pub struct CachedBody {
  pub body: Value,
  pub fetched_at: DateTime<Utc>,
}

pub struct QueryCache {
  entries: Mutex<HashMap<String, CachedBody>>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl QueryCache {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      stale_time: Duration::minutes(5),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, CachedBody>> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn is_stale(&self, fetched_at: DateTime<Utc>) -> bool {
    Utc::now() - fetched_at > self.stale_time
  }

  /// Any cached body, fresh or stale.
  pub fn get(&self, key: &ResourceKey) -> Option<CachedBody> {
    self.lock().get(&key.cache_key()).cloned()
  }

  /// A cached body still inside the stale time.
  pub fn get_fresh(&self, key: &ResourceKey) -> Option<CachedBody> {
    self.get(key).filter(|cached| !self.is_stale(cached.fetched_at))
  }

  pub fn store(&self, key: &ResourceKey, body: Value) -> DateTime<Utc> {
    let fetched_at = Utc::now();
    self
      .lock()
      .insert(key.cache_key(), CachedBody { body, fetched_at });
    fetched_at
  }

  /// Mark a cached body as confirmed by the server (after a 304).
  pub fn touch(&self, key: &ResourceKey) -> Option<CachedBody> {
    let mut entries = self.lock();
    let entry = entries.get_mut(&key.cache_key())?;
    entry.fetched_at = Utc::now();
    Some(entry.clone())
  }

  pub fn invalidate(&self, key: &ResourceKey) {
    if self.lock().remove(&key.cache_key()).is_some() {
      debug!(key = %key, "Query cache entry invalidated");
    }
  }

  /// Drop every entry whose key starts with `prefix` (e.g. `"files:"`).
  pub fn invalidate_prefix(&self, prefix: &str) -> usize {
    let mut entries = self.lock();
    let before = entries.len();
    entries.retain(|key, _| !key.starts_with(prefix));
    before - entries.len()
  }

  pub fn reset(&self) {
    self.lock().clear();
    debug!("Query cache reset");
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }
}

impl Default for QueryCache {
  fn default() -> Self {
    Self::new()
  }
}
