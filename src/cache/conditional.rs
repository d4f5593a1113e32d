//! ETag validator store driving conditional GETs.
//!
//! Only validators live here; bodies belong to the query cache. A validator is
//! dropped whenever a write through this client targets its resource, so the
//! next read is unconditional and authoritative.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use reqwest::header::{HeaderMap, HeaderValue, IF_NONE_MATCH};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::api::ResourceKey;

/// What the caller should do with a response after the cache observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
  /// 200: use the new body (its validator, if any, is now stored)
  Fresh,
  /// 304 with a known validator: reuse the last-known-good body
  NotModified,
  /// 304 without a stored validator: the server misbehaved, re-request unconditionally
  RefetchUnconditionally,
  /// Any other status carries no freshness information
  Ignored,
}

#[derive(Debug, Default)]
pub struct ConditionalCache {
  validators: Mutex<HashMap<String, String>>,
}

impl ConditionalCache {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
    self.validators.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Headers for a read of `key`: `If-None-Match` when a validator is known.
  pub fn prepare_request(&self, key: &ResourceKey) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(etag) = self.validator(key) {
      match HeaderValue::from_str(&etag) {
        Ok(value) => {
          headers.insert(IF_NONE_MATCH, value);
        }
        Err(_) => {
          warn!(key = %key, "Stored validator is not a valid header value, dropping it");
          self.invalidate(key);
        }
      }
    }
    headers
  }

  /// Record what a response says about the freshness of `key`.
  pub fn observe_response(
    &self,
    key: &ResourceKey,
    status: StatusCode,
    etag: Option<&str>,
  ) -> Observation {
    match status {
      StatusCode::OK => {
        match etag {
          Some(etag) => {
            self.lock().insert(key.cache_key(), etag.to_string());
            debug!(key = %key, %etag, "Stored validator");
          }
          // The old validator no longer describes the body the caller now holds.
          None => self.invalidate(key),
        }
        Observation::Fresh
      }
      StatusCode::NOT_MODIFIED => {
        if self.lock().contains_key(&key.cache_key()) {
          Observation::NotModified
        } else {
          warn!(key = %key, "304 received without a stored validator, treating as a miss");
          Observation::RefetchUnconditionally
        }
      }
      _ => Observation::Ignored,
    }
  }

  pub fn validator(&self, key: &ResourceKey) -> Option<String> {
    self.lock().get(&key.cache_key()).cloned()
  }

  pub fn invalidate(&self, key: &ResourceKey) {
    if self.lock().remove(&key.cache_key()).is_some() {
      debug!(key = %key, "Validator invalidated");
    }
  }

  pub fn invalidate_all(&self) {
    self.lock().clear();
  }

  /// Session-boundary reset.
  pub fn reset(&self) {
    self.invalidate_all();
    debug!("Conditional cache reset");
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }
}
