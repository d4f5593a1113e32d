//! Error types for the data layer.
//!
//! Every failure that changes what the user sees is surfaced as a typed
//! [`DataError`]. Conditions the components recover from on their own
//! (a 304, a token refresh, lazy eviction) never become errors.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;

/// Structured back-off guidance parsed from a 429 response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryGuidance {
  /// Value of `Retry-After`, in seconds
  pub retry_after: Option<Duration>,
  /// `X-RateLimit-Limit`
  pub limit: Option<u64>,
  /// `X-RateLimit-Remaining`
  pub remaining: Option<u64>,
  /// `X-RateLimit-Reset`, sent as epoch seconds
  pub reset_at: Option<DateTime<Utc>>,
  /// `X-RateLimit-Type` (e.g. "upload", "general")
  pub limit_kind: Option<String>,
}

impl RetryGuidance {
  /// Parse rate-limit headers. Missing or malformed headers are left as `None`.
  pub fn from_headers(headers: &HeaderMap) -> Self {
    let text = |name: &str| {
      headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
    };
    let number = |name: &str| text(name).and_then(|s| s.parse::<u64>().ok());

    Self {
      retry_after: number("retry-after").map(Duration::from_secs),
      limit: number("x-ratelimit-limit"),
      remaining: number("x-ratelimit-remaining"),
      reset_at: number("x-ratelimit-reset")
        .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
      limit_kind: text("x-ratelimit-type"),
    }
  }

  /// How long a caller should wait before retrying.
  ///
  /// Prefers `Retry-After`, falls back to the reset timestamp.
  pub fn backoff(&self) -> Option<Duration> {
    if let Some(after) = self.retry_after {
      return Some(after);
    }
    self
      .reset_at
      .map(|reset| (reset - Utc::now()).to_std().unwrap_or(Duration::ZERO))
  }
}

/// Errors surfaced by the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
  #[error("Network unavailable: {0}")]
  NetworkUnavailable(String),

  #[error("Authentication expired; sign in again")]
  AuthExpired,

  #[error("Rate limited by the server; back off and retry")]
  RateLimited(RetryGuidance),

  #[error("Transfer token expired and no fresh token could be used")]
  TransferTokenExpired,

  #[error("No transfer available: {0}")]
  NoTransferAvailable(String),

  #[error("Transfer failed: {0}")]
  TransferFailed(String),

  #[error("Offline store unavailable: {0}")]
  PersistentStoreUnavailable(String),

  #[error("Offline store is in use by another process; close other windows using it and retry")]
  StoreBlocked,

  #[error("Offline store schema version {found} is incompatible with expected version {expected}")]
  SchemaIncompatible { found: i64, expected: i64 },

  #[error("Server error ({0})")]
  Server(StatusCode),

  #[error("Request failed with HTTP {status}: {body}")]
  Http { status: StatusCode, body: String },

  #[error("Failed to decode response: {0}")]
  Decode(String),

  #[error("Invalid input: {0}")]
  InvalidInput(String),
}

impl DataError {
  /// Whether retrying the same call later may succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      DataError::NetworkUnavailable(_)
        | DataError::RateLimited(_)
        | DataError::TransferTokenExpired
        | DataError::NoTransferAvailable(_)
        | DataError::TransferFailed(_)
        | DataError::StoreBlocked
        | DataError::Server(_)
    )
  }

  /// Retry guidance, if the server supplied any.
  pub fn retry_guidance(&self) -> Option<&RetryGuidance> {
    match self {
      DataError::RateLimited(guidance) => Some(guidance),
      _ => None,
    }
  }
}

impl From<reqwest::Error> for DataError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      DataError::Decode(e.to_string())
    } else {
      DataError::NetworkUnavailable(e.to_string())
    }
  }
}

impl From<serde_json::Error> for DataError {
  fn from(e: serde_json::Error) -> Self {
    DataError::Decode(e.to_string())
  }
}

impl From<rusqlite::Error> for DataError {
  fn from(e: rusqlite::Error) -> Self {
    match e.sqlite_error_code() {
      Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
        DataError::StoreBlocked
      }
      _ => DataError::PersistentStoreUnavailable(e.to_string()),
    }
  }
}

pub type Result<T, E = DataError> = std::result::Result<T, E>;
