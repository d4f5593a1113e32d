//! Session boundaries: login, logout and credential expiry.
//!
//! Cached validators, bodies and idempotency records belong to one user's
//! session. They are dropped before a new credential is used and whenever the
//! old one goes away. Pinned files survive unless configured otherwise.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::api::status;
use crate::api::types::{LoginRequest, LoginResponse};
use crate::api::{Backend, Credentials};
use crate::cache::{CacheLayer, IdempotencyRegistry};
use crate::error::{DataError, Result};
use crate::offline::OfflineStorage;
use crate::transfer::CapturedResponse;

const LOGIN_PATH: &str = "/auth/login";

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
  pub username: Option<String>,
  /// When the server said the credential stops working, if it said
  pub expires_at: Option<DateTime<Utc>>,
}

pub struct SessionController {
  backend: Arc<dyn Backend>,
  credentials: Arc<Credentials>,
  cache: CacheLayer,
  registry: Arc<IdempotencyRegistry<CapturedResponse>>,
  offline: Arc<dyn OfflineStorage>,
  clear_offline_on_logout: bool,
}

impl SessionController {
  pub fn new(
    backend: Arc<dyn Backend>,
    credentials: Arc<Credentials>,
    cache: CacheLayer,
    registry: Arc<IdempotencyRegistry<CapturedResponse>>,
    offline: Arc<dyn OfflineStorage>,
  ) -> Self {
    Self {
      backend,
      credentials,
      cache,
      registry,
      offline,
      clear_offline_on_logout: false,
    }
  }

  /// Also drop pinned files on logout and credential expiry.
  pub fn with_clear_offline_on_logout(mut self, clear: bool) -> Self {
    self.clear_offline_on_logout = clear;
    self
  }

  /// Drop every session-scoped cache entry.
  fn reset_caches(&self) {
    self.cache.reset();
    self.registry.reset();
  }

  fn end_session(&self, reason: &str) {
    self.reset_caches();
    self.credentials.clear();

    if self.clear_offline_on_logout {
      match self.offline.clear_all() {
        Ok(removed) => info!(removed, "Cleared offline files at session end"),
        Err(e) => warn!(error = %e, "Failed to clear offline files at session end"),
      }
    }
    info!(reason, "Session ended");
  }

  /// Sign in with a password.
  ///
  /// Caches are reset before the login request, so nothing cached for a
  /// previous user can be served to this one.
  pub async fn login(&self, username: &str, password: &str) -> Result<Session> {
    if username.is_empty() {
      return Err(DataError::InvalidInput("username is empty".to_string()));
    }

    self.reset_caches();
    self.credentials.clear();

    let body = serde_json::to_value(LoginRequest { username, password })?;
    let response = match self
      .backend
      .post_json(LOGIN_PATH, &body)
      .await
      .and_then(status::classify)
    {
      Ok(response) => response,
      Err(DataError::AuthExpired) => {
        return Err(DataError::InvalidInput(
          "invalid username or password".to_string(),
        ))
      }
      Err(e) => return Err(e),
    };

    let login: LoginResponse = status::json(&response)?;
    self.credentials.set(login.token);
    info!(username, "Logged in");

    Ok(Session {
      username: Some(username.to_string()),
      expires_at: login
        .expires_in_ms
        .map(|ms| Utc::now() + Duration::milliseconds(ms as i64)),
    })
  }

  /// Adopt a token issued elsewhere (e.g. from the environment).
  pub fn set_credential(&self, token: impl Into<String>) -> Session {
    self.reset_caches();
    self.credentials.set(token);
    debug!("Credential set");
    Session {
      username: None,
      expires_at: None,
    }
  }

  pub fn logout(&self) {
    self.end_session("logout");
  }

  /// Called when any request answered 401.
  pub fn on_auth_expired(&self) {
    warn!("Credential rejected by the server");
    self.end_session("credential expired");
  }

  pub fn is_authenticated(&self) -> bool {
    self.credentials.is_set()
  }
}
