//! Cache layer that orchestrates conditional reads against the backend.

use std::sync::Arc;

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use super::conditional::{ConditionalCache, Observation};
use super::query::QueryCache;
use super::traits::CacheResult;
use crate::api::{status, Backend, ResourceKey};
use crate::error::{DataError, Result};

/// Outcome of one conditional GET. A 304 is a success, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
  Fresh { body: Value, etag: Option<String> },
  NotModified,
}

/// Cache layer combining the validator store and the body store.
///
/// This layer sits between the application and the network client,
/// providing transparent revalidation with offline support.
#[derive(Clone)]
pub struct CacheLayer {
  backend: Arc<dyn Backend>,
  conditional: Arc<ConditionalCache>,
  queries: Arc<QueryCache>,
}

impl CacheLayer {
  pub fn new(
    backend: Arc<dyn Backend>,
    conditional: Arc<ConditionalCache>,
    queries: Arc<QueryCache>,
  ) -> Self {
    Self {
      backend,
      conditional,
      queries,
    }
  }

  pub fn conditional(&self) -> &Arc<ConditionalCache> {
    &self.conditional
  }

  pub fn queries(&self) -> &Arc<QueryCache> {
    &self.queries
  }

  /// Issue one GET with the given headers and classify the answer.
  pub async fn fetch_conditional(&self, key: &ResourceKey, headers: HeaderMap) -> Result<Fetched> {
    let response = status::classify(self.backend.get(&key.path(), headers).await?)?;

    if response.status == StatusCode::NOT_MODIFIED {
      return Ok(Fetched::NotModified);
    }

    let body = if response.body.is_empty() {
      Value::Null
    } else {
      status::json(&response)?
    };
    Ok(Fetched::Fresh {
      body,
      etag: response.etag().map(String::from),
    })
  }

  /// Read a resource.
  ///
  /// 1. Fresh body in the query cache - return it without a request
  /// 2. Otherwise revalidate with `If-None-Match` when a validator is known
  /// 3. 304 - reuse the cached body; if there is none, re-request unconditionally
  /// 4. Network unavailable - serve the stale body if one exists (offline mode)
  pub async fn fetch(&self, key: &ResourceKey) -> Result<CacheResult<Value>> {
    if let Some(cached) = self.queries.get_fresh(key) {
      debug!(key = %key, "Query cache hit");
      return Ok(CacheResult::from_cache(cached.body, cached.fetched_at));
    }

    let headers = self.conditional.prepare_request(key);
    let conditional = !headers.is_empty();
    debug!(key = %key, digest = %key.digest(), conditional, "Revalidating");

    match self.fetch_conditional(key, headers).await {
      Ok(Fetched::Fresh { body, etag }) => Ok(self.accept(key, body, etag.as_deref())),
      Ok(Fetched::NotModified) => {
        let observation = if conditional {
          self
            .conditional
            .observe_response(key, StatusCode::NOT_MODIFIED, None)
        } else {
          Observation::RefetchUnconditionally
        };

        if observation == Observation::NotModified {
          if let Some(cached) = self.queries.touch(key) {
            debug!(key = %key, "Not modified, reusing cached body");
            return Ok(CacheResult::revalidated(cached.body, cached.fetched_at));
          }
          // Validator without a body: the body store was reset independently.
          self.conditional.invalidate(key);
        }
        self.fetch_unconditional(key).await
      }
      Err(DataError::NetworkUnavailable(reason)) => match self.queries.get(key) {
        Some(cached) => {
          warn!(key = %key, %reason, "Network unavailable, serving cached body");
          Ok(CacheResult::offline(cached.body, cached.fetched_at))
        }
        None => Err(DataError::NetworkUnavailable(reason)),
      },
      Err(e) => Err(e),
    }
  }

  async fn fetch_unconditional(&self, key: &ResourceKey) -> Result<CacheResult<Value>> {
    debug!(key = %key, "Re-requesting unconditionally");
    match self.fetch_conditional(key, HeaderMap::new()).await? {
      Fetched::Fresh { body, etag } => Ok(self.accept(key, body, etag.as_deref())),
      Fetched::NotModified => Err(DataError::Http {
        status: StatusCode::NOT_MODIFIED,
        body: format!("304 for unconditional request of {}", key.description()),
      }),
    }
  }

  fn accept(&self, key: &ResourceKey, body: Value, etag: Option<&str>) -> CacheResult<Value> {
    self.conditional.observe_response(key, StatusCode::OK, etag);
    self.queries.store(key, body.clone());
    CacheResult::from_network(body)
  }

  /// Forget everything known about the given resources.
  pub fn invalidate(&self, keys: &[ResourceKey]) {
    for key in keys {
      self.conditional.invalidate(key);
      self.queries.invalidate(key);
    }
  }

  pub fn reset(&self) {
    self.conditional.reset();
    self.queries.reset();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::testing::MockBackend;
  use reqwest::header::IF_NONE_MATCH;
  use serde_json::json;

  fn layer(backend: Arc<MockBackend>, stale: chrono::Duration) -> CacheLayer {
    CacheLayer::new(
      backend,
      Arc::new(ConditionalCache::new()),
      Arc::new(QueryCache::new().with_stale_time(stale)),
    )
  }

  fn always_stale() -> chrono::Duration {
    chrono::Duration::milliseconds(-1)
  }

  #[tokio::test]
  async fn test_first_read_is_unconditional_and_stores_validator() {
    let backend = Arc::new(MockBackend::new());
    backend.push_get_json("/api/folders", json!([{"id": 1}]), Some("\"e1\""));
    let layer = layer(backend.clone(), always_stale());

    let result = layer.fetch(&ResourceKey::Folders).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data, json!([{"id": 1}]));
    assert!(backend.last_get_headers().get(IF_NONE_MATCH).is_none());
    assert_eq!(
      layer.conditional().validator(&ResourceKey::Folders).as_deref(),
      Some("\"e1\"")
    );
  }

  #[tokio::test]
  async fn test_not_modified_reuses_body() {
    let backend = Arc::new(MockBackend::new());
    backend.push_get_json("/api/folders", json!([{"id": 1}]), Some("\"e1\""));
    backend.push_get_status("/api/folders", StatusCode::NOT_MODIFIED);
    let layer = layer(backend.clone(), always_stale());

    layer.fetch(&ResourceKey::Folders).await.unwrap();
    let second = layer.fetch(&ResourceKey::Folders).await.unwrap();

    assert_eq!(second.source, CacheSource::Revalidated);
    assert_eq!(second.data, json!([{"id": 1}]));
    assert_eq!(
      backend.last_get_headers().get(IF_NONE_MATCH).unwrap(),
      "\"e1\""
    );
    assert_eq!(backend.get_calls(), 2);
  }

  #[tokio::test]
  async fn test_fresh_body_skips_network() {
    let backend = Arc::new(MockBackend::new());
    backend.push_get_json("/api/folders", json!([]), None);
    let layer = layer(backend.clone(), chrono::Duration::minutes(5));

    layer.fetch(&ResourceKey::Folders).await.unwrap();
    let second = layer.fetch(&ResourceKey::Folders).await.unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(backend.get_calls(), 1);
  }

  #[tokio::test]
  async fn test_not_modified_without_validator_refetches() {
    let backend = Arc::new(MockBackend::new());
    backend.push_get_status("/api/folders", StatusCode::NOT_MODIFIED);
    backend.push_get_json("/api/folders", json!(["ok"]), Some("\"e2\""));
    let layer = layer(backend.clone(), always_stale());

    let result = layer.fetch(&ResourceKey::Folders).await.unwrap();
    assert_eq!(result.data, json!(["ok"]));
    assert_eq!(backend.get_calls(), 2);
  }

  #[tokio::test]
  async fn test_validator_without_body_refetches() {
    let backend = Arc::new(MockBackend::new());
    backend.push_get_json("/api/folders", json!([1]), Some("\"e1\""));
    backend.push_get_status("/api/folders", StatusCode::NOT_MODIFIED);
    backend.push_get_json("/api/folders", json!([2]), Some("\"e2\""));
    let layer = layer(backend.clone(), always_stale());

    layer.fetch(&ResourceKey::Folders).await.unwrap();
    layer.queries().reset();
    let result = layer.fetch(&ResourceKey::Folders).await.unwrap();

    assert_eq!(result.data, json!([2]));
    assert_eq!(result.source, CacheSource::Network);
    assert!(backend.last_get_headers().get(IF_NONE_MATCH).is_none());
  }

  #[tokio::test]
  async fn test_offline_serves_stale_body() {
    let backend = Arc::new(MockBackend::new());
    backend.push_get_json("/api/folders", json!([1]), Some("\"e1\""));
    let layer = layer(backend.clone(), always_stale());

    layer.fetch(&ResourceKey::Folders).await.unwrap();
    backend.set_offline(true);
    let result = layer.fetch(&ResourceKey::Folders).await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data, json!([1]));

    let missing = layer.fetch(&ResourceKey::SharedFiles).await;
    assert!(matches!(missing, Err(DataError::NetworkUnavailable(_))));
  }

  #[tokio::test]
  async fn test_server_error_leaves_validator() {
    let backend = Arc::new(MockBackend::new());
    backend.push_get_json("/api/folders", json!([1]), Some("\"e1\""));
    backend.push_get_status("/api/folders", StatusCode::INTERNAL_SERVER_ERROR);
    let layer = layer(backend.clone(), always_stale());

    layer.fetch(&ResourceKey::Folders).await.unwrap();
    let err = layer.fetch(&ResourceKey::Folders).await.unwrap_err();
    assert!(matches!(err, DataError::Server(_)));
    assert_eq!(
      layer.conditional().validator(&ResourceKey::Folders).as_deref(),
      Some("\"e1\"")
    );
  }

  #[tokio::test]
  async fn test_invalidate_makes_next_read_unconditional() {
    let backend = Arc::new(MockBackend::new());
    backend.push_get_json("/api/files/folder/3", json!([]), Some("\"e1\""));
    backend.push_get_json("/api/files/folder/3", json!([{"id": 9}]), Some("\"e2\""));
    let layer = layer(backend.clone(), chrono::Duration::minutes(5));
    let key = ResourceKey::FolderFiles { folder_id: 3 };

    layer.fetch(&key).await.unwrap();
    layer.invalidate(&[key.clone()]);
    let result = layer.fetch(&key).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert!(backend.last_get_headers().get(IF_NONE_MATCH).is_none());
    assert_eq!(result.data, json!([{"id": 9}]));
  }
}
