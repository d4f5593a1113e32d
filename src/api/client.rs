//! HTTP transport to the file-storage backend.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use tracing::{debug, warn};
use url::Url;

use super::types::{RawResponse, UploadFile};
use crate::config::Config;
use crate::error::{DataError, Result};

/// Header carrying the client-side fingerprint so the server can deduplicate too.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// HTTP client timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport seam between the cache layer and the network.
///
/// Implementations only move bytes; they never interpret status codes, so the
/// cache layer sees every 304, 401 and 429 exactly as the server sent it.
/// Transport-level failures map to [`DataError::NetworkUnavailable`].
#[async_trait]
pub trait Backend: Send + Sync {
  /// `GET` a path relative to the backend base URL.
  async fn get(&self, path: &str, headers: HeaderMap) -> Result<RawResponse>;

  /// `POST` a JSON body to a path relative to the backend base URL.
  async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<RawResponse>;

  /// `DELETE` a path relative to the backend base URL.
  async fn delete(&self, path: &str) -> Result<RawResponse>;

  /// Multipart upload against a pre-signed URL.
  async fn upload(
    &self,
    url: &str,
    file: &UploadFile,
    folder_id: u64,
    idempotency_key: &str,
  ) -> Result<RawResponse>;

  /// Binary download from a pre-signed URL.
  async fn download(&self, url: &str, idempotency_key: &str) -> Result<RawResponse>;
}

/// Bearer credential shared between the transport and the session controller.
#[derive(Debug, Default)]
pub struct Credentials {
  token: RwLock<Option<String>>,
}

impl Credentials {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&self, token: impl Into<String>) {
    *self.token.write().unwrap_or_else(|e| e.into_inner()) = Some(token.into());
  }

  pub fn clear(&self) {
    *self.token.write().unwrap_or_else(|e| e.into_inner()) = None;
  }

  pub fn get(&self) -> Option<String> {
    self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
  }

  pub fn is_set(&self) -> bool {
    self.get().is_some()
  }
}

/// reqwest-backed [`Backend`].
#[derive(Clone)]
pub struct HttpBackend {
  http: reqwest::Client,
  base: Url,
  credentials: Arc<Credentials>,
}

impl HttpBackend {
  pub fn new(config: &Config, credentials: Arc<Credentials>) -> Result<Self> {
    let base = Url::parse(&config.backend.url)
      .map_err(|e| DataError::InvalidInput(format!("backend url {}: {}", config.backend.url, e)))?;

    let http = reqwest::Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(|e| DataError::InvalidInput(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self {
      http,
      base,
      credentials,
    })
  }

  fn resolve(&self, path_or_url: &str) -> Result<Url> {
    resolve_url(&self.base, path_or_url)
  }

  fn auth_headers(&self) -> HeaderMap {
    bearer_headers(&self.credentials)
  }

  async fn into_raw(response: reqwest::Response) -> Result<RawResponse> {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?;
    Ok(RawResponse {
      status,
      headers,
      body,
    })
  }
}

/// Resolve a relative API path or an absolute pre-signed URL against the base.
fn resolve_url(base: &Url, path_or_url: &str) -> Result<Url> {
  base
    .join(path_or_url)
    .map_err(|e| DataError::InvalidInput(format!("Invalid URL {}: {}", path_or_url, e)))
}

fn bearer_headers(credentials: &Credentials) -> HeaderMap {
  let mut headers = HeaderMap::new();
  if let Some(token) = credentials.get() {
    match HeaderValue::from_str(&format!("Bearer {}", token)) {
      Ok(value) => {
        headers.insert(AUTHORIZATION, value);
      }
      Err(_) => warn!("Stored credential is not a valid header value; sending unauthenticated"),
    }
  }
  headers
}

fn idempotency_value(key: &str) -> Result<HeaderValue> {
  HeaderValue::from_str(key)
    .map_err(|_| DataError::InvalidInput(format!("Invalid idempotency key {}", key)))
}

#[async_trait]
impl Backend for HttpBackend {
  async fn get(&self, path: &str, headers: HeaderMap) -> Result<RawResponse> {
    let url = self.resolve(path)?;
    debug!(%url, conditional = !headers.is_empty(), "GET");

    let response = self
      .http
      .get(url)
      .headers(self.auth_headers())
      .headers(headers)
      .send()
      .await?;

    Self::into_raw(response).await
  }

  async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<RawResponse> {
    let url = self.resolve(path)?;
    debug!(%url, "POST");

    let response = self
      .http
      .post(url)
      .headers(self.auth_headers())
      .json(body)
      .send()
      .await?;

    Self::into_raw(response).await
  }

  async fn delete(&self, path: &str) -> Result<RawResponse> {
    let url = self.resolve(path)?;
    debug!(%url, "DELETE");

    let response = self
      .http
      .delete(url)
      .headers(self.auth_headers())
      .send()
      .await?;

    Self::into_raw(response).await
  }

  async fn upload(
    &self,
    url: &str,
    file: &UploadFile,
    folder_id: u64,
    idempotency_key: &str,
  ) -> Result<RawResponse> {
    let url = self.resolve(url)?;

    let mut part = Part::bytes(file.content.to_vec()).file_name(file.name.clone());
    if let Some(media_type) = &file.media_type {
      part = part
        .mime_str(media_type)
        .map_err(|e| DataError::InvalidInput(format!("media type {}: {}", media_type, e)))?;
    }
    let form = Form::new()
      .part("file", part)
      .text("folderId", folder_id.to_string());

    debug!(file = %file.name, size = file.size(), folder_id, "Uploading to pre-signed URL");

    // Pre-signed URLs carry their own authorization.
    let response = self
      .http
      .post(url)
      .header(IDEMPOTENCY_HEADER, idempotency_value(idempotency_key)?)
      .multipart(form)
      .send()
      .await?;

    Self::into_raw(response).await
  }

  async fn download(&self, url: &str, idempotency_key: &str) -> Result<RawResponse> {
    let url = self.resolve(url)?;
    debug!("Downloading from pre-signed URL");

    let response = self
      .http
      .get(url)
      .header(IDEMPOTENCY_HEADER, idempotency_value(idempotency_key)?)
      .send()
      .await?;

    Self::into_raw(response).await
  }
}
