//! Wire types exchanged with the backend.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// A raw backend response. Status interpretation happens in [`super::status`].
#[derive(Debug, Clone)]
pub struct RawResponse {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl RawResponse {
  pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: HeaderMap::new(),
      body: body.into(),
    }
  }

  /// The `ETag` header, if present and valid UTF-8.
  pub fn etag(&self) -> Option<&str> {
    self
      .headers
      .get(reqwest::header::ETAG)
      .and_then(|v| v.to_str().ok())
  }

  pub fn content_type(&self) -> Option<&str> {
    self
      .headers
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
  }
}

/// Which side of the pre-signed protocol a token authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferOperation {
  Upload,
  Download,
}

impl TransferOperation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Upload => "upload",
      Self::Download => "download",
    }
  }
}

/// Body of `POST /api/v1/files/presign/{upload|download}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub folder_id: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub file_id: Option<u64>,
}

/// Backend answer to a presign request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignResponse {
  #[serde(default)]
  pub token: Option<String>,
  pub url: String,
  pub expires_in_seconds: u64,
}

/// A short-lived URL authorizing exactly one transfer.
///
/// The transfer call takes the token by value, so an attempt cannot hand the
/// same token to a second attempt.
#[derive(Debug)]
pub struct PresignedTransferToken {
  pub url: String,
  pub operation: TransferOperation,
  pub expires_in_seconds: u64,
  pub issued_at: DateTime<Utc>,
}

impl PresignedTransferToken {
  pub fn issue(operation: TransferOperation, response: PresignResponse) -> Self {
    Self {
      url: response.url,
      operation,
      expires_in_seconds: response.expires_in_seconds,
      issued_at: Utc::now(),
    }
  }

  pub fn expires_at(&self) -> DateTime<Utc> {
    self.issued_at + Duration::seconds(self.expires_in_seconds as i64)
  }

  pub fn is_expired(&self) -> bool {
    self.is_expired_at(Utc::now())
  }

  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at()
  }
}

/// File metadata as returned by `GET /api/files/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
  pub id: u64,
  pub original_name: String,
  #[serde(default)]
  pub content_type: Option<String>,
  pub size: u64,
  #[serde(default)]
  pub folder_id: Option<u64>,
}

/// Reference to a neighbouring folder in a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRef {
  pub id: u64,
  pub name: String,
}

/// Folder as returned by `GET /api/folders`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
  pub id: u64,
  pub name: String,
  #[serde(default)]
  pub parent: Option<FolderRef>,
  #[serde(default)]
  pub children: Vec<FolderRef>,
}

/// Body of `POST /auth/login`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
  pub username: &'a str,
  pub password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
  pub token: String,
  #[serde(default)]
  pub expires_in_ms: Option<u64>,
}

/// A local file to upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
  pub name: String,
  pub media_type: Option<String>,
  pub content: Bytes,
}

impl UploadFile {
  pub fn new(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
    Self {
      name: name.into(),
      media_type: None,
      content: content.into(),
    }
  }

  pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
    self.media_type = Some(media_type.into());
    self
  }

  pub fn size(&self) -> u64 {
    self.content.len() as u64
  }
}
