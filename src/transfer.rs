//! Pre-signed upload and download orchestration.
//!
//! Every transfer is two requests: a token request against the authenticated
//! API, then the transfer itself against the short-lived URL the token names.
//! Transfers are de-duplicated through the idempotency registry and carry the
//! fingerprint as `Idempotency-Key` so the server can de-duplicate too.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::api::status;
use crate::api::types::{PresignRequest, PresignResponse, RawResponse};
use crate::api::{Backend, PresignedTransferToken, RemoteFile, ResourceKey, TransferOperation, UploadFile};
use crate::cache::{fingerprint, Begin, CacheLayer, IdempotencyRegistry, Reservation};
use crate::error::{DataError, Result};
use crate::offline::{FileDescriptor, OfflineStorage};

/// Result of a finished upload as the server reported it.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReceipt {
  /// Server JSON body (the created file)
  pub body: Value,
  /// URL of the token the transfer consumed
  pub token_url: String,
  pub idempotency_key: String,
}

impl UploadReceipt {
  /// The created file, if the body has the usual shape.
  pub fn remote_file(&self) -> Option<RemoteFile> {
    serde_json::from_value(self.body.clone()).ok()
  }
}

/// Content of a finished download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedFile {
  pub file_id: u64,
  pub content: Bytes,
  pub media_type: Option<String>,
}

/// What the idempotency registry keeps for a completed transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum CapturedResponse {
  Upload(UploadReceipt),
  Download(DownloadedFile),
}

/// Where a transfer result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSource {
  /// This call performed the transfer
  Network,
  /// An earlier identical call did; its captured result was reused
  Duplicate,
  /// Served from the offline store without touching the network
  OfflineStore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
  pub receipt: UploadReceipt,
  pub source: TransferSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadOutcome {
  pub file: DownloadedFile,
  pub source: TransferSource,
  /// Whether the content is now in the offline store
  pub pinned: bool,
}

#[derive(Debug, Clone, Copy)]
enum TransferState {
  RequestingToken,
  Transferring,
  Complete,
  Failed,
}

impl fmt::Display for TransferState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::RequestingToken => "requesting_token",
      Self::Transferring => "transferring",
      Self::Complete => "complete",
      Self::Failed => "failed",
    };
    f.write_str(name)
  }
}

fn transition(operation: TransferOperation, key: &str, attempt: u32, state: TransferState) {
  debug!(operation = operation.as_str(), key, attempt, %state, "Transfer state");
}

enum Payload<'a> {
  Upload { file: &'a UploadFile, folder_id: u64 },
  Download { file_id: u64 },
}

impl Payload<'_> {
  fn operation(&self) -> TransferOperation {
    match self {
      Payload::Upload { .. } => TransferOperation::Upload,
      Payload::Download { .. } => TransferOperation::Download,
    }
  }

  fn presign_request(&self) -> PresignRequest {
    match self {
      Payload::Upload { folder_id, .. } => PresignRequest {
        folder_id: Some(*folder_id),
        file_id: None,
      },
      Payload::Download { file_id } => PresignRequest {
        folder_id: None,
        file_id: Some(*file_id),
      },
    }
  }
}

enum Claim {
  Owner(Reservation<CapturedResponse>),
  Captured(CapturedResponse),
}

/// Fingerprint of an upload: same name, size and folder means same upload.
pub fn upload_fingerprint(file: &UploadFile, folder_id: u64) -> String {
  fingerprint(
    "upload",
    &json!({
      "fileName": file.name,
      "fileSize": file.size(),
      "folderId": folder_id,
    }),
  )
}

pub fn download_fingerprint(file_id: u64) -> String {
  fingerprint("download", &json!({ "fileId": file_id }))
}

fn presign_path(operation: TransferOperation) -> String {
  format!("/api/v1/files/presign/{}", operation.as_str())
}

pub struct TransferCoordinator {
  backend: Arc<dyn Backend>,
  registry: Arc<IdempotencyRegistry<CapturedResponse>>,
  cache: CacheLayer,
  offline: Arc<dyn OfflineStorage>,
  max_token_attempts: u32,
}

impl TransferCoordinator {
  pub fn new(
    backend: Arc<dyn Backend>,
    registry: Arc<IdempotencyRegistry<CapturedResponse>>,
    cache: CacheLayer,
    offline: Arc<dyn OfflineStorage>,
    max_token_attempts: u32,
  ) -> Self {
    Self {
      backend,
      registry,
      cache,
      offline,
      max_token_attempts: max_token_attempts.max(1),
    }
  }

  pub fn registry(&self) -> &Arc<IdempotencyRegistry<CapturedResponse>> {
    &self.registry
  }

  /// Wait out in-flight duplicates until this caller owns the fingerprint
  /// or a captured result exists.
  async fn claim(&self, key: &str) -> Claim {
    loop {
      match self.registry.begin(key) {
        Begin::Reserved(reservation) => return Claim::Owner(reservation),
        Begin::Completed(captured) => return Claim::Captured(captured),
        Begin::InFlight(waiter) => waiter.wait().await,
      }
    }
  }

  /// Upload a file into a folder.
  ///
  /// Identical uploads (same name, size and folder) within the retention
  /// window share one network transfer.
  pub async fn upload(&self, file: &UploadFile, folder_id: u64) -> Result<UploadOutcome> {
    if file.name.trim().is_empty() {
      return Err(DataError::InvalidInput("file name is empty".to_string()));
    }
    if folder_id == 0 {
      return Err(DataError::InvalidInput(
        "a valid folder id is required to upload".to_string(),
      ));
    }

    let key = upload_fingerprint(file, folder_id);
    let reservation = match self.claim(&key).await {
      Claim::Owner(reservation) => reservation,
      Claim::Captured(CapturedResponse::Upload(receipt)) => {
        debug!(file = %file.name, folder_id, "Upload already done, reusing receipt");
        return Ok(UploadOutcome {
          receipt,
          source: TransferSource::Duplicate,
        });
      }
      Claim::Captured(CapturedResponse::Download(_)) => {
        return Err(DataError::InvalidInput(format!(
          "fingerprint {} is recorded for a download",
          key
        )))
      }
    };

    let (response, token_url) = match self
      .transfer(Payload::Upload { file, folder_id }, &key)
      .await
    {
      Ok(done) => done,
      Err(e) => {
        reservation.release();
        return Err(e);
      }
    };

    let body = if response.body.is_empty() {
      Value::Null
    } else {
      match status::json(&response) {
        Ok(body) => body,
        Err(e) => {
          warn!(error = %e, "Upload succeeded but the response body is not JSON");
          Value::Null
        }
      }
    };

    let receipt = UploadReceipt {
      body,
      token_url,
      idempotency_key: key,
    };
    reservation.complete(CapturedResponse::Upload(receipt.clone()));
    self.cache.invalidate(&[ResourceKey::FolderFiles { folder_id }]);
    info!(file = %file.name, size = file.size(), folder_id, "Upload complete");

    Ok(UploadOutcome {
      receipt,
      source: TransferSource::Network,
    })
  }

  /// Download a file, optionally keeping it in the offline store.
  pub async fn download(&self, file_id: u64, persist_offline: bool) -> Result<DownloadOutcome> {
    let key = download_fingerprint(file_id);
    let reservation = match self.claim(&key).await {
      Claim::Owner(reservation) => reservation,
      Claim::Captured(CapturedResponse::Download(file)) => {
        debug!(file_id, "Download already done, reusing content");
        let pinned = if self.offline_has(file_id) {
          true
        } else if persist_offline {
          self.persist(&file).await?
        } else {
          false
        };
        return Ok(DownloadOutcome {
          file,
          source: TransferSource::Duplicate,
          pinned,
        });
      }
      Claim::Captured(CapturedResponse::Upload(_)) => {
        return Err(DataError::InvalidInput(format!(
          "fingerprint {} is recorded for an upload",
          key
        )))
      }
    };

    if !persist_offline {
      match self.offline.get(file_id) {
        Ok(Some((content, metadata))) => {
          debug!(file_id, "Serving download from the offline store");
          reservation.release();
          return Ok(DownloadOutcome {
            file: DownloadedFile {
              file_id,
              content,
              media_type: metadata.media_type,
            },
            source: TransferSource::OfflineStore,
            pinned: true,
          });
        }
        Ok(None) => {}
        Err(e) => warn!(file_id, error = %e, "Offline store lookup failed, downloading"),
      }
    }

    let response = match self.transfer(Payload::Download { file_id }, &key).await {
      Ok((response, _)) => response,
      Err(e) => {
        reservation.release();
        return Err(e);
      }
    };

    let file = DownloadedFile {
      file_id,
      media_type: response.content_type().map(String::from),
      content: response.body,
    };
    let persisted = if persist_offline {
      self.persist(&file).await
    } else {
      Ok(self.offline_has(file_id))
    };

    // The bytes arrived, so the download counts as done even if pinning hit a 401.
    reservation.complete(CapturedResponse::Download(file.clone()));
    let pinned = persisted?;
    info!(file_id, size = file.content.len(), pinned, "Download complete");

    Ok(DownloadOutcome {
      file,
      source: TransferSource::Network,
      pinned,
    })
  }

  fn offline_has(&self, file_id: u64) -> bool {
    self.offline.has(file_id).unwrap_or(false)
  }

  /// Write downloaded content to the offline store.
  ///
  /// Store failures are logged and reported as not pinned. Only an expired
  /// credential on the metadata fetch is raised, so the session can end.
  async fn persist(&self, file: &DownloadedFile) -> Result<bool> {
    let descriptor = match self.cache.fetch(&ResourceKey::File { id: file.file_id }).await {
      Ok(result) => match serde_json::from_value::<RemoteFile>(result.data) {
        Ok(remote) => FileDescriptor {
          folder_id: remote.folder_id,
          display_name: remote.original_name,
          media_type: remote.content_type.or_else(|| file.media_type.clone()),
        },
        Err(e) => {
          warn!(file_id = file.file_id, error = %e, "Unexpected file metadata shape");
          self.fallback_descriptor(file)
        }
      },
      Err(DataError::AuthExpired) => return Err(DataError::AuthExpired),
      Err(e) => {
        warn!(file_id = file.file_id, error = %e, "Could not fetch file metadata for pinning");
        self.fallback_descriptor(file)
      }
    };

    match self.offline.put(file.file_id, &file.content, &descriptor) {
      Ok(_) => Ok(true),
      Err(e) => {
        warn!(file_id = file.file_id, error = %e, "Failed to store file offline");
        Ok(false)
      }
    }
  }

  fn fallback_descriptor(&self, file: &DownloadedFile) -> FileDescriptor {
    FileDescriptor {
      folder_id: None,
      display_name: format!("file-{}", file.file_id),
      media_type: file.media_type.clone(),
    }
  }

  async fn request_token(&self, request: &PresignRequest, operation: TransferOperation) -> Result<PresignedTransferToken> {
    let body = serde_json::to_value(request)?;
    let response = self
      .backend
      .post_json(&presign_path(operation), &body)
      .await
      .and_then(status::classify);

    let response = match response {
      Ok(response) => response,
      Err(e @ (DataError::AuthExpired | DataError::RateLimited(_))) => return Err(e),
      Err(e) => return Err(DataError::NoTransferAvailable(e.to_string())),
    };

    let presigned: PresignResponse = status::json(&response)
      .map_err(|e| DataError::NoTransferAvailable(format!("malformed token response: {}", e)))?;
    Ok(PresignedTransferToken::issue(operation, presigned))
  }

  async fn send(&self, token: PresignedTransferToken, payload: &Payload<'_>, key: &str) -> Result<RawResponse> {
    let response = match payload {
      Payload::Upload { file, folder_id } => {
        self
          .backend
          .upload(&token.url, file, *folder_id, key)
          .await?
      }
      Payload::Download { .. } => self.backend.download(&token.url, key).await?,
    };
    status::classify(response)
  }

  /// Run the token/transfer state machine, refreshing expired tokens.
  ///
  /// Returns the classified transfer response and the URL of the token used.
  async fn transfer(&self, payload: Payload<'_>, key: &str) -> Result<(RawResponse, String)> {
    let operation = payload.operation();
    let request = payload.presign_request();

    for attempt in 1..=self.max_token_attempts {
      transition(operation, key, attempt, TransferState::RequestingToken);
      let token = match self.request_token(&request, operation).await {
        Ok(token) => token,
        Err(e) => {
          transition(operation, key, attempt, TransferState::Failed);
          return Err(e);
        }
      };

      if token.is_expired() {
        warn!(operation = operation.as_str(), attempt, "Token expired before use");
        continue;
      }

      let expires_at = token.expires_at();
      let token_url = token.url.clone();
      transition(operation, key, attempt, TransferState::Transferring);

      match self.send(token, &payload, key).await {
        Ok(response) => {
          transition(operation, key, attempt, TransferState::Complete);
          return Ok((response, token_url));
        }
        Err(e @ DataError::RateLimited(_)) => {
          transition(operation, key, attempt, TransferState::Failed);
          return Err(e);
        }
        Err(e) if Utc::now() >= expires_at => {
          warn!(operation = operation.as_str(), attempt, error = %e, "Token expired during transfer, requesting a new one");
        }
        Err(e @ DataError::AuthExpired) => {
          transition(operation, key, attempt, TransferState::Failed);
          return Err(e);
        }
        Err(e) => {
          transition(operation, key, attempt, TransferState::Failed);
          return Err(DataError::TransferFailed(e.to_string()));
        }
      }
    }

    transition(operation, key, self.max_token_attempts, TransferState::Failed);
    Err(DataError::TransferTokenExpired)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ConditionalCache, QueryCache};
  use crate::offline::{SqliteOfflineStore, UnavailableStore};
  use crate::testing::{json_response, MockBackend};
  use reqwest::header::{HeaderValue, CONTENT_TYPE};
  use reqwest::StatusCode;
  use std::time::Duration;
  use tempfile::TempDir;

  const PRESIGN_UPLOAD: &str = "/api/v1/files/presign/upload";
  const PRESIGN_DOWNLOAD: &str = "/api/v1/files/presign/download";

  fn coordinator(backend: Arc<MockBackend>, offline: Arc<dyn OfflineStorage>) -> TransferCoordinator {
    let cache = CacheLayer::new(
      backend.clone(),
      Arc::new(ConditionalCache::new()),
      Arc::new(QueryCache::new()),
    );
    TransferCoordinator::new(
      backend,
      Arc::new(IdempotencyRegistry::new(chrono::Duration::hours(24), 1000)),
      cache,
      offline,
      3,
    )
  }

  fn sqlite_store(dir: &TempDir) -> Arc<dyn OfflineStorage> {
    Arc::new(SqliteOfflineStore::open(dir.path().join("offline.db"), Duration::from_secs(5)).unwrap())
  }

  fn file_bytes(content: &'static [u8], media_type: &str) -> RawResponse {
    let mut response = RawResponse::new(StatusCode::OK, content);
    response
      .headers
      .insert(CONTENT_TYPE, HeaderValue::from_str(media_type).unwrap());
    response
  }

  fn created(id: u64) -> RawResponse {
    json_response(
      StatusCode::OK,
      json!({"id": id, "originalName": "a.txt", "size": 5, "folderId": 7}),
      None,
    )
  }

  #[tokio::test]
  async fn test_concurrent_identical_uploads_share_one_transfer() {
    let backend = Arc::new(MockBackend::new());
    backend.push_presign("upload", 60);
    backend.push_upload(created(1));
    backend.set_transfer_delay(Duration::from_millis(50));
    let coordinator = Arc::new(coordinator(backend.clone(), Arc::new(UnavailableStore::new("n/a"))));

    let file = UploadFile::new("a.txt", &b"hello"[..]);
    let tasks: Vec<_> = (0..3)
      .map(|_| {
        let coordinator = Arc::clone(&coordinator);
        let file = file.clone();
        tokio::spawn(async move { coordinator.upload(&file, 7).await })
      })
      .collect();

    let mut receipts = Vec::new();
    let mut sources = Vec::new();
    for task in tasks {
      let outcome = task.await.unwrap().unwrap();
      receipts.push(outcome.receipt);
      sources.push(outcome.source);
    }

    assert_eq!(backend.upload_calls(), 1);
    assert_eq!(backend.post_calls(PRESIGN_UPLOAD), 1);
    assert!(receipts.iter().all(|r| r == &receipts[0]));
    assert_eq!(sources.iter().filter(|s| **s == TransferSource::Network).count(), 1);
    assert_eq!(receipts[0].remote_file().map(|f| f.id), Some(1));
  }

  #[tokio::test]
  async fn test_back_to_back_uploads_reuse_receipt_and_send_key() {
    let backend = Arc::new(MockBackend::new());
    backend.push_presign("upload", 60);
    backend.push_upload(created(1));
    let coordinator = coordinator(backend.clone(), Arc::new(UnavailableStore::new("n/a")));
    let file = UploadFile::new("a.txt", &b"hello"[..]);

    let first = coordinator.upload(&file, 7).await.unwrap();
    let second = coordinator.upload(&file, 7).await.unwrap();

    assert_eq!(first.source, TransferSource::Network);
    assert_eq!(second.source, TransferSource::Duplicate);
    assert_eq!(first.receipt, second.receipt);
    assert_eq!(backend.upload_calls(), 1);
    assert_eq!(backend.upload_keys(), vec![upload_fingerprint(&file, 7)]);
    assert_eq!(
      backend.post_bodies(PRESIGN_UPLOAD),
      vec![json!({"folderId": 7})]
    );
  }

  #[tokio::test]
  async fn test_upload_invalidates_folder_listing() {
    let backend = Arc::new(MockBackend::new());
    backend.push_get_json("/api/files/folder/7", json!([]), Some("\"v1\""));
    backend.push_presign("upload", 60);
    backend.push_upload(created(1));
    let coordinator = coordinator(backend.clone(), Arc::new(UnavailableStore::new("n/a")));
    let listing = ResourceKey::FolderFiles { folder_id: 7 };

    coordinator.cache.fetch(&listing).await.unwrap();
    assert!(coordinator.cache.conditional().validator(&listing).is_some());

    coordinator
      .upload(&UploadFile::new("a.txt", &b"hello"[..]), 7)
      .await
      .unwrap();
    assert!(coordinator.cache.conditional().validator(&listing).is_none());
    assert!(coordinator.cache.queries().get(&listing).is_none());
  }

  #[tokio::test]
  async fn test_failed_upload_releases_reservation() {
    let backend = Arc::new(MockBackend::new());
    backend.push_presign("upload", 60);
    backend.push_upload(RawResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "boom"));
    backend.push_presign("upload", 60);
    backend.push_upload(created(2));
    let coordinator = coordinator(backend.clone(), Arc::new(UnavailableStore::new("n/a")));
    let file = UploadFile::new("a.txt", &b"hello"[..]);

    let err = coordinator.upload(&file, 7).await.unwrap_err();
    assert!(matches!(err, DataError::TransferFailed(_)));
    assert!(err.is_retryable());
    assert!(coordinator.registry().is_empty());

    let retry = coordinator.upload(&file, 7).await.unwrap();
    assert_eq!(retry.source, TransferSource::Network);
    assert_eq!(backend.upload_calls(), 2);
  }

  #[tokio::test]
  async fn test_token_request_failure_is_no_transfer_available() {
    let backend = Arc::new(MockBackend::new());
    backend.push_post(PRESIGN_UPLOAD, RawResponse::new(StatusCode::NOT_FOUND, "no folder"));
    let coordinator = coordinator(backend.clone(), Arc::new(UnavailableStore::new("n/a")));

    let err = coordinator
      .upload(&UploadFile::new("a.txt", &b"hello"[..]), 7)
      .await
      .unwrap_err();
    assert!(matches!(err, DataError::NoTransferAvailable(_)));
    assert_eq!(backend.upload_calls(), 0);
    assert!(coordinator.registry().is_empty());
  }

  #[tokio::test]
  async fn test_rate_limit_surfaces_guidance() {
    let backend = Arc::new(MockBackend::new());
    let mut limited = RawResponse::new(StatusCode::TOO_MANY_REQUESTS, "{}");
    limited
      .headers
      .insert("Retry-After", HeaderValue::from_static("7"));
    limited
      .headers
      .insert("X-RateLimit-Type", HeaderValue::from_static("upload"));
    backend.push_post(PRESIGN_UPLOAD, limited);
    let coordinator = coordinator(backend.clone(), Arc::new(UnavailableStore::new("n/a")));

    let err = coordinator
      .upload(&UploadFile::new("a.txt", &b"hello"[..]), 7)
      .await
      .unwrap_err();
    let guidance = err.retry_guidance().expect("guidance");
    assert_eq!(guidance.retry_after, Some(Duration::from_secs(7)));
    assert_eq!(guidance.limit_kind.as_deref(), Some("upload"));
  }

  #[tokio::test]
  async fn test_expired_token_is_refreshed() {
    let backend = Arc::new(MockBackend::new());
    // Zero TTL: expired before it can be used.
    backend.push_presign("download", 0);
    backend.push_presign("download", 60);
    backend.push_download(file_bytes(b"data", "text/plain"));
    let coordinator = coordinator(backend.clone(), Arc::new(UnavailableStore::new("n/a")));

    let outcome = coordinator.download(42, false).await.unwrap();
    assert_eq!(&outcome.file.content[..], b"data");
    assert_eq!(backend.post_calls(PRESIGN_DOWNLOAD), 2);
    assert_eq!(backend.download_calls(), 1);
  }

  #[tokio::test]
  async fn test_token_attempts_run_out() {
    let backend = Arc::new(MockBackend::new());
    for _ in 0..3 {
      backend.push_presign("download", 0);
    }
    let coordinator = coordinator(backend.clone(), Arc::new(UnavailableStore::new("n/a")));

    let err = coordinator.download(42, false).await.unwrap_err();
    assert!(matches!(err, DataError::TransferTokenExpired));
    assert_eq!(backend.download_calls(), 0);
    assert!(coordinator.registry().is_empty());
  }

  #[tokio::test]
  async fn test_pinned_download_served_offline_without_network() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir);

    let backend = Arc::new(MockBackend::new());
    backend.push_presign("download", 60);
    backend.push_download(file_bytes(b"quarterly numbers", "application/pdf"));
    backend.push_get_json(
      "/api/files/42",
      json!({"id": 42, "originalName": "q3.pdf", "contentType": "application/pdf", "size": 17, "folderId": 7}),
      Some("\"m1\""),
    );
    let online = coordinator(backend.clone(), store.clone());

    let pinned = online.download(42, true).await.unwrap();
    assert!(pinned.pinned);
    let metadata = store.get_metadata(42).unwrap().unwrap();
    assert_eq!(metadata.display_name, "q3.pdf");
    assert_eq!(metadata.folder_id, Some(7));

    // A fresh session with no network.
    let offline_backend = Arc::new(MockBackend::new());
    offline_backend.set_offline(true);
    let offline = coordinator(offline_backend.clone(), store.clone());

    let outcome = offline.download(42, false).await.unwrap();
    assert_eq!(outcome.source, TransferSource::OfflineStore);
    assert_eq!(&outcome.file.content[..], b"quarterly numbers");
    assert_eq!(outcome.file.media_type.as_deref(), Some("application/pdf"));
    assert_eq!(offline_backend.total_calls(), 0);
    assert!(offline.registry().is_empty());
  }

  #[tokio::test]
  async fn test_completed_download_is_persisted_when_pinned_later() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir);

    let backend = Arc::new(MockBackend::new());
    backend.push_presign("download", 60);
    backend.push_download(file_bytes(b"abc", "text/plain"));
    backend.push_get_json(
      "/api/files/5",
      json!({"id": 5, "originalName": "notes.txt", "size": 3, "folderId": 2}),
      None,
    );
    let coordinator = coordinator(backend.clone(), store.clone());

    let first = coordinator.download(5, false).await.unwrap();
    assert!(!first.pinned);
    let second = coordinator.download(5, true).await.unwrap();

    assert_eq!(second.source, TransferSource::Duplicate);
    assert!(second.pinned);
    assert_eq!(backend.download_calls(), 1);
    assert_eq!(&store.get(5).unwrap().unwrap().0[..], b"abc");
  }

  #[tokio::test]
  async fn test_store_failure_does_not_fail_download() {
    let backend = Arc::new(MockBackend::new());
    backend.push_presign("download", 60);
    backend.push_download(file_bytes(b"abc", "text/plain"));
    let coordinator = coordinator(backend.clone(), Arc::new(UnavailableStore::new("quota")));

    let outcome = coordinator.download(9, true).await.unwrap();
    assert_eq!(outcome.source, TransferSource::Network);
    assert!(!outcome.pinned);
    assert_eq!(&outcome.file.content[..], b"abc");
  }

  #[tokio::test]
  async fn test_expired_credential_while_pinning_is_raised() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir);
    let backend = Arc::new(MockBackend::new());
    backend.push_presign("download", 60);
    backend.push_download(file_bytes(b"abc", "text/plain"));
    backend.push_get_status("/api/files/42", StatusCode::UNAUTHORIZED);
    let coordinator = coordinator(backend.clone(), store.clone());

    let err = coordinator.download(42, true).await.unwrap_err();
    assert!(matches!(err, DataError::AuthExpired));
    assert!(!store.has(42).unwrap());
    // The bytes did arrive; the record is completed rather than left pending.
    assert!(coordinator.registry().get(&download_fingerprint(42)).is_some());
  }

  #[tokio::test]
  async fn test_cancelled_download_releases_reservation() {
    let backend = Arc::new(MockBackend::new());
    backend.push_presign("download", 60);
    backend.push_download(file_bytes(b"slow", "text/plain"));
    backend.set_transfer_delay(Duration::from_secs(5));
    let coordinator = coordinator(backend.clone(), Arc::new(UnavailableStore::new("n/a")));

    let cancelled =
      tokio::time::timeout(Duration::from_millis(20), coordinator.download(3, false)).await;
    assert!(cancelled.is_err());
    assert!(coordinator.registry().is_empty());
  }
}
