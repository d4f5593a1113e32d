//! Data layer facade: the single entry point for callers.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::status;
use crate::api::{Backend, Credentials, HttpBackend, RemoteFile, RemoteFolder, ResourceKey, UploadFile};
use crate::cache::{CacheLayer, CacheResult, ConditionalCache, IdempotencyRegistry, QueryCache};
use crate::config::Config;
use crate::error::{DataError, Result};
use crate::offline::{OfflineMetadata, OfflineStorage, SqliteOfflineStore, StoreEvent, UnavailableStore};
use crate::session::{Session, SessionController};
use crate::transfer::{download_fingerprint, CapturedResponse, DownloadOutcome, TransferCoordinator, UploadOutcome};

/// Open the configured offline store, degrading to an unavailable store.
///
/// Network reads and transfers keep working without a durable store. Every
/// offline operation then fails with the reason the open failed.
pub fn open_offline_store(config: &Config) -> Arc<dyn OfflineStorage> {
  let path = match config.offline.resolve_path() {
    Ok(path) => path,
    Err(e) => {
      warn!(error = %e, "No location for the offline store");
      return Arc::new(UnavailableStore::new(e.to_string()));
    }
  };

  match SqliteOfflineStore::open(&path, config.offline.busy_timeout()) {
    Ok(store) => {
      for event in store.events() {
        match event {
          StoreEvent::SchemaIncompatible { found, expected } => {
            warn!(found, expected, "Offline files were discarded after an incompatible upgrade")
          }
          StoreEvent::Migrated { from, to } => info!(from, to, "Offline store upgraded"),
        }
      }
      Arc::new(store)
    }
    Err(e) => {
      warn!(path = %path.display(), error = %e, "Offline store unavailable");
      Arc::new(UnavailableStore::from_error(&e))
    }
  }
}

/// Resilient client for the file-storage backend.
///
/// Owns the caches, the idempotency registry, the transfer coordinator and the
/// session controller. Any call that ends in [`DataError::AuthExpired`] ends
/// the session before the error is returned.
pub struct DataLayer {
  backend: Arc<dyn Backend>,
  cache: CacheLayer,
  offline: Arc<dyn OfflineStorage>,
  transfers: TransferCoordinator,
  session: SessionController,
}

impl DataLayer {
  pub fn new(
    config: &Config,
    backend: Arc<dyn Backend>,
    credentials: Arc<Credentials>,
    offline: Arc<dyn OfflineStorage>,
  ) -> Self {
    let cache = CacheLayer::new(
      backend.clone(),
      Arc::new(ConditionalCache::new()),
      Arc::new(QueryCache::new().with_stale_time(config.stale_time())),
    );
    let registry: Arc<IdempotencyRegistry<CapturedResponse>> = Arc::new(IdempotencyRegistry::new(
      config.idempotency_retention(),
      config.idempotency.max_entries,
    ));

    let transfers = TransferCoordinator::new(
      backend.clone(),
      registry.clone(),
      cache.clone(),
      offline.clone(),
      config.transfer.max_token_attempts,
    );
    let session = SessionController::new(
      backend.clone(),
      credentials,
      cache.clone(),
      registry,
      offline.clone(),
    )
    .with_clear_offline_on_logout(config.offline.clear_on_logout);

    Self {
      backend,
      cache,
      offline,
      transfers,
      session,
    }
  }

  /// Build the HTTP backend and open the offline store from configuration.
  pub fn connect(config: &Config) -> Result<Self> {
    let credentials = Arc::new(Credentials::new());
    let backend = Arc::new(HttpBackend::new(config, credentials.clone())?);
    let offline = open_offline_store(config);
    Ok(Self::new(config, backend, credentials, offline))
  }

  pub fn session(&self) -> &SessionController {
    &self.session
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  pub fn offline_store(&self) -> &Arc<dyn OfflineStorage> {
    &self.offline
  }

  /// Route credential expiry into the session controller.
  fn guard<T>(&self, result: Result<T>) -> Result<T> {
    if let Err(DataError::AuthExpired) = &result {
      self.session.on_auth_expired();
    }
    result
  }

  pub async fn login(&self, username: &str, password: &str) -> Result<Session> {
    self.session.login(username, password).await
  }

  pub fn set_credential(&self, token: impl Into<String>) -> Session {
    self.session.set_credential(token)
  }

  pub fn logout(&self) {
    self.session.logout();
  }

  /// Revalidating read of one resource.
  pub async fn read_resource(&self, key: &ResourceKey) -> Result<CacheResult<Value>> {
    self.guard(self.cache.fetch(key).await)
  }

  async fn read_typed<T: DeserializeOwned>(&self, key: &ResourceKey) -> Result<CacheResult<T>> {
    let result = self.read_resource(key).await?;
    let source = result.source;
    let cached_at = result.cached_at;
    let data = serde_json::from_value(result.data)?;
    Ok(CacheResult {
      data,
      source,
      cached_at,
    })
  }

  /// Run a write and invalidate the resources it touches.
  ///
  /// The targets are only invalidated when the write succeeds.
  pub async fn mutate<T, F, Fut>(&self, targets: &[ResourceKey], op: F) -> Result<T>
  where
    F: FnOnce(Arc<dyn Backend>) -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let result = self.guard(op(self.backend.clone()).await);
    if result.is_ok() {
      debug!(targets = targets.len(), "Mutation succeeded, invalidating targets");
      self.cache.invalidate(targets);
    }
    result
  }

  pub async fn upload_file(&self, file: &UploadFile, folder_id: u64) -> Result<UploadOutcome> {
    self.guard(self.transfers.upload(file, folder_id).await)
  }

  pub async fn download_file(&self, file_id: u64, persist_offline: bool) -> Result<DownloadOutcome> {
    self.guard(self.transfers.download(file_id, persist_offline).await)
  }

  /// Download a file and keep it for offline use.
  pub async fn pin_offline(&self, file_id: u64) -> Result<DownloadOutcome> {
    self.download_file(file_id, true).await
  }

  pub fn unpin_offline(&self, file_id: u64) -> Result<bool> {
    self.offline.remove(file_id)
  }

  pub fn list_offline_files(&self) -> Result<Vec<OfflineMetadata>> {
    self.offline.list_metadata()
  }

  pub fn list_offline_files_in_folder(&self, folder_id: u64) -> Result<Vec<OfflineMetadata>> {
    self.offline.list_metadata_by_folder(folder_id)
  }

  pub fn offline_storage_size(&self) -> Result<u64> {
    self.offline.total_bytes()
  }

  pub fn clear_offline_files(&self) -> Result<usize> {
    self.offline.clear_all()
  }

  pub async fn list_folders(&self) -> Result<CacheResult<Vec<RemoteFolder>>> {
    self.read_typed(&ResourceKey::Folders).await
  }

  pub async fn list_files(&self, folder_id: u64) -> Result<CacheResult<Vec<RemoteFile>>> {
    self.read_typed(&ResourceKey::FolderFiles { folder_id }).await
  }

  /// Delete a file on the server.
  ///
  /// Also forgets the captured download and drops any pinned copy, so a later
  /// download or listing cannot resurrect the deleted content.
  pub async fn delete_file(&self, file_id: u64, folder_id: u64) -> Result<()> {
    let path = ResourceKey::File { id: file_id }.path();
    self
      .mutate(
        &[
          ResourceKey::FolderFiles { folder_id },
          ResourceKey::File { id: file_id },
        ],
        |backend| async move {
          status::classify(backend.delete(&path).await?)?;
          Ok(())
        },
      )
      .await?;

    self.transfers.registry().forget(&download_fingerprint(file_id));
    match self.offline.remove(file_id) {
      Ok(true) => debug!(file_id, "Removed offline copy of deleted file"),
      Ok(false) => {}
      Err(e) => warn!(file_id, error = %e, "Failed to remove offline copy of deleted file"),
    }
    info!(file_id, folder_id, "File deleted");
    Ok(())
  }
}
