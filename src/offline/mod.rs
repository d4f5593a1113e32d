//! Durable store of pinned file content.
//!
//! Each pinned file is kept as a content record plus a metadata record. The two
//! are always written and removed together, so listing metadata never shows a
//! file whose bytes are gone.

mod schema;
mod sqlite;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{DataError, Result};

pub use schema::SCHEMA_VERSION;
pub use sqlite::SqliteOfflineStore;

/// What the caller knows about a file when pinning it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDescriptor {
  pub folder_id: Option<u64>,
  pub display_name: String,
  pub media_type: Option<String>,
}

impl FileDescriptor {
  pub fn new(display_name: impl Into<String>) -> Self {
    Self {
      display_name: display_name.into(),
      ..Default::default()
    }
  }

  pub fn in_folder(mut self, folder_id: u64) -> Self {
    self.folder_id = Some(folder_id);
    self
  }

  pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
    self.media_type = Some(media_type.into());
    self
  }
}

/// Metadata record of a pinned file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfflineMetadata {
  pub file_id: u64,
  pub folder_id: Option<u64>,
  pub display_name: String,
  pub media_type: Option<String>,
  pub byte_size: u64,
  pub cached_at: DateTime<Utc>,
}

impl OfflineMetadata {
  pub fn descriptor(&self) -> FileDescriptor {
    FileDescriptor {
      folder_id: self.folder_id,
      display_name: self.display_name.clone(),
      media_type: self.media_type.clone(),
    }
  }
}

/// Something notable that happened while opening the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
  /// An older layout was upgraded in place.
  Migrated { from: i64, to: i64 },
  /// The file held a layout this build cannot read; it was deleted and recreated.
  SchemaIncompatible { found: i64, expected: i64 },
}

/// Storage backend for pinned files.
///
/// Implementations must keep the content/metadata pair invariant: `put`,
/// `remove` and `clear_all` change both records or neither.
pub trait OfflineStorage: Send + Sync {
  /// Store or replace the content and metadata of a file.
  fn put(&self, file_id: u64, content: &[u8], descriptor: &FileDescriptor) -> Result<OfflineMetadata>;

  /// Content and metadata of a pinned file.
  fn get(&self, file_id: u64) -> Result<Option<(Bytes, OfflineMetadata)>>;

  fn get_metadata(&self, file_id: u64) -> Result<Option<OfflineMetadata>>;

  fn has(&self, file_id: u64) -> Result<bool>;

  /// Remove both records. Removing an absent file is not an error.
  fn remove(&self, file_id: u64) -> Result<bool>;

  /// All metadata, most recently cached first.
  fn list_metadata(&self) -> Result<Vec<OfflineMetadata>>;

  fn list_metadata_by_folder(&self, folder_id: u64) -> Result<Vec<OfflineMetadata>>;

  /// Sum of content sizes.
  fn total_bytes(&self) -> Result<u64>;

  /// Drop every pinned file. Returns how many were removed.
  fn clear_all(&self) -> Result<usize>;

  /// Events recorded while opening, oldest first.
  fn events(&self) -> Vec<StoreEvent> {
    Vec::new()
  }
}

/// Stand-in used when the durable store could not be opened.
///
/// Every operation fails with the error the open failed with, so a blocked
/// store reads as blocked and never as an empty one.
pub struct UnavailableStore {
  cause: Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Unavailable {
  Blocked,
  Failed(String),
}

impl UnavailableStore {
  pub fn new(reason: impl Into<String>) -> Self {
    Self {
      cause: Unavailable::Failed(reason.into()),
    }
  }

  /// Another process held the store while it was being opened.
  pub fn blocked() -> Self {
    Self {
      cause: Unavailable::Blocked,
    }
  }

  /// Keep the cause of a failed open.
  pub fn from_error(error: &DataError) -> Self {
    match error {
      DataError::StoreBlocked => Self::blocked(),
      DataError::PersistentStoreUnavailable(reason) => Self::new(reason.clone()),
      other => Self::new(other.to_string()),
    }
  }

  fn error(&self) -> DataError {
    match &self.cause {
      Unavailable::Blocked => DataError::StoreBlocked,
      Unavailable::Failed(reason) => DataError::PersistentStoreUnavailable(reason.clone()),
    }
  }
}

impl OfflineStorage for UnavailableStore {
  fn put(&self, _file_id: u64, _content: &[u8], _descriptor: &FileDescriptor) -> Result<OfflineMetadata> {
    Err(self.error())
  }

  fn get(&self, _file_id: u64) -> Result<Option<(Bytes, OfflineMetadata)>> {
    Err(self.error())
  }

  fn get_metadata(&self, _file_id: u64) -> Result<Option<OfflineMetadata>> {
    Err(self.error())
  }

  fn has(&self, _file_id: u64) -> Result<bool> {
    Err(self.error())
  }

  fn remove(&self, _file_id: u64) -> Result<bool> {
    Err(self.error())
  }

  fn list_metadata(&self) -> Result<Vec<OfflineMetadata>> {
    Err(self.error())
  }

  fn list_metadata_by_folder(&self, _folder_id: u64) -> Result<Vec<OfflineMetadata>> {
    Err(self.error())
  }

  fn total_bytes(&self) -> Result<u64> {
    Err(self.error())
  }

  fn clear_all(&self) -> Result<usize> {
    Err(self.error())
  }
}
