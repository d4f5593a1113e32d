//! Resource keys for the backend's read endpoints.

use std::fmt;

use sha2::{Digest, Sha256};

/// Identity of a cacheable read endpoint.
///
/// One key corresponds to one endpoint+params combination; the conditional
/// cache and the query cache are both keyed by [`ResourceKey::cache_key`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKey {
  /// All folders owned by the current user
  Folders,
  /// A single folder
  Folder { id: u64 },
  /// Files inside a folder
  FolderFiles { folder_id: u64 },
  /// A single file's metadata
  File { id: u64 },
  /// Files other users shared with the current user
  SharedFiles,
}

impl ResourceKey {
  /// REST path relative to the backend base URL.
  pub fn path(&self) -> String {
    match self {
      Self::Folders => "/api/folders".to_string(),
      Self::Folder { id } => format!("/api/folders/{}", id),
      Self::FolderFiles { folder_id } => format!("/api/files/folder/{}", folder_id),
      Self::File { id } => format!("/api/files/{}", id),
      Self::SharedFiles => "/api/permissions/shared".to_string(),
    }
  }

  /// Stable string form, hierarchical so whole groups can be invalidated by prefix.
  pub fn cache_key(&self) -> String {
    match self {
      Self::Folders => "folders:list".to_string(),
      Self::Folder { id } => format!("folders:detail:{}", id),
      Self::FolderFiles { folder_id } => format!("files:folder:{}", folder_id),
      Self::File { id } => format!("files:detail:{}", id),
      Self::SharedFiles => "permissions:shared".to_string(),
    }
  }

  /// SHA256 digest of the cache key, for fixed-length log fields.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.cache_key().as_bytes());
    hex::encode(hasher.finalize())
  }

  pub fn description(&self) -> String {
    match self {
      Self::Folders => "all folders".to_string(),
      Self::Folder { id } => format!("folder {}", id),
      Self::FolderFiles { folder_id } => format!("files in folder {}", folder_id),
      Self::File { id } => format!("file {}", id),
      Self::SharedFiles => "shared files".to_string(),
    }
  }
}

impl fmt::Display for ResourceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.cache_key())
  }
}
