//! Versioned layout of the offline store.
//!
//! The store's version lives in `PRAGMA user_version`. Migrations run in order
//! inside the exclusive open section; each one must be safe to run again.

/// Layout version this build reads and writes.
pub const SCHEMA_VERSION: i64 = 2;

pub struct Migration {
  pub version: i64,
  pub description: &'static str,
  pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
  Migration {
    version: 1,
    description: "file content table",
    sql: r#"
CREATE TABLE IF NOT EXISTS offline_files (
    file_id INTEGER PRIMARY KEY,
    content BLOB NOT NULL,
    folder_id INTEGER,
    display_name TEXT NOT NULL,
    media_type TEXT,
    byte_size INTEGER NOT NULL,
    cached_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_offline_files_folder ON offline_files(folder_id);
CREATE INDEX IF NOT EXISTS idx_offline_files_cached_at ON offline_files(cached_at);
"#,
  },
  Migration {
    version: 2,
    description: "metadata table for listing without loading content",
    sql: r#"
CREATE TABLE IF NOT EXISTS file_metadata (
    file_id INTEGER PRIMARY KEY,
    folder_id INTEGER,
    display_name TEXT NOT NULL,
    media_type TEXT,
    byte_size INTEGER NOT NULL,
    cached_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_file_metadata_folder ON file_metadata(folder_id);
CREATE INDEX IF NOT EXISTS idx_file_metadata_cached_at ON file_metadata(cached_at);

-- Every content row gets its metadata twin, orphans are dropped.
INSERT OR IGNORE INTO file_metadata (file_id, folder_id, display_name, media_type, byte_size, cached_at)
    SELECT file_id, folder_id, display_name, media_type, byte_size, cached_at FROM offline_files;

DELETE FROM file_metadata WHERE file_id NOT IN (SELECT file_id FROM offline_files);
"#,
  },
];

/// Tables this client owns; anything else in a version-0 file means a foreign layout.
pub const OWNED_TABLES: &[&str] = &["offline_files", "file_metadata"];

/// Migrations needed to bring a store at `from` up to [`SCHEMA_VERSION`].
pub fn pending(from: i64) -> impl Iterator<Item = &'static Migration> {
  MIGRATIONS
    .iter()
    .filter(move |m| m.version > from && m.version <= SCHEMA_VERSION)
}
