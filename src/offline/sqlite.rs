//! SQLite-backed offline store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};

use super::schema::{self, OWNED_TABLES, SCHEMA_VERSION};
use super::{FileDescriptor, OfflineMetadata, OfflineStorage, StoreEvent};
use crate::error::{DataError, Result};

const METADATA_COLUMNS: &str = "file_id, folder_id, display_name, media_type, byte_size, cached_at";

/// What the exclusive open section found.
enum Prepared {
  Ready { from: i64 },
  Incompatible { found: i64 },
}

pub struct SqliteOfflineStore {
  conn: Mutex<Connection>,
  events: Vec<StoreEvent>,
}

impl SqliteOfflineStore {
  /// Open (or create) the store at `path`, upgrading older layouts.
  ///
  /// A file with a newer or unrecognized layout is deleted and recreated empty;
  /// the returned store reports this through [`OfflineStorage::events`]. If
  /// another process holds the database for longer than `busy_timeout` the
  /// open fails with [`DataError::StoreBlocked`].
  pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
    let path = path.as_ref().to_path_buf();

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        DataError::PersistentStoreUnavailable(format!(
          "Failed to create directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let mut events = Vec::new();
    // Second pass only happens after a self-heal.
    for _ in 0..2 {
      let mut conn = Connection::open(&path)?;
      conn.busy_timeout(busy_timeout)?;

      let prepared = match Self::prepare(&mut conn) {
        Ok(prepared) => prepared,
        Err(e) if e.sqlite_error_code() == Some(ErrorCode::NotADatabase) => {
          Prepared::Incompatible { found: 0 }
        }
        Err(e) => {
          if e.sqlite_error_code() == Some(ErrorCode::DatabaseBusy) {
            warn!(path = %path.display(), "Offline store is held by another process");
          }
          return Err(e.into());
        }
      };

      match prepared {
        Prepared::Ready { from } => {
          if from > 0 && from < SCHEMA_VERSION {
            events.push(StoreEvent::Migrated {
              from,
              to: SCHEMA_VERSION,
            });
          }
          debug!(path = %path.display(), version = SCHEMA_VERSION, "Offline store ready");
          return Ok(Self {
            conn: Mutex::new(conn),
            events,
          });
        }
        Prepared::Incompatible { found } => {
          if !events.is_empty() {
            break;
          }
          warn!(
            path = %path.display(),
            found,
            expected = SCHEMA_VERSION,
            "Offline store has an incompatible layout, recreating it empty"
          );
          drop(conn);
          remove_database_files(&path)?;
          events.push(StoreEvent::SchemaIncompatible {
            found,
            expected: SCHEMA_VERSION,
          });
        }
      }
    }

    let found = match events.first() {
      Some(StoreEvent::SchemaIncompatible { found, .. }) => *found,
      _ => 0,
    };
    Err(DataError::SchemaIncompatible {
      found,
      expected: SCHEMA_VERSION,
    })
  }

  /// Check the version and run pending migrations while holding the write lock.
  fn prepare(conn: &mut Connection) -> rusqlite::Result<Prepared> {
    conn.pragma_update(None, "journal_mode", "WAL")?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
    let version: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version > SCHEMA_VERSION {
      return Ok(Prepared::Incompatible { found: version });
    }

    if version == 0 {
      let tables: Vec<String> = {
        let mut stmt = tx.prepare(
          "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )?;
        let names = stmt
          .query_map([], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        names
      };
      if tables.iter().any(|t| !OWNED_TABLES.contains(&t.as_str())) {
        return Ok(Prepared::Incompatible { found: 0 });
      }
    }

    for migration in schema::pending(version) {
      info!(
        version = migration.version,
        description = migration.description,
        "Applying offline store migration"
      );
      tx.execute_batch(migration.sql)?;
    }
    if version < SCHEMA_VERSION {
      tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    tx.commit()?;

    Ok(Prepared::Ready { from: version })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| DataError::PersistentStoreUnavailable(format!("Lock poisoned: {}", e)))
  }
}

/// Delete the database and its WAL side files.
fn remove_database_files(path: &Path) -> Result<()> {
  for suffix in ["", "-wal", "-shm"] {
    let mut candidate = path.as_os_str().to_os_string();
    candidate.push(suffix);
    match std::fs::remove_file(&candidate) {
      Ok(()) => {}
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => {
        return Err(DataError::PersistentStoreUnavailable(format!(
          "Failed to delete incompatible store {}: {}",
          path.display(),
          e
        )))
      }
    }
  }
  Ok(())
}

fn timestamp(at: DateTime<Utc>) -> String {
  // Fixed width so lexical order matches time order.
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Read a metadata record starting at column `offset`.
fn metadata_from_row(row: &Row, offset: usize) -> rusqlite::Result<OfflineMetadata> {
  let cached_at: String = row.get(offset + 5)?;
  let cached_at = DateTime::parse_from_rfc3339(&cached_at)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(offset + 5, Type::Text, Box::new(e)))?;

  Ok(OfflineMetadata {
    file_id: row.get(offset)?,
    folder_id: row.get(offset + 1)?,
    display_name: row.get(offset + 2)?,
    media_type: row.get(offset + 3)?,
    byte_size: row.get(offset + 4)?,
    cached_at,
  })
}

impl OfflineStorage for SqliteOfflineStore {
  fn put(&self, file_id: u64, content: &[u8], descriptor: &FileDescriptor) -> Result<OfflineMetadata> {
    let mut conn = self.lock()?;
    let metadata = OfflineMetadata {
      file_id,
      folder_id: descriptor.folder_id,
      display_name: descriptor.display_name.clone(),
      media_type: descriptor.media_type.clone(),
      byte_size: content.len() as u64,
      cached_at: Utc::now(),
    };
    let cached_at = timestamp(metadata.cached_at);

    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR REPLACE INTO offline_files (file_id, content, folder_id, display_name, media_type, byte_size, cached_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
      params![
        metadata.file_id,
        content,
        metadata.folder_id,
        metadata.display_name,
        metadata.media_type,
        metadata.byte_size,
        cached_at
      ],
    )?;
    tx.execute(
      "INSERT OR REPLACE INTO file_metadata (file_id, folder_id, display_name, media_type, byte_size, cached_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
      params![
        metadata.file_id,
        metadata.folder_id,
        metadata.display_name,
        metadata.media_type,
        metadata.byte_size,
        cached_at
      ],
    )?;
    tx.commit()?;

    debug!(file_id, size = metadata.byte_size, "Stored file offline");
    Ok(metadata)
  }

  fn get(&self, file_id: u64) -> Result<Option<(Bytes, OfflineMetadata)>> {
    let conn = self.lock()?;
    let found = conn
      .query_row(
        &format!(
          "SELECT content, {} FROM offline_files WHERE file_id = ?1",
          METADATA_COLUMNS
        ),
        params![file_id],
        |row| {
          let content: Vec<u8> = row.get(0)?;
          Ok((Bytes::from(content), metadata_from_row(row, 1)?))
        },
      )
      .optional()?;
    Ok(found)
  }

  fn get_metadata(&self, file_id: u64) -> Result<Option<OfflineMetadata>> {
    let conn = self.lock()?;
    let found = conn
      .query_row(
        &format!(
          "SELECT {} FROM file_metadata WHERE file_id = ?1",
          METADATA_COLUMNS
        ),
        params![file_id],
        |row| metadata_from_row(row, 0),
      )
      .optional()?;
    Ok(found)
  }

  fn has(&self, file_id: u64) -> Result<bool> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM file_metadata WHERE file_id = ?1",
      params![file_id],
      |row| row.get(0),
    )?;
    Ok(count > 0)
  }

  fn remove(&self, file_id: u64) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let removed = tx.execute(
      "DELETE FROM offline_files WHERE file_id = ?1",
      params![file_id],
    )?;
    tx.execute(
      "DELETE FROM file_metadata WHERE file_id = ?1",
      params![file_id],
    )?;
    tx.commit()?;

    if removed > 0 {
      debug!(file_id, "Removed offline file");
    }
    Ok(removed > 0)
  }

  fn list_metadata(&self) -> Result<Vec<OfflineMetadata>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM file_metadata ORDER BY cached_at DESC, file_id",
      METADATA_COLUMNS
    ))?;
    let rows = stmt
      .query_map([], |row| metadata_from_row(row, 0))?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
  }

  fn list_metadata_by_folder(&self, folder_id: u64) -> Result<Vec<OfflineMetadata>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM file_metadata WHERE folder_id = ?1 ORDER BY cached_at DESC, file_id",
      METADATA_COLUMNS
    ))?;
    let rows = stmt
      .query_map(params![folder_id], |row| metadata_from_row(row, 0))?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
  }

  fn total_bytes(&self) -> Result<u64> {
    let conn = self.lock()?;
    let total: i64 = conn.query_row(
      "SELECT COALESCE(SUM(byte_size), 0) FROM offline_files",
      [],
      |row| row.get(0),
    )?;
    Ok(total.max(0) as u64)
  }

  fn clear_all(&self) -> Result<usize> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let removed = tx.execute("DELETE FROM offline_files", [])?;
    tx.execute("DELETE FROM file_metadata", [])?;
    tx.commit()?;

    info!(removed, "Cleared offline store");
    Ok(removed)
  }

  fn events(&self) -> Vec<StoreEvent> {
    self.events.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use tempfile::TempDir;

  const TIMEOUT: Duration = Duration::from_secs(5);

  fn open_in(dir: &TempDir) -> SqliteOfflineStore {
    SqliteOfflineStore::open(dir.path().join("offline.db"), TIMEOUT).unwrap()
  }

  fn user_version(path: &Path) -> i64 {
    let conn = Connection::open(path).unwrap();
    conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .unwrap()
  }

  #[test]
  fn test_put_and_get_pair() {
    let dir = TempDir::new().unwrap();
    let store = open_in(&dir);
    assert!(store.events().is_empty());

    let descriptor = FileDescriptor::new("report.pdf")
      .in_folder(7)
      .with_media_type("application/pdf");
    let stored = store.put(42, b"%PDF-1.7", &descriptor).unwrap();
    assert_eq!(stored.byte_size, 8);

    let (content, metadata) = store.get(42).unwrap().unwrap();
    assert_eq!(&content[..], b"%PDF-1.7");
    assert_eq!(metadata, stored);
    assert_eq!(metadata.descriptor(), descriptor);
    assert_eq!(store.get_metadata(42).unwrap(), Some(stored));
    assert!(store.has(42).unwrap());
    assert!(store.get(43).unwrap().is_none());
  }

  #[test]
  fn test_put_twice_keeps_one_pair() {
    let dir = TempDir::new().unwrap();
    let store = open_in(&dir);
    let descriptor = FileDescriptor::new("a.txt").in_folder(1);

    store.put(1, b"first", &descriptor).unwrap();
    store.put(1, b"second!", &descriptor).unwrap();

    let listed = store.list_metadata().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].byte_size, 7);
    assert_eq!(&store.get(1).unwrap().unwrap().0[..], b"second!");
    assert_eq!(store.total_bytes().unwrap(), 7);
  }

  #[test]
  fn test_remove_drops_both_records() {
    let dir = TempDir::new().unwrap();
    let store = open_in(&dir);
    store.put(5, b"x", &FileDescriptor::new("x")).unwrap();

    assert!(store.remove(5).unwrap());
    assert!(!store.has(5).unwrap());
    assert!(store.get(5).unwrap().is_none());
    assert!(store.get_metadata(5).unwrap().is_none());
    // Absent file is fine.
    assert!(!store.remove(5).unwrap());
  }

  #[test]
  fn test_list_by_folder_and_clear() {
    let dir = TempDir::new().unwrap();
    let store = open_in(&dir);
    store.put(1, b"aa", &FileDescriptor::new("a").in_folder(10)).unwrap();
    store.put(2, b"bbb", &FileDescriptor::new("b").in_folder(10)).unwrap();
    store.put(3, b"c", &FileDescriptor::new("c").in_folder(20)).unwrap();
    store.put(4, b"d", &FileDescriptor::new("root")).unwrap();

    let mut in_ten: Vec<u64> = store
      .list_metadata_by_folder(10)
      .unwrap()
      .into_iter()
      .map(|m| m.file_id)
      .collect();
    in_ten.sort();
    assert_eq!(in_ten, vec![1, 2]);
    assert_eq!(store.total_bytes().unwrap(), 7);

    assert_eq!(store.clear_all().unwrap(), 4);
    assert!(store.list_metadata().unwrap().is_empty());
    assert_eq!(store.total_bytes().unwrap(), 0);
  }

  #[test]
  fn test_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
      let store = open_in(&dir);
      store.put(9, b"keep", &FileDescriptor::new("keep.txt")).unwrap();
    }
    let store = open_in(&dir);
    assert!(store.events().is_empty());
    assert_eq!(&store.get(9).unwrap().unwrap().0[..], b"keep");
  }

  #[test]
  fn test_newer_version_is_recreated() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("offline.db");
    {
      let store = open_in(&dir);
      store.put(1, b"old", &FileDescriptor::new("old")).unwrap();
    }
    {
      let conn = Connection::open(&path).unwrap();
      conn.pragma_update(None, "user_version", 99).unwrap();
    }

    let store = open_in(&dir);
    assert_eq!(
      store.events(),
      vec![StoreEvent::SchemaIncompatible {
        found: 99,
        expected: SCHEMA_VERSION
      }]
    );
    assert!(store.list_metadata().unwrap().is_empty());
    store.put(2, b"new", &FileDescriptor::new("new")).unwrap();
    drop(store);
    assert_eq!(user_version(&path), SCHEMA_VERSION);
  }

  #[test]
  fn test_garbage_file_is_recreated() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("offline.db");
    std::fs::write(&path, vec![b'x'; 4096]).unwrap();

    let store = open_in(&dir);
    assert!(matches!(
      store.events().as_slice(),
      [StoreEvent::SchemaIncompatible { .. }]
    ));
    assert!(store.list_metadata().unwrap().is_empty());
  }

  #[test]
  fn test_foreign_tables_are_recreated() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("offline.db");
    {
      let conn = Connection::open(&path).unwrap();
      conn
        .execute_batch("CREATE TABLE something_else (id INTEGER);")
        .unwrap();
    }

    let store = open_in(&dir);
    assert_eq!(
      store.events(),
      vec![StoreEvent::SchemaIncompatible {
        found: 0,
        expected: SCHEMA_VERSION
      }]
    );
  }

  #[test]
  fn test_v1_store_is_upgraded_with_metadata_backfill() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("offline.db");
    {
      let conn = Connection::open(&path).unwrap();
      conn.execute_batch(schema::MIGRATIONS[0].sql).unwrap();
      conn
        .execute(
          "INSERT INTO offline_files (file_id, content, folder_id, display_name, media_type, byte_size, cached_at)
           VALUES (7, x'0102', 3, 'legacy.bin', NULL, 2, '2026-01-01T00:00:00.000000Z')",
          [],
        )
        .unwrap();
      conn.pragma_update(None, "user_version", 1).unwrap();
    }

    let store = open_in(&dir);
    assert_eq!(
      store.events(),
      vec![StoreEvent::Migrated {
        from: 1,
        to: SCHEMA_VERSION
      }]
    );
    let listed = store.list_metadata_by_folder(3).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].display_name, "legacy.bin");
    assert_eq!(&store.get(7).unwrap().unwrap().0[..], &[1u8, 2]);
  }

  #[test]
  fn test_held_lock_reports_blocked() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("offline.db");
    drop(open_in(&dir));

    let holder = Connection::open(&path).unwrap();
    holder.execute_batch("BEGIN EXCLUSIVE;").unwrap();

    let result = SqliteOfflineStore::open(&path, Duration::from_millis(50));
    assert!(matches!(result, Err(DataError::StoreBlocked)));

    holder.execute_batch("COMMIT;").unwrap();
    assert!(SqliteOfflineStore::open(&path, TIMEOUT).is_ok());
  }

  #[test]
  fn test_concurrent_opens_agree_on_version() {
    let dir = Arc::new(TempDir::new().unwrap());
    let handles: Vec<_> = (0..4)
      .map(|_| {
        let dir = Arc::clone(&dir);
        std::thread::spawn(move || {
          SqliteOfflineStore::open(dir.path().join("offline.db"), TIMEOUT).map(|s| s.events())
        })
      })
      .collect();

    for handle in handles {
      let events = handle.join().unwrap().unwrap();
      assert!(events.is_empty());
    }
    assert_eq!(user_version(&dir.path().join("offline.db")), SCHEMA_VERSION);
  }
}
