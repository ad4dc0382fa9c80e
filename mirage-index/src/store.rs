//! Persistent item state store
//!
//! Tracked entries (`items`) and their side data (`side_data`) are stored in
//! separate tables. Moving or deleting an item touches both inside one
//! transaction; an orphaned side-data row left by a crash is harmless and
//! removed by [`ItemStore::purge_orphans`].

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::{IndexError, Result};
use crate::item::{
    key_path, path_key, ItemRow, ItemState, LocalFingerprint, LockRecord, PinState, RemoteId,
    SideData,
};
use crate::schema::{SCHEMA, SCHEMA_VERSION};

const ITEM_COLUMNS: &str = "path, file_id, is_dir, remote_id, in_sync, original_path, \
                            pin_state, hydrated, local_size, local_modified";

/// Matches a path and everything below it; `?1` is the path key
const SUBTREE: &str = "(path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/')";

fn map_item_row(row: &Row<'_>) -> rusqlite::Result<ItemRow> {
    let path: String = row.get(0)?;
    let file_id: Option<i64> = row.get(1)?;
    let remote_id: Option<String> = row.get(3)?;
    let original_path: Option<String> = row.get(5)?;
    let local_size: Option<i64> = row.get(8)?;
    let local_modified: Option<i64> = row.get(9)?;

    Ok(ItemRow {
        path: key_path(&path),
        file_id: file_id.map(|id| id as u64),
        is_dir: row.get(2)?,
        remote_id: remote_id.map(RemoteId),
        in_sync: row.get(4)?,
        original_path: original_path.map(|p| key_path(&p)),
        pin_state: PinState::from_db(row.get(6)?),
        hydrated: row.get(7)?,
        fingerprint: match (local_size, local_modified) {
            (Some(size), Some(modified)) => Some(LocalFingerprint {
                size: size as u64,
                modified,
            }),
            _ => None,
        },
    })
}

/// Synchronous SQLite-backed store
pub struct ItemDatabase {
    conn: Connection,
}

impl ItemDatabase {
    /// Open or create a database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );",
        )?;

        let version: Option<u32> = self
            .conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match version {
            None => {
                info!("Initializing new item state schema");
                self.conn.execute_batch(SCHEMA)?;
                self.conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(v) if v != SCHEMA_VERSION => {
                return Err(IndexError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION,
                    actual: v,
                });
            }
            Some(_) => {
                debug!("Item state schema up to date (version {})", SCHEMA_VERSION);
            }
        }

        Ok(())
    }

    pub fn get_item(&self, path: &Path) -> Result<Option<ItemRow>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE path = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![path_key(path)], map_item_row)
            .optional()?)
    }

    pub fn find_by_file_id(&self, file_id: u64) -> Result<Option<ItemRow>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE file_id = ?1 LIMIT 1");
        Ok(self
            .conn
            .query_row(&sql, params![file_id as i64], map_item_row)
            .optional()?)
    }

    pub fn find_by_remote_id(&self, remote_id: &RemoteId) -> Result<Option<ItemRow>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE remote_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![remote_id.as_str()], map_item_row)
            .optional()?)
    }

    /// Direct children of `folder` (empty path is the sync root)
    pub fn children_of(&self, folder: &Path) -> Result<Vec<ItemRow>> {
        let key = path_key(folder);
        let mut rows = Vec::new();

        if key.is_empty() {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} FROM items WHERE instr(path, '/') = 0 ORDER BY path"
            );
            let mut stmt = self.conn.prepare(&sql)?;
            for row in stmt.query_map([], map_item_row)? {
                rows.push(row?);
            }
        } else {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} FROM items
                 WHERE substr(path, 1, length(?1) + 1) = ?1 || '/'
                   AND instr(substr(path, length(?1) + 2), '/') = 0
                 ORDER BY path"
            );
            let mut stmt = self.conn.prepare(&sql)?;
            for row in stmt.query_map(params![key], map_item_row)? {
                rows.push(row?);
            }
        }

        Ok(rows)
    }

    pub fn upsert_item(&mut self, item: &ItemRow) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO items (path, file_id, is_dir, remote_id, in_sync, original_path,
                               pin_state, hydrated, local_size, local_modified, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, CURRENT_TIMESTAMP)
            ON CONFLICT(path) DO UPDATE SET
                file_id = excluded.file_id,
                is_dir = excluded.is_dir,
                remote_id = excluded.remote_id,
                in_sync = excluded.in_sync,
                original_path = excluded.original_path,
                pin_state = excluded.pin_state,
                hydrated = excluded.hydrated,
                local_size = excluded.local_size,
                local_modified = excluded.local_modified,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                path_key(&item.path),
                item.file_id.map(|id| id as i64),
                item.is_dir,
                item.remote_id.as_ref().map(RemoteId::as_str),
                item.in_sync,
                item.original_path.as_deref().map(path_key),
                item.pin_state.to_db(),
                item.hydrated,
                item.fingerprint.map(|f| f.size as i64),
                item.fingerprint.map(|f| f.modified),
            ],
        )?;
        Ok(())
    }

    fn update_item(&mut self, path: &Path, sql: &str, value: &dyn rusqlite::ToSql) -> Result<()> {
        let changed = self.conn.execute(sql, params![path_key(path), value])?;
        if changed == 0 {
            return Err(IndexError::NotTracked(path.to_path_buf()));
        }
        Ok(())
    }

    pub fn set_in_sync(
        &mut self,
        path: &Path,
        in_sync: bool,
        fingerprint: Option<LocalFingerprint>,
    ) -> Result<()> {
        let changed = self.conn.execute(
            r#"
            UPDATE items SET in_sync = ?2,
                local_size = COALESCE(?3, local_size),
                local_modified = COALESCE(?4, local_modified),
                updated_at = CURRENT_TIMESTAMP
            WHERE path = ?1
            "#,
            params![
                path_key(path),
                in_sync,
                fingerprint.map(|f| f.size as i64),
                fingerprint.map(|f| f.modified),
            ],
        )?;
        if changed == 0 {
            return Err(IndexError::NotTracked(path.to_path_buf()));
        }
        Ok(())
    }

    pub fn set_original_path(&mut self, path: &Path, original: Option<&Path>) -> Result<()> {
        self.update_item(
            path,
            "UPDATE items SET original_path = ?2, updated_at = CURRENT_TIMESTAMP WHERE path = ?1",
            &original.map(path_key),
        )
    }

    pub fn set_remote_id(&mut self, path: &Path, remote_id: &RemoteId) -> Result<()> {
        self.update_item(
            path,
            "UPDATE items SET remote_id = ?2, updated_at = CURRENT_TIMESTAMP WHERE path = ?1",
            &remote_id.as_str(),
        )
    }

    pub fn set_file_id(&mut self, path: &Path, file_id: Option<u64>) -> Result<()> {
        self.update_item(
            path,
            "UPDATE items SET file_id = ?2 WHERE path = ?1",
            &file_id.map(|id| id as i64),
        )
    }

    pub fn set_pin_state(&mut self, path: &Path, pin_state: PinState) -> Result<()> {
        self.update_item(
            path,
            "UPDATE items SET pin_state = ?2, updated_at = CURRENT_TIMESTAMP WHERE path = ?1",
            &pin_state.to_db(),
        )
    }

    pub fn set_hydrated(
        &mut self,
        path: &Path,
        hydrated: bool,
        fingerprint: Option<LocalFingerprint>,
    ) -> Result<()> {
        let changed = self.conn.execute(
            r#"
            UPDATE items SET hydrated = ?2,
                local_size = COALESCE(?3, local_size),
                local_modified = COALESCE(?4, local_modified),
                updated_at = CURRENT_TIMESTAMP
            WHERE path = ?1
            "#,
            params![
                path_key(path),
                hydrated,
                fingerprint.map(|f| f.size as i64),
                fingerprint.map(|f| f.modified),
            ],
        )?;
        if changed == 0 {
            return Err(IndexError::NotTracked(path.to_path_buf()));
        }
        Ok(())
    }

    /// Rewrite `original_path` of descendants after their folder moved remotely
    pub fn rebase_original_paths(&mut self, old_prefix: &Path, new_prefix: &Path) -> Result<usize> {
        let changed = self.conn.execute(
            r#"
            UPDATE items SET original_path = ?2 || substr(original_path, length(?1) + 1)
            WHERE substr(original_path, 1, length(?1) + 1) = ?1 || '/'
            "#,
            params![path_key(old_prefix), path_key(new_prefix)],
        )?;
        Ok(changed)
    }

    pub fn get_side_data(&self, path: &Path) -> Result<SideData> {
        let row = self
            .conn
            .query_row(
                "SELECT etag, remote_modified, lock_record, columns FROM side_data WHERE path = ?1",
                params![path_key(path)],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((etag, remote_modified, lock_json, columns_json)) = row else {
            return Ok(SideData::default());
        };

        let lock = match lock_json {
            Some(json) => Some(serde_json::from_str::<LockRecord>(&json)?),
            None => None,
        };
        let columns: BTreeMap<String, String> = serde_json::from_str(&columns_json)?;

        Ok(SideData {
            etag,
            remote_modified: remote_modified.and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }),
            lock,
            columns,
        })
    }

    pub fn set_etag(
        &mut self,
        path: &Path,
        etag: Option<&str>,
        remote_modified: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO side_data (path, etag, remote_modified) VALUES (?1, ?2, ?3)
            ON CONFLICT(path) DO UPDATE SET
                etag = excluded.etag,
                remote_modified = excluded.remote_modified,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                path_key(path),
                etag,
                remote_modified.map(|dt| dt.to_rfc3339())
            ],
        )?;
        Ok(())
    }

    pub fn set_lock(&mut self, path: &Path, lock: Option<&LockRecord>) -> Result<()> {
        let json = match lock {
            Some(record) => Some(serde_json::to_string(record)?),
            None => None,
        };
        self.conn.execute(
            r#"
            INSERT INTO side_data (path, lock_record) VALUES (?1, ?2)
            ON CONFLICT(path) DO UPDATE SET
                lock_record = excluded.lock_record,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![path_key(path), json],
        )?;
        Ok(())
    }

    /// Set (`Some`) or clear (`None`) one display column
    pub fn set_column(&mut self, path: &Path, key: &str, value: Option<&str>) -> Result<()> {
        let mut columns = self.get_side_data(path)?.columns;
        match value {
            Some(v) => {
                columns.insert(key.to_string(), v.to_string());
            }
            None => {
                if columns.remove(key).is_none() {
                    return Ok(());
                }
            }
        }
        self.conn.execute(
            r#"
            INSERT INTO side_data (path, columns) VALUES (?1, ?2)
            ON CONFLICT(path) DO UPDATE SET
                columns = excluded.columns,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![path_key(path), serde_json::to_string(&columns)?],
        )?;
        Ok(())
    }

    pub fn get_state(&self, path: &Path) -> Result<Option<ItemState>> {
        let Some(row) = self.get_item(path)? else {
            return Ok(None);
        };
        let side = self.get_side_data(path)?;
        Ok(Some(ItemState::from_parts(row, side)))
    }

    /// Re-key an item, its descendants and their side data in one transaction
    pub fn move_item(&mut self, old: &Path, new: &Path) -> Result<()> {
        let (old_key, new_key) = (path_key(old), path_key(new));
        if old_key == new_key {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        for table in ["items", "side_data"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE {SUBTREE}"),
                params![new_key],
            )?;
            tx.execute(
                &format!(
                    "UPDATE {table} SET path = ?2 || substr(path, length(?1) + 1) WHERE {SUBTREE}"
                ),
                params![old_key, new_key],
            )?;
        }
        tx.commit()?;

        debug!("Moved item state {} -> {}", old_key, new_key);
        Ok(())
    }

    /// Re-key only the side data of an item and its descendants
    pub fn move_side_data(&mut self, old: &Path, new: &Path) -> Result<()> {
        let (old_key, new_key) = (path_key(old), path_key(new));
        if old_key == new_key {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            &format!("DELETE FROM side_data WHERE {SUBTREE}"),
            params![new_key],
        )?;
        tx.execute(
            &format!("UPDATE side_data SET path = ?2 || substr(path, length(?1) + 1) WHERE {SUBTREE}"),
            params![old_key, new_key],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Forget an item, its descendants and their side data
    pub fn delete_item(&mut self, path: &Path) -> Result<()> {
        let key = path_key(path);
        let tx = self.conn.transaction()?;
        tx.execute(&format!("DELETE FROM items WHERE {SUBTREE}"), params![key])?;
        tx.execute(&format!("DELETE FROM side_data WHERE {SUBTREE}"), params![key])?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_side_data(&mut self, path: &Path) -> Result<()> {
        self.conn.execute(
            &format!("DELETE FROM side_data WHERE {SUBTREE}"),
            params![path_key(path)],
        )?;
        Ok(())
    }

    /// Drop side data whose tracked entry no longer exists
    pub fn purge_orphans(&mut self) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM side_data WHERE path NOT IN (SELECT path FROM items)",
            [],
        )?;
        if removed > 0 {
            info!("Purged {} orphaned side-data entries", removed);
        }
        Ok(removed)
    }

    pub fn item_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Async-safe wrapper around [`ItemDatabase`]
///
/// Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct ItemStore {
    inner: Arc<Mutex<ItemDatabase>>,
}

impl ItemStore {
    pub fn new(database: ItemDatabase) -> Self {
        Self {
            inner: Arc::new(Mutex::new(database)),
        }
    }

    /// Open or create the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(ItemDatabase::open(path)?))
    }

    /// Create an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(ItemDatabase::open_in_memory()?))
    }

    /// Tracked entry plus side data, `None` if the path is not tracked
    pub async fn get(&self, path: &Path) -> Result<Option<ItemState>> {
        self.inner.lock().await.get_state(path)
    }

    pub async fn get_item(&self, path: &Path) -> Result<Option<ItemRow>> {
        self.inner.lock().await.get_item(path)
    }

    pub async fn find_by_file_id(&self, file_id: u64) -> Result<Option<ItemRow>> {
        self.inner.lock().await.find_by_file_id(file_id)
    }

    pub async fn find_by_remote_id(&self, remote_id: &RemoteId) -> Result<Option<ItemRow>> {
        self.inner.lock().await.find_by_remote_id(remote_id)
    }

    pub async fn children_of(&self, folder: &Path) -> Result<Vec<ItemRow>> {
        self.inner.lock().await.children_of(folder)
    }

    pub async fn upsert_item(&self, item: &ItemRow) -> Result<()> {
        self.inner.lock().await.upsert_item(item)
    }

    pub async fn set_in_sync(
        &self,
        path: &Path,
        in_sync: bool,
        fingerprint: Option<LocalFingerprint>,
    ) -> Result<()> {
        self.inner.lock().await.set_in_sync(path, in_sync, fingerprint)
    }

    pub async fn set_original_path(&self, path: &Path, original: Option<&Path>) -> Result<()> {
        self.inner.lock().await.set_original_path(path, original)
    }

    pub async fn set_remote_id(&self, path: &Path, remote_id: &RemoteId) -> Result<()> {
        self.inner.lock().await.set_remote_id(path, remote_id)
    }

    pub async fn set_file_id(&self, path: &Path, file_id: Option<u64>) -> Result<()> {
        self.inner.lock().await.set_file_id(path, file_id)
    }

    pub async fn set_pin_state(&self, path: &Path, pin_state: PinState) -> Result<()> {
        self.inner.lock().await.set_pin_state(path, pin_state)
    }

    pub async fn set_hydrated(
        &self,
        path: &Path,
        hydrated: bool,
        fingerprint: Option<LocalFingerprint>,
    ) -> Result<()> {
        self.inner.lock().await.set_hydrated(path, hydrated, fingerprint)
    }

    pub async fn rebase_original_paths(&self, old_prefix: &Path, new_prefix: &Path) -> Result<usize> {
        self.inner
            .lock()
            .await
            .rebase_original_paths(old_prefix, new_prefix)
    }

    pub async fn get_side_data(&self, path: &Path) -> Result<SideData> {
        self.inner.lock().await.get_side_data(path)
    }

    pub async fn set_etag(
        &self,
        path: &Path,
        etag: Option<&str>,
        remote_modified: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.inner.lock().await.set_etag(path, etag, remote_modified)
    }

    pub async fn set_lock(&self, path: &Path, lock: Option<&LockRecord>) -> Result<()> {
        self.inner.lock().await.set_lock(path, lock)
    }

    pub async fn set_column(&self, path: &Path, key: &str, value: Option<&str>) -> Result<()> {
        self.inner.lock().await.set_column(path, key, value)
    }

    pub async fn move_item(&self, old: &Path, new: &Path) -> Result<()> {
        self.inner.lock().await.move_item(old, new)
    }

    pub async fn move_side_data(&self, old: &Path, new: &Path) -> Result<()> {
        self.inner.lock().await.move_side_data(old, new)
    }

    pub async fn delete_item(&self, path: &Path) -> Result<()> {
        self.inner.lock().await.delete_item(path)
    }

    pub async fn delete_side_data(&self, path: &Path) -> Result<()> {
        self.inner.lock().await.delete_side_data(path)
    }

    pub async fn purge_orphans(&self) -> Result<usize> {
        self.inner.lock().await.purge_orphans()
    }

    pub async fn item_count(&self) -> Result<usize> {
        self.inner.lock().await.item_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::LockMode;

    fn tracked(path: &str) -> ItemRow {
        let mut row = ItemRow::untracked(path, false);
        row.remote_id = Some(RemoteId::from(format!("id-{path}")));
        row.in_sync = true;
        row.original_path = Some(PathBuf::from(path));
        row
    }

    #[test]
    fn test_item_roundtrip() {
        let mut db = ItemDatabase::open_in_memory().unwrap();
        let mut row = tracked("docs/report.txt");
        row.file_id = Some(42);
        row.fingerprint = Some(LocalFingerprint {
            size: 12,
            modified: 1_700_000_000_000_000_000,
        });
        db.upsert_item(&row).unwrap();

        let loaded = db.get_item(Path::new("docs/report.txt")).unwrap().unwrap();
        assert_eq!(loaded, row);
        assert_eq!(db.find_by_file_id(42).unwrap().unwrap().path, row.path);
        assert_eq!(
            db.find_by_remote_id(&RemoteId::from("id-docs/report.txt"))
                .unwrap()
                .unwrap()
                .path,
            row.path
        );
    }

    #[test]
    fn test_missing_side_data_means_new() {
        let mut db = ItemDatabase::open_in_memory().unwrap();
        db.upsert_item(&tracked("a.txt")).unwrap();

        let state = db.get_state(Path::new("a.txt")).unwrap().unwrap();
        assert!(state.is_new());

        db.set_etag(Path::new("a.txt"), Some("v1"), Some(Utc::now()))
            .unwrap();
        let state = db.get_state(Path::new("a.txt")).unwrap().unwrap();
        assert!(!state.is_new());
        assert_eq!(state.etag.as_deref(), Some("v1"));
    }

    #[test]
    fn test_move_item_carries_descendants_and_side_data() {
        let mut db = ItemDatabase::open_in_memory().unwrap();
        let mut folder = tracked("a");
        folder.is_dir = true;
        db.upsert_item(&folder).unwrap();
        db.upsert_item(&tracked("a/doc.docx")).unwrap();
        db.upsert_item(&tracked("ab.txt")).unwrap();
        db.set_etag(Path::new("a/doc.docx"), Some("v3"), None).unwrap();
        db.set_column(Path::new("a/doc.docx"), "lock_owner", Some("alice"))
            .unwrap();

        db.move_item(Path::new("a"), Path::new("b")).unwrap();

        assert!(db.get_item(Path::new("a")).unwrap().is_none());
        assert!(db.get_item(Path::new("b")).unwrap().is_some());
        let moved = db.get_state(Path::new("b/doc.docx")).unwrap().unwrap();
        assert_eq!(moved.etag.as_deref(), Some("v3"));
        assert_eq!(moved.columns.get("lock_owner").map(String::as_str), Some("alice"));
        // Sibling sharing a name prefix is untouched
        assert!(db.get_item(Path::new("ab.txt")).unwrap().is_some());
    }

    #[test]
    fn test_children_of() {
        let mut db = ItemDatabase::open_in_memory().unwrap();
        for path in ["a", "a/x.txt", "a/y/z.txt", "b.txt"] {
            db.upsert_item(&tracked(path)).unwrap();
        }

        let root: Vec<_> = db
            .children_of(Path::new(""))
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(root, vec![PathBuf::from("a"), PathBuf::from("b.txt")]);

        let nested: Vec<_> = db
            .children_of(Path::new("a"))
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(nested, vec![PathBuf::from("a/x.txt")]);
    }

    #[test]
    fn test_delete_and_purge_orphans() {
        let mut db = ItemDatabase::open_in_memory().unwrap();
        db.upsert_item(&tracked("gone.txt")).unwrap();
        db.set_etag(Path::new("gone.txt"), Some("v1"), None).unwrap();
        db.set_etag(Path::new("orphan.txt"), Some("v9"), None).unwrap();

        db.delete_item(Path::new("gone.txt")).unwrap();
        assert!(db.get_state(Path::new("gone.txt")).unwrap().is_none());
        assert_eq!(db.get_side_data(Path::new("gone.txt")).unwrap(), SideData::default());

        assert_eq!(db.purge_orphans().unwrap(), 1);
    }

    #[test]
    fn test_lock_record_and_columns() {
        let mut db = ItemDatabase::open_in_memory().unwrap();
        db.upsert_item(&tracked("f.txt")).unwrap();
        let record = LockRecord {
            token: "tok".into(),
            owner: "bob".into(),
            exclusive: true,
            expires_at: None,
            mode: LockMode::Manual,
        };
        db.set_lock(Path::new("f.txt"), Some(&record)).unwrap();
        db.set_column(Path::new("f.txt"), "conflict", Some("ServerModified"))
            .unwrap();

        let state = db.get_state(Path::new("f.txt")).unwrap().unwrap();
        assert_eq!(state.lock, Some(record));
        assert_eq!(state.conflict(), Some("ServerModified"));

        db.set_lock(Path::new("f.txt"), None).unwrap();
        db.set_column(Path::new("f.txt"), "conflict", None).unwrap();
        let state = db.get_state(Path::new("f.txt")).unwrap().unwrap();
        assert!(state.lock.is_none());
        assert!(state.conflict().is_none());
    }

    #[test]
    fn test_rebase_original_paths() {
        let mut db = ItemDatabase::open_in_memory().unwrap();
        let mut child = tracked("b/doc.docx");
        child.original_path = Some(PathBuf::from("a/doc.docx"));
        db.upsert_item(&child).unwrap();

        assert_eq!(
            db.rebase_original_paths(Path::new("a"), Path::new("b")).unwrap(),
            1
        );
        let state = db.get_state(Path::new("b/doc.docx")).unwrap().unwrap();
        assert!(!state.is_moved());
    }

    #[test]
    fn test_unknown_path_is_not_tracked_error() {
        let mut db = ItemDatabase::open_in_memory().unwrap();
        let err = db.set_in_sync(Path::new("nope"), true, None).unwrap_err();
        assert!(matches!(err, IndexError::NotTracked(_)));
    }
}
