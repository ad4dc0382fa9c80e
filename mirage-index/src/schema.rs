/// Database schema version
pub const SCHEMA_VERSION: u32 = 1;

/// SQL schema for the item state database
///
/// `items` holds what an OS placeholder would carry in-band: identity,
/// sync flag, original path, pin state. `side_data` is keyed by path and
/// lives apart from `items` so editors that delete and recreate a file do
/// not lose the version token, lock record or display columns.
pub const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS items (
    path TEXT PRIMARY KEY,
    file_id INTEGER,
    is_dir BOOLEAN NOT NULL DEFAULT 0,
    remote_id TEXT,
    in_sync BOOLEAN NOT NULL DEFAULT 0,
    original_path TEXT,
    pin_state INTEGER NOT NULL DEFAULT 0,
    hydrated BOOLEAN NOT NULL DEFAULT 1,
    local_size INTEGER,
    local_modified INTEGER,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_items_file_id ON items(file_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_items_remote_id ON items(remote_id) WHERE remote_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS side_data (
    path TEXT PRIMARY KEY,
    etag TEXT,
    remote_modified TEXT,
    lock_record TEXT,
    columns TEXT NOT NULL DEFAULT '{}',
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
"#;
