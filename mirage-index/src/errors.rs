use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Item not tracked: {0}")]
    NotTracked(PathBuf),

    #[error("Item not found: {0}")]
    NotFound(PathBuf),

    #[error("Item busy: {0}")]
    ItemBusy(PathBuf),

    #[error("Path escapes sync root: {0}")]
    OutsideRoot(PathBuf),

    #[error("Schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },

    #[error("Watcher error: {0}")]
    WatcherError(String),
}

impl IndexError {
    /// Whether the error means the item disappeared underneath us
    pub fn is_not_found(&self) -> bool {
        match self {
            IndexError::NotFound(_) => true,
            IndexError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
