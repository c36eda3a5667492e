use std::io;

/// Errors from the persistence layer (status file, settings files, sink).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("device id {0} has no recognized type prefix")]
    UnknownDevice(String),
}
