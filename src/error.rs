//! Typed errors for the ingestion, retrieval, and index layers.
//!
//! Most functions in this crate return [`anyhow::Result`]. The error kinds
//! below are raised inside those results so callers that need to branch on
//! a specific failure can `downcast_ref` instead of matching on message text.
//!
//! The one classification every serving path depends on is
//! [`is_corruption`]: it decides whether a failure means the persisted
//! vector index must be discarded and rebuilt.

use std::path::PathBuf;

use thiserror::Error;

/// Caller-facing failures of the pipeline.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("No documents to ingest")]
    EmptyInput,

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Unsupported file type '{extension}' for {}. Allowed: .pdf, .md, .txt", path.display())]
    UnsupportedFileType { path: PathBuf, extension: String },

    #[error("{0} is not set. Export it in the environment.")]
    MissingCredential(&'static str),

    #[error("{provider} error: {message}")]
    Upstream { provider: String, message: String },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
}

impl RagError {
    pub fn upstream(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// Failures of the persisted vector index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The on-disk index cannot be trusted and must be rebuilt.
    #[error("Vector index is corrupt: {0}")]
    Corrupt(String),

    #[error("Embedding dimension mismatch: collection stores {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Vector index storage error: {0}")]
    Storage(#[source] sqlx::Error),

    #[error("Vector index I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for IndexError {
    fn from(err: sqlx::Error) -> Self {
        if is_sqlite_corruption(&err) {
            IndexError::Corrupt(err.to_string())
        } else {
            IndexError::Storage(err)
        }
    }
}

const SQLITE_CORRUPT: i32 = 11;
const SQLITE_NOTADB: i32 = 26;

/// Message fragments that identify a damaged index when no typed error
/// survived the trip (e.g. a driver that only reports text).
const CORRUPTION_MARKERS: &[&str] = &[
    "hnsw",
    "compactor",
    "malformed",
    "not a database",
    "is corrupt",
];

fn is_sqlite_corruption(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            // Extended result codes keep the primary code in the low byte.
            .map(|code| matches!(code & 0xff, SQLITE_CORRUPT | SQLITE_NOTADB))
            .unwrap_or(false),
        _ => false,
    }
}

/// Returns `true` when `err` signals that the persisted index is damaged.
///
/// Checks the typed [`IndexError::Corrupt`] kind and raw SQLite result codes
/// anywhere in the error chain first, then falls back to known message markers.
pub fn is_corruption(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(IndexError::Corrupt(_)) = cause.downcast_ref::<IndexError>() {
            return true;
        }
        if let Some(sql) = cause.downcast_ref::<sqlx::Error>() {
            if is_sqlite_corruption(sql) {
                return true;
            }
        }
    }

    let text = format!("{:#}", err).to_lowercase();
    CORRUPTION_MARKERS.iter().any(|marker| text.contains(marker))
}
