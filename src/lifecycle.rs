//! Loading, probing, and discarding the persisted vector index.
//!
//! [`IndexManager::load`] is the only way a serving path obtains an index.
//! It never fails: a missing index, a missing collection, or a damaged file
//! all come back as `None`. A damaged collection is deleted on the way out so
//! the next ingestion starts from a clean slate; if even the delete fails
//! (for example, the file is not a SQLite database at all) the files are
//! removed from disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::IndexConfig;
use crate::error::{is_corruption, IndexError};
use crate::store::{IndexHandle, SqliteVectorIndex, VectorIndex};

/// Source of index handles for [`IndexCache`](crate::cache::IndexCache).
#[async_trait]
pub trait IndexLoader: Send + Sync {
    async fn load_index(&self) -> Option<IndexHandle>;
}

/// What [`IndexManager::status`] found on disk. Never mutates the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexStatus {
    Absent,
    Healthy { chunks: usize, dims: Option<usize> },
    Corrupt { reason: String },
}

#[derive(Debug, Clone)]
pub struct IndexManager {
    db_file: PathBuf,
    collection: String,
}

impl IndexManager {
    pub fn new(config: &IndexConfig) -> Self {
        Self {
            db_file: config.db_file(),
            collection: config.collection.clone(),
        }
    }

    pub fn db_file(&self) -> &Path {
        &self.db_file
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Open the collection and probe it. `None` when there is nothing
    /// usable to serve.
    pub async fn load(&self) -> Option<IndexHandle> {
        if !self.db_file.exists() {
            tracing::info!(path = %self.db_file.display(), "no persisted index");
            return None;
        }

        let index = match SqliteVectorIndex::open_existing(&self.db_file, &self.collection).await {
            Ok(Some(index)) => index,
            Ok(None) => {
                tracing::info!(collection = %self.collection, "collection not found in index");
                return None;
            }
            Err(e) => {
                let err = anyhow::Error::from(e);
                if is_corruption(&err) {
                    tracing::warn!(error = %err, "index file is unreadable, discarding");
                    self.remove_files();
                } else {
                    tracing::warn!(error = %err, "failed to open index");
                }
                return None;
            }
        };

        match index.verify().await {
            Ok(chunks) => {
                tracing::info!(collection = %self.collection, chunks, "loaded vector index");
                Some(Arc::new(index))
            }
            Err(err) if is_corruption(&err) => {
                tracing::warn!(error = %err, collection = %self.collection, "index is corrupt, discarding");
                self.discard_open(&index).await;
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "index probe failed");
                index.close().await;
                None
            }
        }
    }

    /// Delete the collection, falling back to removing the files. Logs and
    /// swallows every failure.
    pub async fn discard(&self) {
        if !self.db_file.exists() {
            return;
        }
        match SqliteVectorIndex::open_existing(&self.db_file, &self.collection).await {
            Ok(Some(index)) => self.discard_open(&index).await,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "cannot open index for discard, removing files");
                self.remove_files();
            }
        }
    }

    async fn discard_open(&self, index: &SqliteVectorIndex) {
        let result = index.drop_collection().await;
        index.close().await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to delete collection, removing files");
            self.remove_files();
        }
    }

    /// Empty collection ready for a full rebuild. Existing data under the
    /// same collection name is deleted first.
    pub async fn recreate(&self) -> Result<SqliteVectorIndex> {
        if self.db_file.exists() {
            match SqliteVectorIndex::open_existing(&self.db_file, &self.collection).await {
                Ok(Some(index)) => {
                    let dropped = index.drop_collection().await;
                    index.close().await;
                    if let Err(e) = dropped {
                        let err = anyhow::Error::from(e);
                        if !is_corruption(&err) {
                            return Err(err.context("failed to delete existing collection"));
                        }
                        tracing::warn!(error = %err, "existing collection is corrupt, removing files");
                        self.remove_files();
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    let err = anyhow::Error::from(e);
                    if !is_corruption(&err) {
                        return Err(err.context("failed to open existing index"));
                    }
                    tracing::warn!(error = %err, "index file is unreadable, removing files");
                    self.remove_files();
                }
            }
        }

        let index = SqliteVectorIndex::create(&self.db_file, &self.collection).await?;
        Ok(index)
    }

    pub async fn status(&self) -> IndexStatus {
        if !self.db_file.exists() {
            return IndexStatus::Absent;
        }
        let index = match SqliteVectorIndex::open_existing(&self.db_file, &self.collection).await {
            Ok(Some(index)) => index,
            Ok(None) => return IndexStatus::Absent,
            Err(e) => {
                return IndexStatus::Corrupt {
                    reason: e.to_string(),
                }
            }
        };
        let status = match index.verify().await {
            Ok(chunks) => IndexStatus::Healthy {
                chunks,
                dims: index.dims().await.ok().flatten(),
            },
            Err(e) => IndexStatus::Corrupt {
                reason: format!("{:#}", e),
            },
        };
        index.close().await;
        status
    }

    fn remove_files(&self) {
        let mut paths = vec![self.db_file.clone()];
        for suffix in ["-wal", "-shm"] {
            let mut name = self.db_file.as_os_str().to_owned();
            name.push(suffix);
            paths.push(PathBuf::from(name));
        }
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::info!(path = %path.display(), "removed index file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    let err = IndexError::Io(e);
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove index file");
                }
            }
        }
    }
}

#[async_trait]
impl IndexLoader for IndexManager {
    async fn load_index(&self) -> Option<IndexHandle> {
        self.load().await
    }
}
