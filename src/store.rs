//! Vector index abstraction and backends.
//!
//! The [`VectorIndex`] trait is the storage seam of the pipeline: ingestion
//! writes chunks and their vectors through it, and retrieval runs filtered
//! similarity search against it. Two backends are provided:
//!
//! - [`SqliteVectorIndex`]: the persisted index. One SQLite file holds any
//!   number of named collections. Metadata is stored as JSON and filters are
//!   compiled into the `WHERE` clause, so top-K is always drawn from the
//!   permitted subset. Cosine similarity is computed in Rust over the
//!   filtered rows.
//! - [`MemoryIndex`]: a process-local index for tests and dry runs.
//!
//! # Schema
//!
//! ```sql
//! collections(name TEXT PRIMARY KEY, dims INTEGER, created_at INTEGER)
//! vectors(id TEXT PRIMARY KEY, collection TEXT, chunk_index INTEGER,
//!         text TEXT, hash TEXT, metadata_json TEXT, embedding BLOB)
//! ```
//!
//! `dims` is fixed by the first write to a collection. A stored embedding
//! whose byte length disagrees with it, or metadata that is not valid JSON,
//! marks the collection as corrupt.

use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::IndexError;
use crate::filter::{Filter, SqlParam};
use crate::models::{Chunk, Metadata, RetrievedChunk};

/// Shared handle to a loaded index.
pub type IndexHandle = Arc<dyn VectorIndex>;

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn collection(&self) -> &str;

    /// Number of stored chunks.
    async fn count(&self) -> Result<usize>;

    /// Cheap consistency probe run before an index is served. Returns the
    /// chunk count, or an [`IndexError::Corrupt`] error.
    async fn verify(&self) -> Result<usize> {
        self.count().await
    }

    /// Store chunks with their vectors. `vectors[i]` belongs to `chunks[i]`.
    async fn add(&self, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<usize>;

    /// Top-`k` chunks by cosine similarity, restricted to `filter`.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<RetrievedChunk>>;

    /// Remove every chunk of this collection.
    async fn delete_collection(&self) -> Result<()>;
}

fn check_lengths(chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<()> {
    if chunks.len() != vectors.len() {
        anyhow::bail!(
            "chunk/vector count mismatch: {} chunks, {} vectors",
            chunks.len(),
            vectors.len()
        );
    }
    Ok(())
}

fn rank(mut scored: Vec<RetrievedChunk>, k: usize) -> Vec<RetrievedChunk> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(k);
    scored
}

// ============ SQLite ============

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    collection: String,
}

impl SqliteVectorIndex {
    /// Open the index file, creating the file, schema, and collection as needed.
    pub async fn create(path: &Path, collection: &str) -> Result<Self, IndexError> {
        let pool = db::connect(path).await?;
        migrate(&pool).await?;
        sqlx::query(
            "INSERT OR IGNORE INTO collections (name, dims, created_at) VALUES (?, NULL, ?)",
        )
        .bind(collection)
        .bind(chrono::Utc::now().timestamp())
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            collection: collection.to_string(),
        })
    }

    /// Open an existing collection. `Ok(None)` when the file holds no such
    /// collection.
    pub async fn open_existing(path: &Path, collection: &str) -> Result<Option<Self>, IndexError> {
        let pool = db::connect_existing(path).await?;

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('collections', 'vectors')",
        )
        .fetch_one(&pool)
        .await?;
        if tables < 2 {
            pool.close().await;
            return Ok(None);
        }

        let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM collections WHERE name = ?")
            .bind(collection)
            .fetch_one(&pool)
            .await?;
        if exists == 0 {
            pool.close().await;
            return Ok(None);
        }

        Ok(Some(Self {
            pool,
            collection: collection.to_string(),
        }))
    }

    /// Remove the collection row and all of its vectors.
    pub async fn drop_collection(&self) -> Result<(), IndexError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM vectors WHERE collection = ?")
            .bind(&self.collection)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(&self.collection)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn dims(&self) -> Result<Option<usize>, IndexError> {
        let dims: Option<Option<i64>> =
            sqlx::query_scalar("SELECT dims FROM collections WHERE name = ?")
                .bind(&self.collection)
                .fetch_optional(&self.pool)
                .await?;
        Ok(dims.flatten().map(|d| d as usize))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn migrate(pool: &SqlitePool) -> Result<(), IndexError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            dims INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            id TEXT PRIMARY KEY,
            collection TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_collection ON vectors(collection)")
        .execute(pool)
        .await?;

    Ok(())
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await
            .map_err(IndexError::from)?;
        Ok(n as usize)
    }

    async fn verify(&self) -> Result<usize> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(v.id) AS total,
                   c.dims AS dims,
                   COALESCE(SUM(CASE WHEN v.id IS NOT NULL
                                          AND (c.dims IS NULL OR length(v.embedding) != c.dims * 4)
                                     THEN 1 ELSE 0 END), 0) AS bad_vectors,
                   COALESCE(SUM(CASE WHEN v.id IS NOT NULL AND NOT json_valid(v.metadata_json)
                                     THEN 1 ELSE 0 END), 0) AS bad_metadata
            FROM collections c
            LEFT JOIN vectors v ON v.collection = c.name
            WHERE c.name = ?
            GROUP BY c.name
            "#,
        )
        .bind(&self.collection)
        .fetch_optional(&self.pool)
        .await
        .map_err(IndexError::from)?;

        let Some(row) = row else {
            return Err(IndexError::Corrupt(format!(
                "collection '{}' disappeared",
                self.collection
            ))
            .into());
        };

        let total: i64 = row.try_get("total").map_err(IndexError::from)?;
        let bad_vectors: i64 = row.try_get("bad_vectors").map_err(IndexError::from)?;
        let bad_metadata: i64 = row.try_get("bad_metadata").map_err(IndexError::from)?;

        if bad_vectors > 0 {
            let dims: Option<i64> = row.try_get("dims").map_err(IndexError::from)?;
            return Err(IndexError::Corrupt(format!(
                "{} of {} embeddings do not match the collection dimension ({:?})",
                bad_vectors, total, dims
            ))
            .into());
        }
        if bad_metadata > 0 {
            return Err(IndexError::Corrupt(format!(
                "{} of {} chunks have unreadable metadata",
                bad_metadata, total
            ))
            .into());
        }

        Ok(total as usize)
    }

    async fn add(&self, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<usize> {
        check_lengths(chunks, vectors)?;
        if chunks.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(IndexError::from)?;

        let stored: Option<Option<i64>> =
            sqlx::query_scalar("SELECT dims FROM collections WHERE name = ?")
                .bind(&self.collection)
                .fetch_optional(&mut *tx)
                .await
                .map_err(IndexError::from)?;
        let dims = match stored.flatten() {
            Some(d) => d as usize,
            None => {
                let d = vectors[0].len();
                sqlx::query(
                    "INSERT INTO collections (name, dims, created_at) VALUES (?, ?, ?)
                     ON CONFLICT(name) DO UPDATE SET dims = excluded.dims",
                )
                .bind(&self.collection)
                .bind(d as i64)
                .bind(chrono::Utc::now().timestamp())
                .execute(&mut *tx)
                .await
                .map_err(IndexError::from)?;
                d
            }
        };

        for (chunk, vector) in chunks.iter().zip(vectors) {
            if vector.len() != dims {
                return Err(IndexError::DimensionMismatch {
                    expected: dims,
                    actual: vector.len(),
                }
                .into());
            }
            let metadata_json = serde_json::to_string(&chunk.metadata)?;
            sqlx::query(
                r#"
                INSERT INTO vectors (id, collection, chunk_index, text, hash, metadata_json, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&self.collection)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(metadata_json)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await
            .map_err(IndexError::from)?;
        }

        tx.commit().await.map_err(IndexError::from)?;
        tracing::debug!(collection = %self.collection, added = chunks.len(), "stored chunks");
        Ok(chunks.len())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<RetrievedChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        // A query of another width means the embedding model changed since
        // ingestion; the stored vectors themselves are fine.
        let dims = match self.dims().await? {
            Some(stored) if stored != query.len() => {
                return Err(IndexError::DimensionMismatch {
                    expected: stored,
                    actual: query.len(),
                }
                .into());
            }
            Some(stored) => stored,
            None => query.len(),
        };

        let mut sql = String::from(
            "SELECT id, text, metadata_json, embedding FROM vectors WHERE collection = ?",
        );
        let mut params = Vec::new();
        if let Some(filter) = filter {
            filter.validate()?;
            sql.push_str(" AND ");
            sql.push_str(&filter.to_sql("metadata_json", &mut params));
        }

        let mut q = sqlx::query(&sql).bind(&self.collection);
        for param in params {
            q = match param {
                SqlParam::Text(s) => q.bind(s),
                SqlParam::Int(i) => q.bind(i),
                SqlParam::Float(x) => q.bind(x),
            };
        }
        let rows = q.fetch_all(&self.pool).await.map_err(IndexError::from)?;
        tracing::trace!(candidates = rows.len(), "vector search candidates");

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk_id: String = row.try_get("id").map_err(IndexError::from)?;
            let blob: Vec<u8> = row.try_get("embedding").map_err(IndexError::from)?;
            if blob.len() != dims * 4 {
                return Err(IndexError::Corrupt(format!(
                    "embedding for chunk {} has {} bytes, expected {}",
                    chunk_id,
                    blob.len(),
                    dims * 4
                ))
                .into());
            }
            let raw_meta: String = row.try_get("metadata_json").map_err(IndexError::from)?;
            let metadata: Metadata = serde_json::from_str(&raw_meta).map_err(|e| {
                IndexError::Corrupt(format!("metadata for chunk {}: {}", chunk_id, e))
            })?;

            scored.push(RetrievedChunk {
                score: cosine_similarity(query, &blob_to_vec(&blob)),
                text: row.try_get("text").map_err(IndexError::from)?,
                chunk_id,
                metadata,
            });
        }

        Ok(rank(scored, k))
    }

    async fn delete_collection(&self) -> Result<()> {
        self.drop_collection().await?;
        Ok(())
    }
}

// ============ In-memory ============

struct StoredChunk {
    chunk: Chunk,
    vector: Vec<f32>,
}

/// A process-local index with the same filter semantics as SQLite.
pub struct MemoryIndex {
    collection: String,
    rows: RwLock<Vec<StoredChunk>>,
}

impl MemoryIndex {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            rows: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.rows.read().unwrap_or_else(|e| e.into_inner()).len())
    }

    async fn add(&self, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<usize> {
        check_lengths(chunks, vectors)?;
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let dims = rows
            .first()
            .map(|r| r.vector.len())
            .or_else(|| vectors.first().map(Vec::len))
            .unwrap_or(0);
        for (chunk, vector) in chunks.iter().zip(vectors) {
            if vector.len() != dims {
                return Err(IndexError::DimensionMismatch {
                    expected: dims,
                    actual: vector.len(),
                }
                .into());
            }
            rows.push(StoredChunk {
                chunk: chunk.clone(),
                vector: vector.clone(),
            });
        }
        Ok(chunks.len())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<RetrievedChunk>> {
        if let Some(filter) = filter {
            filter.validate()?;
        }
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        let scored = rows
            .iter()
            .filter(|r| filter.map_or(true, |f| f.matches(&r.chunk.metadata)))
            .map(|r| RetrievedChunk {
                chunk_id: r.chunk.id.clone(),
                text: r.chunk.text.clone(),
                metadata: r.chunk.metadata.clone(),
                score: cosine_similarity(query, &r.vector),
            })
            .collect();
        Ok(rank(scored, k))
    }

    async fn delete_collection(&self) -> Result<()> {
        self.rows.write().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}
