//! Local SQLite cache of CRM documents.
//!
//! A sync writes every fetched record here, keyed by `(object_type,
//! hs_object_id)`, so re-indexing does not need to page through HubSpot
//! again. The cache is considered stale once its newest record is older
//! than the configured TTL.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

use crate::db;
use crate::models::{Document, Metadata, ObjectType};

pub struct CrmCache {
    pool: SqlitePool,
}

impl CrmCache {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path)
            .await
            .with_context(|| format!("Failed to open CRM cache at {}", path.display()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hubspot_cache (
                object_type TEXT NOT NULL,
                hs_object_id TEXT NOT NULL,
                page_content TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                synced_at TEXT NOT NULL,
                PRIMARY KEY (object_type, hs_object_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_hubspot_cache_object_type ON hubspot_cache(object_type)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Upsert documents; all rows of one call share the same `synced_at`.
    pub async fn save(&self, docs: &[Document]) -> Result<usize> {
        if docs.is_empty() {
            return Ok(0);
        }
        let synced_at = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for doc in docs {
            let object_type = doc
                .object_type()
                .map(|t| t.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let hs_id = doc.hs_object_id().unwrap_or_default();
            sqlx::query(
                r#"
                INSERT INTO hubspot_cache (object_type, hs_object_id, page_content, metadata_json, synced_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (object_type, hs_object_id) DO UPDATE SET
                    page_content = excluded.page_content,
                    metadata_json = excluded.metadata_json,
                    synced_at = excluded.synced_at
                "#,
            )
            .bind(object_type)
            .bind(hs_id)
            .bind(&doc.content)
            .bind(serde_json::to_string(&doc.metadata)?)
            .bind(&synced_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(docs.len())
    }

    /// Load cached documents, optionally restricted to some object types,
    /// ordered by object type then id.
    pub async fn load(&self, object_types: Option<&[ObjectType]>) -> Result<Vec<Document>> {
        let rows = match object_types {
            Some(types) if !types.is_empty() => {
                let placeholders = vec!["?"; types.len()].join(",");
                let sql = format!(
                    "SELECT page_content, metadata_json FROM hubspot_cache
                     WHERE object_type IN ({})
                     ORDER BY object_type, hs_object_id",
                    placeholders
                );
                let mut q = sqlx::query(&sql);
                for t in types {
                    q = q.bind(t.as_str());
                }
                q.fetch_all(&self.pool).await?
            }
            _ => {
                sqlx::query(
                    "SELECT page_content, metadata_json FROM hubspot_cache
                     ORDER BY object_type, hs_object_id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata: Metadata = serde_json::from_str(&row.get::<String, _>("metadata_json"))
                .context("Corrupt metadata in CRM cache")?;
            docs.push(Document {
                content: row.get("page_content"),
                metadata,
            });
        }
        Ok(docs)
    }

    pub async fn last_synced(&self) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<String> = sqlx::query_scalar("SELECT MAX(synced_at) FROM hubspot_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(latest
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|ts| ts.with_timezone(&Utc)))
    }

    /// `true` when the cache is empty or older than `ttl_hours`. A TTL of 0,
    /// or one too long to represent, disables expiry.
    pub async fn is_stale(&self, ttl_hours: u64) -> Result<bool> {
        let ttl = i64::try_from(ttl_hours).ok().and_then(Duration::try_hours);
        let Some(ttl) = ttl.filter(|_| ttl_hours > 0) else {
            return Ok(self.counts().await?.is_empty());
        };
        Ok(match self.last_synced().await? {
            None => true,
            Some(ts) => Utc::now() - ts > ttl,
        })
    }

    pub async fn counts(&self) -> Result<BTreeMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT object_type, COUNT(*) AS cnt FROM hubspot_cache GROUP BY object_type",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("object_type"), r.get::<i64, _>("cnt")))
            .collect())
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM hubspot_cache")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Display name of a cached contact, as rendered in its document.
    pub async fn contact_name(&self, contact_id: &str) -> Result<Option<String>> {
        let content: Option<String> = sqlx::query_scalar(
            "SELECT page_content FROM hubspot_cache WHERE object_type = 'contact' AND hs_object_id = ?",
        )
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(content.and_then(|c| {
            c.lines()
                .next()
                .and_then(|line| line.strip_prefix("Contact: "))
                .map(|name| name.trim().to_string())
        }))
    }
}
