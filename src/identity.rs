//! Identity links and conversation history for the messaging channel.
//!
//! A messaging identity (a Messenger page-scoped id) is linked to at most one
//! CRM contact by an operator; linking again replaces the previous link.
//! Messages are append-only and ordered by their autoincrement id, which is
//! also how the webhook asks for "history before this message".

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::crm_cache::CrmCache;
use crate::db;
use crate::models::{ConversationMessage, Direction, IdentityLink};

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_link(&self, identity: &str) -> Result<Option<IdentityLink>>;

    /// Link `identity` to `contact_id`, replacing any earlier link.
    async fn link(&self, identity: &str, contact_id: &str, display_name: Option<&str>) -> Result<()>;

    /// Append a message and return its id.
    async fn save_message(&self, identity: &str, direction: Direction, text: &str) -> Result<i64>;

    /// Latest `limit` messages, newest first.
    async fn recent_messages(&self, identity: &str, limit: usize) -> Result<Vec<ConversationMessage>>;

    /// Up to `limit` messages older than `before_id`, oldest first.
    async fn history_before(
        &self,
        identity: &str,
        before_id: i64,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>>;
}

/// An identity that has written in but is not linked yet.
#[derive(Debug, Clone)]
pub struct UnlinkedIdentity {
    pub identity: String,
    pub message_count: i64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub preview: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LinkSummary {
    pub link: IdentityLink,
    pub message_count: i64,
}

pub struct SqliteIdentityStore {
    pool: SqlitePool,
}

impl SqliteIdentityStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path)
            .await
            .with_context(|| format!("Failed to open identity store at {}", path.display()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS identity_links (
                identity TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL,
                display_name TEXT,
                linked_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identity TEXT NOT NULL,
                direction TEXT NOT NULL CHECK (direction IN ('in', 'out')),
                text TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_identity ON messages(identity, id)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Identities with inbound messages and no link, most recent first.
    pub async fn unlinked(&self) -> Result<Vec<UnlinkedIdentity>> {
        let rows = sqlx::query(
            r#"
            SELECT m.identity,
                   COUNT(*) AS message_count,
                   MAX(m.timestamp) AS last_message_at,
                   (SELECT m2.text FROM messages m2
                    WHERE m2.identity = m.identity AND m2.direction = 'in'
                    ORDER BY m2.id DESC LIMIT 1) AS preview
            FROM messages m
            LEFT JOIN identity_links l ON l.identity = m.identity
            WHERE l.identity IS NULL AND m.direction = 'in'
            GROUP BY m.identity
            ORDER BY MAX(m.id) DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| UnlinkedIdentity {
                identity: row.get("identity"),
                message_count: row.get("message_count"),
                last_message_at: row
                    .get::<Option<String>, _>("last_message_at")
                    .and_then(|s| parse_ts(&s).ok()),
                preview: row.get("preview"),
            })
            .collect())
    }

    /// Every link with its total message count, newest link first.
    pub async fn links(&self) -> Result<Vec<LinkSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT l.identity, l.contact_id, l.display_name, l.linked_at,
                   (SELECT COUNT(*) FROM messages m WHERE m.identity = l.identity) AS message_count
            FROM identity_links l
            ORDER BY l.linked_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(LinkSummary {
                    link: link_from_row(row)?,
                    message_count: row.get("message_count"),
                })
            })
            .collect()
    }

    pub async fn counts(&self) -> Result<(i64, i64)> {
        let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM identity_links")
            .fetch_one(&self.pool)
            .await?;
        let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok((links, messages))
    }
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn get_link(&self, identity: &str) -> Result<Option<IdentityLink>> {
        let row = sqlx::query(
            "SELECT identity, contact_id, display_name, linked_at FROM identity_links WHERE identity = ?",
        )
        .bind(identity)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(link_from_row).transpose()
    }

    async fn link(&self, identity: &str, contact_id: &str, display_name: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO identity_links (identity, contact_id, display_name, linked_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (identity) DO UPDATE SET
                contact_id = excluded.contact_id,
                display_name = excluded.display_name,
                linked_at = excluded.linked_at
            "#,
        )
        .bind(identity)
        .bind(contact_id)
        .bind(display_name)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        tracing::info!(identity, contact_id, "identity linked");
        Ok(())
    }

    async fn save_message(&self, identity: &str, direction: Direction, text: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO messages (identity, direction, text, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(identity)
        .bind(direction.as_str())
        .bind(text)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn recent_messages(&self, identity: &str, limit: usize) -> Result<Vec<ConversationMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, identity, direction, text, timestamp FROM messages
            WHERE identity = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(identity)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn history_before(
        &self,
        identity: &str,
        before_id: i64,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, identity, direction, text, timestamp FROM messages
            WHERE identity = ? AND id < ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(identity)
        .bind(before_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}

fn link_from_row(row: &SqliteRow) -> Result<IdentityLink> {
    Ok(IdentityLink {
        identity: row.get("identity"),
        contact_id: row.get("contact_id"),
        display_name: row.get("display_name"),
        linked_at: parse_ts(&row.get::<String, _>("linked_at"))?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ConversationMessage> {
    Ok(ConversationMessage {
        id: row.get("id"),
        identity: row.get("identity"),
        direction: row.get::<String, _>("direction").parse()?,
        text: row.get("text"),
        timestamp: parse_ts(&row.get::<String, _>("timestamp"))?,
    })
}

/// `crag link`. Without a name, the contact's name is looked up in the CRM cache.
pub async fn run_link(
    config: &Config,
    identity: &str,
    contact_id: &str,
    name: Option<&str>,
) -> Result<()> {
    let store = SqliteIdentityStore::open(&config.identity.path).await?;

    let display_name = match name {
        Some(n) => Some(n.to_string()),
        None if config.hubspot.cache_path.exists() => {
            CrmCache::open(&config.hubspot.cache_path)
                .await?
                .contact_name(contact_id)
                .await?
        }
        None => None,
    };

    store
        .link(identity, contact_id, display_name.as_deref())
        .await?;
    println!(
        "linked {} -> contact {}{}",
        identity,
        contact_id,
        display_name
            .map(|n| format!(" ({})", n))
            .unwrap_or_default()
    );
    Ok(())
}

/// `crag conversations`.
pub async fn run_conversations(config: &Config, unlinked_only: bool) -> Result<()> {
    let store = SqliteIdentityStore::open(&config.identity.path).await?;

    let unlinked = store.unlinked().await?;
    println!("Unlinked identities: {}", unlinked.len());
    if !unlinked.is_empty() {
        println!("  {:<24} {:>6}  {:<20} {}", "IDENTITY", "MSGS", "LAST", "PREVIEW");
        println!("  {}", "-".repeat(76));
        for u in &unlinked {
            println!(
                "  {:<24} {:>6}  {:<20} {}",
                u.identity,
                u.message_count,
                u.last_message_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string()),
                preview(u.preview.as_deref().unwrap_or_default(), 40)
            );
        }
    }

    if unlinked_only {
        return Ok(());
    }

    let links = store.links().await?;
    println!();
    println!("Linked identities: {}", links.len());
    if !links.is_empty() {
        println!(
            "  {:<24} {:<14} {:<24} {:>6}",
            "IDENTITY", "CONTACT", "NAME", "MSGS"
        );
        println!("  {}", "-".repeat(76));
        for s in &links {
            println!(
                "  {:<24} {:<14} {:<24} {:>6}",
                s.link.identity,
                s.link.contact_id,
                s.link.display_name.as_deref().unwrap_or("-"),
                s.message_count
            );
        }
    }
    Ok(())
}

/// `crag messages`: newest first.
pub async fn run_messages(config: &Config, identity: &str, limit: usize) -> Result<()> {
    let store = SqliteIdentityStore::open(&config.identity.path).await?;
    let messages = store.recent_messages(identity, limit).await?;
    if messages.is_empty() {
        println!("No messages for {}", identity);
        return Ok(());
    }
    for m in &messages {
        let arrow = match m.direction {
            Direction::In => "<-",
            Direction::Out => "->",
        };
        println!(
            "{}  {}  {}",
            m.timestamp.format("%Y-%m-%d %H:%M:%S"),
            arrow,
            m.text
        );
    }
    Ok(())
}

fn preview(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > max {
        let cut: String = line.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}
