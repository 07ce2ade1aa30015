//! Health overview of the index, the CRM cache, and the identity store.
//!
//! `crag status` only reads. Unlike serving, a corrupt index is reported
//! here and left in place; the next `load` or ingestion deals with it.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::crm_cache::CrmCache;
use crate::identity::SqliteIdentityStore;
use crate::lifecycle::{IndexManager, IndexStatus};

pub async fn run_status(config: &Config) -> Result<()> {
    let manager = IndexManager::new(&config.index);
    let index_status = manager.status().await;

    println!("crag status");
    println!("===========");
    println!();
    println!("  Index:       {}", manager.db_file().display());
    println!("  Collection:  {}", manager.collection());
    match &index_status {
        IndexStatus::Absent => println!("  Health:      absent (run `crag ingest` to build it)"),
        IndexStatus::Healthy { chunks, dims } => {
            println!("  Health:      healthy");
            println!("  Chunks:      {}", chunks);
            if let Some(d) = dims {
                println!("  Dimensions:  {}", d);
            }
        }
        IndexStatus::Corrupt { reason } => {
            println!("  Health:      CORRUPT, re-index required");
            println!("  Reason:      {}", reason);
        }
    }

    println!();
    println!("  CRM cache:   {}", config.hubspot.cache_path.display());
    if config.hubspot.cache_path.exists() {
        let cache = CrmCache::open(&config.hubspot.cache_path).await?;
        let counts = cache.counts().await?;
        let last = cache.last_synced().await?;
        println!(
            "  Last sync:   {}",
            last.map(format_relative).unwrap_or_else(|| "never".to_string())
        );
        if counts.is_empty() {
            println!("  Records:     0");
        } else {
            for (object_type, count) in &counts {
                println!("    {:<10} {:>8}", object_type, count);
            }
        }
    } else {
        println!("  Last sync:   never");
    }

    println!();
    println!("  Identities:  {}", config.identity.path.display());
    if config.identity.path.exists() {
        let store = SqliteIdentityStore::open(&config.identity.path).await?;
        let (links, messages) = store.counts().await?;
        let unlinked = store.unlinked().await?.len();
        println!("  Linked:      {}", links);
        println!("  Unlinked:    {}", unlinked);
        println!("  Messages:    {}", messages);
    } else {
        println!("  Linked:      0");
    }
    println!();
    Ok(())
}

/// Relative time such as "3 hours ago"; absolute date after 30 days.
fn format_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();
    if delta < 0 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}
