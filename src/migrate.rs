use anyhow::{Context, Result};

use crate::config::Config;
use crate::crm_cache::CrmCache;
use crate::identity::SqliteIdentityStore;

/// Create the data directories and the CRM cache and identity schemas.
///
/// The vector index is not created here: an index only exists once an
/// ingestion has filled it, so the webhook can tell "not built yet" apart
/// from "built but empty".
pub async fn run_migrations(config: &Config) -> Result<()> {
    std::fs::create_dir_all(&config.index.path).with_context(|| {
        format!(
            "Failed to create index directory {}",
            config.index.path.display()
        )
    })?;

    CrmCache::open(&config.hubspot.cache_path).await?;
    SqliteIdentityStore::open(&config.identity.path).await?;
    Ok(())
}
