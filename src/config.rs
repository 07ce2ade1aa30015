//! TOML configuration.
//!
//! Every section is optional and falls back to the defaults below, so an
//! empty file is a valid configuration. Secrets never live in the file:
//! they are read from the environment with [`env_secret`].
//!
//! ```toml
//! [index]
//! path = "./data/index"
//! collection = "notebook_docs"
//!
//! [chunking]
//! chunk_size = 1000
//! chunk_overlap = 200
//!
//! [retrieval]
//! top_k = 15
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::RagError;

pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const HUBSPOT_ACCESS_TOKEN: &str = "HUBSPOT_ACCESS_TOKEN";
pub const FB_PAGE_ACCESS_TOKEN: &str = "FB_PAGE_ACCESS_TOKEN";
pub const FB_APP_SECRET: &str = "FB_APP_SECRET";
pub const FB_VERIFY_TOKEN: &str = "FB_VERIFY_TOKEN";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub hubspot: HubSpotConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub messenger: MessengerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Directory holding the index database.
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: default_index_path(),
            collection: default_collection(),
        }
    }
}

impl IndexConfig {
    pub fn db_file(&self) -> PathBuf {
        self.path.join("index.sqlite")
    }
}

fn default_index_path() -> PathBuf {
    PathBuf::from("./data/index")
}
fn default_collection() -> String {
    "notebook_docs".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Maximum chunk length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Documents per embedding batch.
    #[serde(default = "default_ingest_batch_size")]
    pub batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_ingest_batch_size(),
        }
    }
}

fn default_ingest_batch_size() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Prior messages included when answering on the messaging channel.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Upper bound on the characters of retrieved context sent to the model.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default)]
    pub skip_query_correction: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            history_limit: default_history_limit(),
            max_context_chars: default_max_context_chars(),
            skip_query_correction: false,
        }
    }
}

fn default_top_k() -> usize {
    15
}
fn default_history_limit() -> usize {
    50
}
fn default_max_context_chars() -> usize {
    24_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: Option<String>,
    #[serde(default = "default_embedding_dims")]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible endpoint or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    /// Texts per API request.
    #[serde(default = "default_request_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_embedding_dims(),
            url: None,
            batch_size: default_request_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> Option<String> {
    Some("text-embedding-3-small".to_string())
}
fn default_embedding_dims() -> Option<usize> {
    Some(1536)
}
fn default_request_batch_size() -> usize {
    256
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            temperature: 0.0,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct HubSpotConfig {
    /// API host override. When unset the host is derived from the token region.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_hubspot_cache_path")]
    pub cache_path: PathBuf,
    /// Hours before the local CRM cache is considered stale. `0` disables expiry.
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: u64,
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
    #[serde(default = "default_hubspot_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for HubSpotConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            cache_path: default_hubspot_cache_path(),
            cache_ttl_hours: default_cache_ttl_hours(),
            page_limit: default_page_limit(),
            timeout_secs: default_hubspot_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_hubspot_cache_path() -> PathBuf {
    PathBuf::from("./data/hubspot_cache.sqlite")
}
fn default_cache_ttl_hours() -> u64 {
    24
}
fn default_page_limit() -> usize {
    100
}
fn default_hubspot_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_path")]
    pub path: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            path: default_identity_path(),
        }
    }
}

fn default_identity_path() -> PathBuf {
    PathBuf::from("./data/identity.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct MessengerConfig {
    #[serde(default = "default_graph_api_base")]
    pub graph_api_base: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            graph_api_base: default_graph_api_base(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_graph_api_base() -> String {
    "https://graph.facebook.com/v21.0".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

/// Read a required secret from the environment.
pub fn env_secret(name: &'static str) -> Result<String, RagError> {
    env_optional(name).ok_or(RagError::MissingCredential(name))
}

/// Read an optional secret; empty values count as unset.
pub fn env_optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Load and validate the configuration. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.index.collection.trim().is_empty() {
        bail!("index.collection must not be empty");
    }

    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!(
            "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
            config.chunking.chunk_overlap,
            config.chunking.chunk_size
        );
    }

    if config.ingest.batch_size == 0 {
        bail!("ingest.batch_size must be > 0");
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.max_context_chars == 0 {
        bail!("retrieval.max_context_chars must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    match config.llm.provider.as_str() {
        "openai" | "ollama" => {}
        other => bail!(
            "Unknown llm provider: '{}'. Must be openai or ollama.",
            other
        ),
    }
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        bail!("llm.temperature must be in [0.0, 2.0]");
    }

    if config.hubspot.page_limit == 0 || config.hubspot.page_limit > 100 {
        bail!("hubspot.page_limit must be in [1, 100]");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("crag.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&write(&tmp, "")).unwrap();
        assert_eq!(config.index.collection, "notebook_docs");
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.retrieval.top_k, 15);
        assert_eq!(config.ingest.batch_size, 500);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.llm.temperature, 0.0);
        assert_eq!(
            config.embedding.model.as_deref(),
            Some("text-embedding-3-small")
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert!(config.index.db_file().ends_with("index.sqlite"));
    }

    #[test]
    fn test_overrides() {
        let tmp = TempDir::new().unwrap();
        let path = write(
            &tmp,
            r#"
[index]
path = "/var/lib/crag"
collection = "crm"

[chunking]
chunk_size = 400
chunk_overlap = 50

[embedding]
provider = "ollama"
model = "nomic-embed-text"
dims = 768
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.index.collection, "crm");
        assert_eq!(config.chunking.chunk_size, 400);
        assert_eq!(config.embedding.provider, "ollama");
        assert_eq!(config.embedding.dims, Some(768));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "[chunking]\nchunk_size = 100\nchunk_overlap = 100\n");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn test_zero_context_budget_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "[retrieval]\nmax_context_chars = 0\n");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("max_context_chars"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "[embedding]\nprovider = \"magic\"\n");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_env_secret_missing() {
        let err = env_secret("CRAG_TEST_SECRET_THAT_IS_NEVER_SET").unwrap_err();
        assert!(matches!(err, RagError::MissingCredential(_)));
    }
}
