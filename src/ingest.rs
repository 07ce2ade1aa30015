//! Ingestion pipeline: documents → chunks → embeddings → vector index.
//!
//! Ingestion replaces the configured collection wholesale. The existing
//! collection is deleted before the first batch is written, so running the
//! same ingestion twice leaves the same number of chunks behind.
//!
//! ```text
//! documents ─► batches of N ─► split ─► embed ─► add ─► progress(processed, total)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::chunk::TextSplitter;
use crate::config::Config;
use crate::crm_cache::CrmCache;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::RagError;
use crate::hubspot::{self, HubSpotClient};
use crate::lifecycle::IndexManager;
use crate::loaders;
use crate::models::Document;
use crate::progress::{format_number, IngestProgress, ProgressSink};
use crate::store::{IndexHandle, VectorIndex};

pub struct IngestPipeline {
    manager: IndexManager,
    splitter: TextSplitter,
    embedder: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
}

/// Totals from one ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub documents: usize,
    pub chunks: usize,
    pub batches: usize,
}

impl IngestPipeline {
    pub fn new(
        manager: IndexManager,
        splitter: TextSplitter,
        embedder: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
    ) -> Self {
        Self {
            manager,
            splitter,
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            IndexManager::new(&config.index),
            TextSplitter::from_config(&config.chunking)?,
            create_provider(&config.embedding)?,
            config.ingest.batch_size,
        ))
    }

    /// Load, split, embed, and persist local files.
    pub async fn index_documents(
        &self,
        paths: &[PathBuf],
        progress: Option<&dyn ProgressSink>,
    ) -> Result<IndexHandle> {
        let docs = loaders::load_documents(paths)?;
        let (index, _) = self.ingest_documents_batched(&docs, None, progress).await?;
        Ok(index)
    }

    /// Replace the collection with `docs`, embedding `batch_size` documents
    /// at a time and reporting after each batch.
    pub async fn ingest_documents_batched(
        &self,
        docs: &[Document],
        batch_size: Option<usize>,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<(IndexHandle, IngestStats)> {
        if docs.is_empty() {
            return Err(RagError::EmptyInput.into());
        }

        let batch_size = batch_size.unwrap_or(self.batch_size).max(1);
        let total = docs.len();
        let total_batches = total.div_ceil(batch_size);

        let index = self.manager.recreate().await?;
        tracing::info!(
            collection = self.manager.collection(),
            documents = total,
            batches = total_batches,
            "starting ingestion"
        );

        let mut processed = 0usize;
        let mut chunks_written = 0usize;

        for (i, batch) in docs.chunks(batch_size).enumerate() {
            let batch_num = i + 1;
            let chunks = self.splitter.split_documents(batch);

            if !chunks.is_empty() {
                let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
                let vectors = self
                    .embedder
                    .embed_texts(&texts)
                    .await
                    .with_context(|| format!("embedding batch {}/{} failed", batch_num, total_batches))?;
                if vectors.len() != chunks.len() {
                    return Err(RagError::upstream(
                        self.embedder.model_name(),
                        format!(
                            "expected {} embeddings, got {}",
                            chunks.len(),
                            vectors.len()
                        ),
                    )
                    .into());
                }
                chunks_written += index.add(&chunks, &vectors).await?;
            }

            processed += batch.len();
            let message = format!(
                "Embedding batch {}/{} ({}/{} docs)",
                batch_num,
                total_batches,
                format_number(processed),
                format_number(total)
            );
            tracing::info!("{}", message);
            if let Some(sink) = progress {
                sink.report(&IngestProgress {
                    processed,
                    total,
                    message,
                });
            }
        }

        tracing::info!(chunks = chunks_written, "ingestion complete");
        let stats = IngestStats {
            documents: total,
            chunks: chunks_written,
            batches: total_batches,
        };
        Ok((Arc::new(index), stats))
    }
}

/// `crag ingest files`.
pub async fn run_ingest_files(
    config: &Config,
    paths: &[PathBuf],
    batch_size: Option<usize>,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let pipeline = IngestPipeline::from_config(config)?;
    let docs = loaders::load_documents(paths)?;
    let (_, stats) = pipeline
        .ingest_documents_batched(&docs, batch_size, Some(progress))
        .await?;
    print_summary(config, &stats);
    Ok(())
}

/// `crag ingest crm`: index the cached CRM records, syncing first when the
/// cache is empty, stale, or `refresh` is set.
pub async fn run_ingest_crm(
    config: &Config,
    refresh: bool,
    batch_size: Option<usize>,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let pipeline = IngestPipeline::from_config(config)?;
    let cache = CrmCache::open(&config.hubspot.cache_path).await?;

    if refresh || cache.is_stale(config.hubspot.cache_ttl_hours).await? {
        let client = HubSpotClient::from_config(&config.hubspot)?;
        hubspot::sync_to_cache(&client, &cache, progress).await?;
    } else {
        tracing::info!("using cached CRM records");
    }

    let docs = cache.load(None).await?;
    let (_, stats) = pipeline
        .ingest_documents_batched(&docs, batch_size, Some(progress))
        .await?;
    print_summary(config, &stats);
    Ok(())
}

fn print_summary(config: &Config, stats: &IngestStats) {
    println!("ingest {}", config.index.collection);
    println!("  documents: {}", format_number(stats.documents));
    println!("  chunks:    {}", format_number(stats.chunks));
    println!("  batches:   {}", format_number(stats.batches));
    println!("ok");
}
