//! Query-time retrieval over a loaded index.
//!
//! A [`Retriever`] embeds the query and asks the index for the top-K chunks,
//! optionally restricted by a metadata [`Filter`]. Contact-scoped retrievers
//! use [`Filter::identity_scope`], so they can only ever see the contact's
//! own record and records associated with it.

use std::sync::Arc;

use anyhow::Result;

use crate::embedding::EmbeddingProvider;
use crate::filter::Filter;
use crate::models::RetrievedChunk;
use crate::store::IndexHandle;

#[derive(Clone)]
pub struct Retriever {
    index: IndexHandle,
    embedder: Arc<dyn EmbeddingProvider>,
    k: usize,
    filter: Option<Filter>,
}

impl Retriever {
    pub fn new(index: IndexHandle, embedder: Arc<dyn EmbeddingProvider>, k: usize) -> Self {
        Self {
            index,
            embedder,
            k,
            filter: None,
        }
    }

    /// Retriever that only sees `contact_id`'s record and its associated
    /// records.
    pub fn scoped_to_contact(
        index: IndexHandle,
        embedder: Arc<dyn EmbeddingProvider>,
        contact_id: &str,
        k: usize,
    ) -> Self {
        Self::new(index, embedder, k).with_filter(Filter::identity_scope(contact_id))
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Top-K chunks for `query`, most similar first. A blank query returns
    /// nothing without calling the embedder.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedChunk>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed_query(query).await?;
        let hits = self
            .index
            .search(&vector, self.k, self.filter.as_ref())
            .await?;
        tracing::debug!(
            hits = hits.len(),
            k = self.k,
            scoped = self.filter.is_some(),
            "retrieved chunks"
        );
        Ok(hits)
    }
}
