//! Offline doubles for the provider traits.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crm_rag::config::{Config, IndexConfig};
use crm_rag::embedding::EmbeddingProvider;
use crm_rag::llm::{ChatMessage, ChatModel};
use tempfile::TempDir;

pub const DIMS: usize = 64;

/// Bag-of-words embedder: each lowercase word bumps one hashed bucket.
/// Texts that share words are close; unrelated texts are near-orthogonal.
#[derive(Default)]
pub struct HashEmbedder {
    calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let digest = Sha256::digest(word.to_lowercase().as_bytes());
        v[digest[0] as usize % DIMS] += 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| embed(t)).collect())
    }
}

/// Replies with the context it was given, so tests can see exactly what
/// reached the model.
#[derive(Default)]
pub struct EchoChat {
    pub prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl EchoChat {
    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for EchoChat {
    fn model_name(&self) -> &str {
        "echo"
    }
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        let system = &messages[0].content;
        let context = system
            .split_once("Context: ")
            .map(|(_, c)| c)
            .unwrap_or_default();
        Ok(context.to_string())
    }
}

/// Config rooted in a fresh temp dir.
pub fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.index = IndexConfig {
        path: tmp.path().join("index"),
        collection: "test_docs".to_string(),
    };
    config.hubspot.cache_path = tmp.path().join("hubspot_cache.sqlite");
    config.identity.path = tmp.path().join("identity.sqlite");
    config.chunking.chunk_size = 200;
    config.chunking.chunk_overlap = 20;
    config.retrieval.top_k = 5;
    config
}
