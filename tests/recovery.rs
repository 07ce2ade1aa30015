//! Corruption detection and rebuild through the lifecycle manager.

mod common;

use std::sync::Arc;

use common::{test_config, HashEmbedder};
use crm_rag::cache::IndexCache;
use crm_rag::chunk::TextSplitter;
use crm_rag::db;
use crm_rag::ingest::IngestPipeline;
use crm_rag::lifecycle::{IndexManager, IndexStatus};
use crm_rag::models::{keys, Document};
use crm_rag::store::VectorIndex;
use tempfile::TempDir;

fn docs() -> Vec<Document> {
    vec![
        Document::new("Contact: Jane Doe\nEmail: jane@x.com")
            .with_meta(keys::OBJECT_TYPE, "contact")
            .with_meta(keys::HS_OBJECT_ID, "1"),
        Document::new("Deal: Big Deal\nAmount: $500")
            .with_meta(keys::OBJECT_TYPE, "deal")
            .with_meta(keys::HS_OBJECT_ID, "2")
            .with_meta(keys::ASSOCIATED_CONTACT_ID, "1"),
    ]
}

async fn ingest(tmp: &TempDir) {
    let config = test_config(tmp);
    let pipeline = IngestPipeline::new(
        IndexManager::new(&config.index),
        TextSplitter::from_config(&config.chunking).unwrap(),
        Arc::new(HashEmbedder::default()),
        10,
    );
    let (index, _) = pipeline
        .ingest_documents_batched(&docs(), None, None)
        .await
        .unwrap();
    assert_eq!(index.count().await.unwrap(), 2);
}

/// Truncate every stored embedding behind the index's back.
async fn damage_vectors(manager: &IndexManager) {
    let pool = db::connect(manager.db_file()).await.unwrap();
    sqlx::query("UPDATE vectors SET embedding = X'0000'")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;
}

#[tokio::test]
async fn corrupt_collection_is_discarded_and_rebuildable() {
    let tmp = TempDir::new().unwrap();
    let manager = IndexManager::new(&test_config(&tmp).index);
    ingest(&tmp).await;
    assert!(manager.load().await.is_some());

    damage_vectors(&manager).await;
    assert!(matches!(manager.status().await, IndexStatus::Corrupt { .. }));

    assert!(manager.load().await.is_none());
    assert_eq!(manager.status().await, IndexStatus::Absent);

    ingest(&tmp).await;
    let index = manager.load().await.expect("rebuilt index loads");
    assert_eq!(index.count().await.unwrap(), 2);
}

#[tokio::test]
async fn unreadable_file_is_removed_and_rebuildable() {
    let tmp = TempDir::new().unwrap();
    let manager = IndexManager::new(&test_config(&tmp).index);
    std::fs::create_dir_all(manager.db_file().parent().unwrap()).unwrap();
    std::fs::write(manager.db_file(), b"definitely not sqlite".repeat(200)).unwrap();

    assert!(manager.load().await.is_none());
    assert!(!manager.db_file().exists());

    ingest(&tmp).await;
    assert!(manager.load().await.is_some());
}

#[tokio::test]
async fn cache_recovers_after_invalidation() {
    let tmp = TempDir::new().unwrap();
    let manager = IndexManager::new(&test_config(&tmp).index);
    let cache = IndexCache::new(Arc::new(manager.clone()));

    assert!(cache.get().await.is_none());

    ingest(&tmp).await;
    let index = cache.get().await.expect("index becomes visible after ingest");
    assert_eq!(index.count().await.unwrap(), 2);

    damage_vectors(&manager).await;
    drop(index);
    let query = common::embed("Big Deal");
    let err = cache
        .cached()
        .unwrap()
        .search(&query, 5, None)
        .await
        .err()
        .expect("search over damaged vectors fails");
    assert!(cache.invalidate_if_corrupt(&err));

    // Reload probes, finds the damage, and discards the collection.
    assert!(cache.get().await.is_none());
    ingest(&tmp).await;
    assert!(cache.get().await.is_some());
}
