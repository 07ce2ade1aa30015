//! Process-wide cache of the loaded vector index.
//!
//! Request handlers call [`IndexCache::get`] on every message. The first
//! caller loads the index; concurrent callers wait on the load lock and then
//! see the cached handle, so the index is opened once. An absent index is
//! not cached: the next request tries again, which lets a freshly ingested
//! index become visible without a restart.

use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;

use crate::error::is_corruption;
use crate::lifecycle::IndexLoader;
use crate::store::IndexHandle;

pub struct IndexCache {
    loader: Arc<dyn IndexLoader>,
    slot: RwLock<Option<IndexHandle>>,
    load_lock: Mutex<()>,
}

impl IndexCache {
    pub fn new(loader: Arc<dyn IndexLoader>) -> Self {
        Self {
            loader,
            slot: RwLock::new(None),
            load_lock: Mutex::new(()),
        }
    }

    /// Cached handle, loading it on first use.
    pub async fn get(&self) -> Option<IndexHandle> {
        if let Some(index) = self.cached() {
            return Some(index);
        }

        let _guard = self.load_lock.lock().await;
        if let Some(index) = self.cached() {
            return Some(index);
        }

        let loaded = self.loader.load_index().await;
        if let Some(index) = &loaded {
            *self.slot.write().unwrap_or_else(|e| e.into_inner()) = Some(index.clone());
        }
        loaded
    }

    pub fn cached(&self) -> Option<IndexHandle> {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn invalidate(&self) {
        let previous = self.slot.write().unwrap_or_else(|e| e.into_inner()).take();
        if previous.is_some() {
            tracing::info!("index cache invalidated");
        }
    }

    /// Drop the cached handle when `err` says the index is damaged, so the
    /// next request reloads (and discards) it. Returns whether it did.
    pub fn invalidate_if_corrupt(&self, err: &anyhow::Error) -> bool {
        if is_corruption(err) {
            tracing::warn!(error = %err, "index looks corrupt, invalidating cache");
            self.invalidate();
            true
        } else {
            false
        }
    }
}
