//! Result cache: content hash → previously validated analysis results.
//!
//! Unbounded by design. Staleness is handled by forced rescan, which skips
//! [`ResultCache::get`] and overwrites the entry on success; there is no TTL
//! and no eviction, only the administrative [`ResultCache::clear`].

use crate::error::StoreError;
use crate::model::AnalysisResult;
use crate::store::{CacheEntry, Store};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn Store>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Look up results for `hash`.
    ///
    /// A cache that cannot be read degrades to a miss: the page is simply
    /// analysed again.
    pub async fn get(&self, hash: &str) -> Option<Vec<AnalysisResult>> {
        match self.store.get_cached(hash).await {
            Ok(Some(entry)) => {
                debug!("Cache hit for {} (cached {})", hash, entry.cached_at);
                Some(entry.results)
            }
            Ok(None) => {
                debug!("Cache miss for {}", hash);
                None
            }
            Err(e) => {
                warn!("Cache read failed for {}: {}", hash, e);
                None
            }
        }
    }

    /// Store fully validated results for `hash`, replacing any previous entry.
    pub async fn put(&self, hash: &str, results: &[AnalysisResult]) -> Result<(), StoreError> {
        let entry = CacheEntry {
            results: results.to_vec(),
            cached_at: Utc::now(),
        };
        self.store.put_cached(hash, &entry).await
    }

    /// Remove every entry; returns how many were removed.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        self.store.clear_cache().await
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        self.store.count_cache().await
    }
}
