//! Persistence of the node catalog, samples, counters and tier sets.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::line::{BadEntry, HealthCounters, Node, NodeId, Province, SampleRecord};

use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;

/// Everything the monitor persists. Writes are idempotent upserts or deletes.
#[async_trait]
pub trait Store: Send + Sync {
    // catalog
    async fn save_provinces(&self, provinces: &[Province]) -> Result<(), StoreError>;
    async fn save_nodes(&self, nodes: &[Node]) -> Result<(), StoreError>;
    async fn has_catalog(&self) -> Result<bool, StoreError>;
    /// Candidate node ids for worker sampling.
    async fn node_ids(&self) -> Result<Vec<NodeId>, StoreError>;

    async fn record_sample(&self, sample: &SampleRecord) -> Result<(), StoreError>;

    async fn download_url(&self) -> Result<Option<String>, StoreError>;
    async fn set_download_url(&self, url: &str) -> Result<(), StoreError>;

    // hysteresis counters
    async fn counters(&self, node: NodeId) -> Result<HealthCounters, StoreError>;
    /// Increment and return the new good count.
    async fn bump_good(&self, node: NodeId) -> Result<u32, StoreError>;
    async fn reset_good(&self, node: NodeId) -> Result<(), StoreError>;
    /// Increment and return the new bad count.
    async fn bump_bad(&self, node: NodeId) -> Result<u32, StoreError>;
    async fn reset_bad(&self, node: NodeId) -> Result<(), StoreError>;

    // good tier
    async fn is_good(&self, node: NodeId) -> Result<bool, StoreError>;
    /// Returns false if the node was already present.
    async fn insert_good(&self, node: NodeId) -> Result<bool, StoreError>;
    /// Returns false if the node was absent.
    async fn remove_good(&self, node: NodeId) -> Result<bool, StoreError>;
    async fn random_good(&self) -> Result<Option<NodeId>, StoreError>;
    async fn good_nodes(&self) -> Result<Vec<NodeId>, StoreError>;

    // bad tier, keyed by outbound ip
    async fn is_bad_ip(&self, ip: &str) -> Result<bool, StoreError>;
    async fn is_bad_node(&self, node: NodeId) -> Result<bool, StoreError>;
    /// Returns false if the ip was already present.
    async fn insert_bad(&self, ip: &str, node: NodeId) -> Result<bool, StoreError>;
    async fn remove_bad_ip(&self, ip: &str) -> Result<bool, StoreError>;
    /// Remove every row for `node`, returning how many went.
    async fn remove_bad_node(&self, node: NodeId) -> Result<usize, StoreError>;
    async fn random_bad(&self) -> Result<Option<NodeId>, StoreError>;
    async fn bad_entries(&self) -> Result<Vec<BadEntry>, StoreError>;

    // forensic audit
    async fn record_bad_ip(&self, ip: &str, node: NodeId) -> Result<(), StoreError>;
    async fn bad_ip_history(&self) -> Result<Vec<BadEntry>, StoreError>;
}

/// Download URL looked up in the store once per owner, with a configured fallback.
pub struct DownloadUrl {
    fallback: String,
    cached: Mutex<Option<String>>,
}

impl DownloadUrl {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            fallback: fallback.into(),
            cached: Mutex::new(None),
        }
    }

    /// The stored URL if set, else the fallback. A failed read is not cached.
    pub async fn get(&self, store: &dyn Store) -> String {
        let cached = self.cached.lock().clone();
        if let Some(url) = cached {
            return url;
        }
        match store.download_url().await {
            Ok(stored) => {
                let url = stored
                    .filter(|url| !url.trim().is_empty())
                    .unwrap_or_else(|| self.fallback.clone());
                *self.cached.lock() = Some(url.clone());
                url
            }
            Err(e) => {
                warn!("Failed to read download url, using {}: {}", self.fallback, e);
                self.fallback.clone()
            }
        }
    }
}
