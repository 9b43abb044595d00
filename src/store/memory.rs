use super::Store;
use crate::error::StoreError;
use crate::line::{BadEntry, HealthCounters, Node, NodeId, Province, SampleRecord};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// In-process store. Each record has its own lock.
#[derive(Default)]
pub struct MemoryStore {
    provinces: Mutex<BTreeMap<i64, Province>>,
    nodes: Mutex<BTreeMap<NodeId, Node>>,
    samples: Mutex<Vec<SampleRecord>>,
    download_url: Mutex<Option<String>>,
    counters: Mutex<HashMap<NodeId, HealthCounters>>,
    good: Mutex<BTreeSet<NodeId>>,
    bad: Mutex<BTreeMap<String, NodeId>>,
    history: Mutex<BTreeSet<BadEntry>>,
}

impl MemoryStore {
    /// Store whose catalog holds exactly `ids`.
    pub fn with_nodes(ids: impl IntoIterator<Item = NodeId>) -> Self {
        let store = Self::default();
        {
            let mut nodes = store.nodes.lock();
            for id in ids {
                nodes.insert(
                    id,
                    Node {
                        id,
                        name: format!("node-{}", id),
                        line_type: String::new(),
                        max: 0,
                        area_id: 0,
                    },
                );
            }
        }
        store
    }

    /// Samples in insertion order.
    pub fn samples(&self) -> Vec<SampleRecord> {
        self.samples.lock().clone()
    }

    pub fn provinces(&self) -> Vec<Province> {
        self.provinces.lock().values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_provinces(&self, provinces: &[Province]) -> Result<(), StoreError> {
        let mut saved = self.provinces.lock();
        for p in provinces {
            saved.insert(p.id, p.clone());
        }
        Ok(())
    }

    async fn save_nodes(&self, nodes: &[Node]) -> Result<(), StoreError> {
        let mut saved = self.nodes.lock();
        for n in nodes {
            saved.insert(n.id, n.clone());
        }
        Ok(())
    }

    async fn has_catalog(&self) -> Result<bool, StoreError> {
        Ok(!self.nodes.lock().is_empty())
    }

    async fn node_ids(&self) -> Result<Vec<NodeId>, StoreError> {
        Ok(self.nodes.lock().keys().copied().collect())
    }

    async fn record_sample(&self, sample: &SampleRecord) -> Result<(), StoreError> {
        self.samples.lock().push(sample.clone());
        Ok(())
    }

    async fn download_url(&self) -> Result<Option<String>, StoreError> {
        Ok(self.download_url.lock().clone())
    }

    async fn set_download_url(&self, url: &str) -> Result<(), StoreError> {
        *self.download_url.lock() = Some(url.to_string());
        Ok(())
    }

    async fn counters(&self, node: NodeId) -> Result<HealthCounters, StoreError> {
        Ok(self.counters.lock().get(&node).copied().unwrap_or_default())
    }

    async fn bump_good(&self, node: NodeId) -> Result<u32, StoreError> {
        let mut counters = self.counters.lock();
        let entry = counters.entry(node).or_default();
        entry.good_count = entry.good_count.saturating_add(1);
        Ok(entry.good_count)
    }

    async fn reset_good(&self, node: NodeId) -> Result<(), StoreError> {
        self.counters.lock().entry(node).or_default().good_count = 0;
        Ok(())
    }

    async fn bump_bad(&self, node: NodeId) -> Result<u32, StoreError> {
        let mut counters = self.counters.lock();
        let entry = counters.entry(node).or_default();
        entry.bad_count = entry.bad_count.saturating_add(1);
        Ok(entry.bad_count)
    }

    async fn reset_bad(&self, node: NodeId) -> Result<(), StoreError> {
        self.counters.lock().entry(node).or_default().bad_count = 0;
        Ok(())
    }

    async fn is_good(&self, node: NodeId) -> Result<bool, StoreError> {
        Ok(self.good.lock().contains(&node))
    }

    async fn insert_good(&self, node: NodeId) -> Result<bool, StoreError> {
        Ok(self.good.lock().insert(node))
    }

    async fn remove_good(&self, node: NodeId) -> Result<bool, StoreError> {
        Ok(self.good.lock().remove(&node))
    }

    async fn random_good(&self) -> Result<Option<NodeId>, StoreError> {
        let good = self.good.lock();
        Ok(good.iter().copied().choose(&mut rand::rng()))
    }

    async fn good_nodes(&self) -> Result<Vec<NodeId>, StoreError> {
        Ok(self.good.lock().iter().copied().collect())
    }

    async fn is_bad_ip(&self, ip: &str) -> Result<bool, StoreError> {
        Ok(self.bad.lock().contains_key(ip))
    }

    async fn is_bad_node(&self, node: NodeId) -> Result<bool, StoreError> {
        Ok(self.bad.lock().values().any(|n| *n == node))
    }

    async fn insert_bad(&self, ip: &str, node: NodeId) -> Result<bool, StoreError> {
        let mut bad = self.bad.lock();
        if bad.contains_key(ip) {
            return Ok(false);
        }
        bad.insert(ip.to_string(), node);
        Ok(true)
    }

    async fn remove_bad_ip(&self, ip: &str) -> Result<bool, StoreError> {
        Ok(self.bad.lock().remove(ip).is_some())
    }

    async fn remove_bad_node(&self, node: NodeId) -> Result<usize, StoreError> {
        let mut bad = self.bad.lock();
        let before = bad.len();
        bad.retain(|_, n| *n != node);
        Ok(before - bad.len())
    }

    async fn random_bad(&self) -> Result<Option<NodeId>, StoreError> {
        let bad = self.bad.lock();
        Ok(bad.values().copied().choose(&mut rand::rng()))
    }

    async fn bad_entries(&self) -> Result<Vec<BadEntry>, StoreError> {
        Ok(self
            .bad
            .lock()
            .iter()
            .map(|(ip, node)| BadEntry {
                outbound_ip: ip.clone(),
                node_id: *node,
            })
            .collect())
    }

    async fn record_bad_ip(&self, ip: &str, node: NodeId) -> Result<(), StoreError> {
        self.history.lock().insert(BadEntry {
            outbound_ip: ip.to_string(),
            node_id: node,
        });
        Ok(())
    }

    async fn bad_ip_history(&self) -> Result<Vec<BadEntry>, StoreError> {
        Ok(self.history.lock().iter().cloned().collect())
    }
}
