//! Shared record of outbound ips that failed with a proxy-exhausted exit code.

use crate::line::NodeId;

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

type Entries = HashMap<NodeId, HashSet<String>>;

/// How the scanner's investigation lock relates to the map lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// The investigation lock is the map lock. Recording blocks while a scan runs.
    #[default]
    Coupled,
    /// The scanner serializes on its own mutex; recording never waits for a scan.
    Decoupled,
}

struct Inner {
    entries: Mutex<Entries>,
    investigation: Mutex<()>,
    mode: LockMode,
}

/// Node id to the outbound ips flagged since the node was last drained.
#[derive(Clone)]
pub struct ExitErrorMap {
    inner: Arc<Inner>,
}

impl ExitErrorMap {
    pub fn new(mode: LockMode) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                investigation: Mutex::new(()),
                mode,
            }),
        }
    }

    pub fn mode(&self) -> LockMode {
        self.inner.mode
    }

    /// Flag `ip` under `node`. Returns false if it was already flagged.
    pub async fn record(&self, node: NodeId, ip: &str) -> bool {
        let mut entries = self.inner.entries.lock().await;
        entries.entry(node).or_default().insert(ip.to_string())
    }

    /// Number of flagged nodes, or `None` while an investigation holds the map.
    pub fn pending_nodes(&self) -> Option<usize> {
        self.inner.entries.try_lock().ok().map(|entries| entries.len())
    }

    /// Take the investigation lock. Held by the scanner for a whole scan.
    pub async fn investigate(&self) -> Investigation<'_> {
        let guard = match self.inner.mode {
            LockMode::Coupled => Guard::Coupled(self.inner.entries.lock().await),
            LockMode::Decoupled => Guard::Decoupled(self.inner.investigation.lock().await),
        };
        Investigation {
            inner: &self.inner,
            guard,
        }
    }
}

impl Default for ExitErrorMap {
    fn default() -> Self {
        Self::new(LockMode::default())
    }
}

enum Guard<'a> {
    Coupled(MutexGuard<'a, Entries>),
    Decoupled(MutexGuard<'a, ()>),
}

/// Exclusive access for one scan.
pub struct Investigation<'a> {
    inner: &'a Inner,
    guard: Guard<'a>,
}

impl Investigation<'_> {
    async fn with_entries<R>(&mut self, f: impl FnOnce(&mut Entries) -> R) -> R {
        match &mut self.guard {
            Guard::Coupled(entries) => f(&mut **entries),
            Guard::Decoupled(_) => {
                let mut entries = self.inner.entries.lock().await;
                f(&mut *entries)
            }
        }
    }

    pub async fn is_empty(&mut self) -> bool {
        self.with_entries(|entries| entries.is_empty()).await
    }

    /// Remove an arbitrary node with its flagged ips.
    pub async fn pop_any(&mut self) -> Option<(NodeId, HashSet<String>)> {
        self.with_entries(|entries| {
            let node = *entries.keys().next()?;
            entries.remove_entry(&node)
        })
        .await
    }

    pub async fn drain(&mut self) -> Vec<(NodeId, HashSet<String>)> {
        self.with_entries(|entries| entries.drain().collect()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn records_deduplicate_per_node() {
        let map = ExitErrorMap::default();
        assert!(map.record(7, "1.1.1.1").await);
        assert!(!map.record(7, "1.1.1.1").await);
        assert!(map.record(7, "2.2.2.2").await);
        assert_eq!(map.pending_nodes(), Some(1));

        let mut inv = map.investigate().await;
        let (node, ips) = inv.pop_any().await.unwrap();
        assert_eq!(node, 7);
        assert_eq!(ips.len(), 2);
        assert!(inv.is_empty().await);
        assert!(inv.pop_any().await.is_none());
    }

    #[tokio::test]
    async fn drain_empties_the_map() {
        let map = ExitErrorMap::new(LockMode::Decoupled);
        map.record(1, "a").await;
        map.record(2, "b").await;
        let mut inv = map.investigate().await;
        let mut drained = inv.drain().await;
        drained.sort_by_key(|(node, _)| *node);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, 1);
        assert!(inv.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn coupled_mode_blocks_recording_during_a_scan() {
        let map = ExitErrorMap::new(LockMode::Coupled);
        let inv = map.investigate().await;
        assert_eq!(map.pending_nodes(), None);
        assert!(timeout(Duration::from_secs(1), map.record(3, "x")).await.is_err());
        drop(inv);
        assert!(map.record(3, "x").await);
    }

    #[tokio::test(start_paused = true)]
    async fn decoupled_mode_records_during_a_scan() {
        let map = ExitErrorMap::new(LockMode::Decoupled);
        let mut inv = map.investigate().await;
        assert!(timeout(Duration::from_secs(1), map.record(3, "x")).await.unwrap());
        assert!(!inv.is_empty().await);
    }

    #[test]
    fn lock_mode_parses_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: LockMode,
        }
        let w: Wrapper = toml::from_str("mode = \"decoupled\"").unwrap();
        assert_eq!(w.mode, LockMode::Decoupled);
    }
}
