//! Per-node cooldown caches used by the scanner.

use crate::line::NodeId;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Default time a scanned node stays ineligible.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// Node id to expiry instant. Expired entries are evicted on lookup.
pub struct DedupeCache {
    cooldown: Duration,
    expiries: Mutex<HashMap<NodeId, Instant>>,
}

impl DedupeCache {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            expiries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `node` is still inside its cooldown.
    pub fn is_cooling(&self, node: NodeId) -> bool {
        cooling(&mut self.expiries.lock(), node, Instant::now())
    }

    /// Start (or restart) the cooldown for `node`.
    pub fn mark(&self, node: NodeId) {
        self.expiries.lock().insert(node, Instant::now() + self.cooldown);
    }

    /// Mark `node` unless it is cooling. Returns true if it was eligible.
    pub fn insert_if_absent(&self, node: NodeId) -> bool {
        let now = Instant::now();
        let mut expiries = self.expiries.lock();
        if cooling(&mut expiries, node, now) {
            return false;
        }
        expiries.insert(node, now + self.cooldown);
        true
    }

    /// Entries held, including expired ones not looked up since.
    pub(crate) fn len(&self) -> usize {
        self.expiries.lock().len()
    }
}

/// Lookup that evicts `node` once its cooldown has passed.
fn cooling(expiries: &mut HashMap<NodeId, Instant>, node: NodeId, now: Instant) -> bool {
    match expiries.get(&node) {
        Some(expiry) if now < *expiry => true,
        Some(_) => {
            expiries.remove(&node);
            false
        }
        None => false,
    }
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
