//! Good/bad hysteresis over the store's counters and tier sets.
//!
//! Two entry points share the same promotion and quarantine rules:
//! [`HealthClassifier::apply_sample`] judges a single worker sample and
//! [`HealthClassifier::apply_cycle`] judges a remediation cycle.

use crate::error::StoreError;
use crate::line::{NodeId, Tier};
use crate::store::Store;
use crate::utils::format_speed;

use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

/// Classification thresholds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Thresholds {
    pub good_speed_mbps: f64,
    pub bad_speed_mbps: f64,
    pub good_latency_ms: i64,
    pub bad_latency_ms: i64,
    pub promote_after: u32,
    pub quarantine_after: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            good_speed_mbps: 10.0,
            bad_speed_mbps: 3.0,
            good_latency_ms: 500,
            bad_latency_ms: 20_000,
            promote_after: 3,
            quarantine_after: 3,
        }
    }
}

impl Thresholds {
    /// Good-path trigger for a worker sample.
    pub fn is_good_sample(&self, latency_ms: i64, speed_mbps: f64) -> bool {
        latency_ms > self.good_latency_ms || speed_mbps > self.good_speed_mbps
    }

    /// Bad-path trigger for a worker sample.
    pub fn is_bad_sample(&self, latency_ms: i64, speed_mbps: f64) -> bool {
        latency_ms > self.bad_latency_ms || speed_mbps < self.bad_speed_mbps
    }

    /// Per-sample speed floor of a tier. Below it the remediation rotates.
    pub fn floor(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Good => self.good_speed_mbps,
            Tier::Quarantined => self.bad_speed_mbps,
        }
    }

    pub fn judge_cycle(&self, tier: Tier, cycle: &CycleSummary) -> CycleVerdict {
        let avg = cycle.avg_mbps();
        match tier {
            Tier::Good => CycleVerdict::GoodTier {
                confirmed: avg >= self.good_speed_mbps,
                evict: cycle.all_below(self.good_speed_mbps),
            },
            Tier::Quarantined if cycle.error_count <= 2 || avg < self.bad_speed_mbps => {
                CycleVerdict::Resolved {
                    audit: cycle.flagged_ips.iter().cloned().collect(),
                }
            }
            Tier::Quarantined => CycleVerdict::Degraded,
        }
    }
}

/// Samples and failures collected over one remediation cycle of a line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    /// Counted speeds in Mbps. Hard failures are not samples.
    pub samples: Vec<f64>,
    pub error_count: u32,
    /// Outbound ips that hit a proxy-exhausted failure this cycle.
    pub flagged_ips: BTreeSet<String>,
}

impl CycleSummary {
    /// Two-decimal average of the counted samples, zero when there are none.
    pub fn avg_mbps(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        format_speed(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// True when no counted sample reached `floor`, including when none were counted.
    pub fn all_below(&self, floor: f64) -> bool {
        self.samples.iter().all(|s| *s < floor)
    }
}

/// Outcome of a cycle evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleVerdict {
    GoodTier { confirmed: bool, evict: bool },
    /// Quarantine cleared. `audit` holds the ips flagged this cycle.
    Resolved { audit: Vec<String> },
    Degraded,
}

/// Tier changes made by one worker sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleOutcome {
    pub promoted: bool,
    pub quarantined: bool,
}

#[derive(Clone)]
pub struct HealthClassifier {
    store: Arc<dyn Store>,
    thresholds: Thresholds,
    time_box: Duration,
}

impl HealthClassifier {
    pub fn new(store: Arc<dyn Store>, thresholds: Thresholds, time_box: Duration) -> Self {
        Self {
            store,
            thresholds,
            time_box,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Judge one latency/speed sample. Each path runs on its own task and is
    /// waited on for at most the time box. An overrunning path is reported as
    /// no change but still runs to completion, so a tier move is never cut off
    /// between its insert and the matching removal from the other tier.
    pub async fn apply_sample(
        &self,
        node: NodeId,
        outbound_ip: &str,
        latency_ms: i64,
        speed_mbps: f64,
    ) -> SampleOutcome {
        let good = self.clone();
        let promoted = self
            .time_boxed(
                node,
                "good path",
                tokio::spawn(async move { good.good_path(node, latency_ms, speed_mbps).await }),
            )
            .await;

        let bad = self.clone();
        let ip = outbound_ip.to_string();
        let quarantined = self
            .time_boxed(
                node,
                "bad path",
                tokio::spawn(async move { bad.bad_path(node, &ip, latency_ms, speed_mbps).await }),
            )
            .await;
        SampleOutcome {
            promoted,
            quarantined,
        }
    }

    async fn time_boxed(
        &self,
        node: NodeId,
        path: &str,
        work: JoinHandle<Result<bool, StoreError>>,
    ) -> bool {
        match time::timeout(self.time_box, work).await {
            Ok(Ok(Ok(changed))) => changed,
            Ok(Ok(Err(e))) => {
                warn!("Classification {} for node {} failed: {}", path, node, e);
                false
            }
            Ok(Err(e)) => {
                warn!("Classification {} for node {} panicked: {}", path, node, e);
                false
            }
            Err(_) => {
                warn!(
                    "Classification {} for node {} exceeded {:?}, left to finish in the background",
                    path, node, self.time_box
                );
                false
            }
        }
    }

    async fn good_path(
        &self,
        node: NodeId,
        latency_ms: i64,
        speed_mbps: f64,
    ) -> Result<bool, StoreError> {
        if self.thresholds.is_good_sample(latency_ms, speed_mbps) {
            self.confirm_good(node).await
        } else {
            self.store.reset_good(node).await?;
            if self.store.remove_good(node).await? {
                info!("Node {} left the good tier ({} ms, {:.2} Mbps)", node, latency_ms, speed_mbps);
            }
            Ok(false)
        }
    }

    async fn bad_path(
        &self,
        node: NodeId,
        outbound_ip: &str,
        latency_ms: i64,
        speed_mbps: f64,
    ) -> Result<bool, StoreError> {
        if self.thresholds.is_bad_sample(latency_ms, speed_mbps) {
            self.confirm_bad(node, outbound_ip).await
        } else {
            self.store.reset_bad(node).await?;
            if self.store.remove_bad_ip(outbound_ip).await? {
                info!("Released {} (node {}) from quarantine", outbound_ip, node);
            }
            Ok(false)
        }
    }

    /// Bump `good_count`; promote once it reaches the threshold.
    async fn confirm_good(&self, node: NodeId) -> Result<bool, StoreError> {
        let count = self.store.bump_good(node).await?;
        debug!("Node {} good_count {}", node, count);
        if count < self.thresholds.promote_after {
            return Ok(false);
        }
        let inserted = self.store.insert_good(node).await?;
        if inserted {
            let removed = self.store.remove_bad_node(node).await?;
            self.store.reset_bad(node).await?;
            info!("Promoted node {} to the good tier (cleared {} quarantine rows)", node, removed);
        }
        Ok(inserted)
    }

    /// Bump `bad_count`; quarantine the ip once it reaches the threshold.
    async fn confirm_bad(&self, node: NodeId, outbound_ip: &str) -> Result<bool, StoreError> {
        let count = self.store.bump_bad(node).await?;
        debug!("Node {} bad_count {}", node, count);
        if count < self.thresholds.quarantine_after || self.store.is_bad_ip(outbound_ip).await? {
            return Ok(false);
        }
        let inserted = self.store.insert_bad(outbound_ip, node).await?;
        if inserted {
            self.store.remove_good(node).await?;
            self.store.reset_good(node).await?;
            warn!("Quarantined {} (node {}) after {} bad samples", outbound_ip, node, count);
        }
        Ok(inserted)
    }

    /// Judge a remediation cycle and apply the verdict to the store.
    pub async fn apply_cycle(
        &self,
        node: NodeId,
        outbound_ip: &str,
        tier: Tier,
        cycle: &CycleSummary,
    ) -> Result<CycleVerdict, StoreError> {
        let verdict = self.thresholds.judge_cycle(tier, cycle);
        match &verdict {
            CycleVerdict::GoodTier { confirmed, evict } => {
                if *confirmed {
                    self.confirm_good(node).await?;
                } else {
                    self.store.reset_good(node).await?;
                }
                if *evict && self.store.remove_good(node).await? {
                    warn!(
                        "Evicted node {} from the good tier, every sample under {} Mbps",
                        node, self.thresholds.good_speed_mbps
                    );
                }
            }
            CycleVerdict::Resolved { audit } => {
                let removed = self.store.remove_bad_node(node).await?;
                self.store.reset_bad(node).await?;
                info!(
                    "Node {} resolved (avg {:.2} Mbps, {} errors), {} quarantine rows cleared",
                    node,
                    cycle.avg_mbps(),
                    cycle.error_count,
                    removed
                );
                if !audit.is_empty() && !self.store.is_bad_node(node).await? {
                    for ip in audit {
                        self.store.record_bad_ip(ip, node).await?;
                        info!("Recorded {} in the bad ip history of node {}", ip, node);
                    }
                }
            }
            CycleVerdict::Degraded => {
                self.confirm_bad(node, outbound_ip).await?;
            }
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn classifier() -> (Arc<MemoryStore>, HealthClassifier) {
        let store = Arc::new(MemoryStore::default());
        let classifier =
            HealthClassifier::new(store.clone(), Thresholds::default(), Duration::from_secs(5));
        (store, classifier)
    }

    fn cycle(samples: &[f64], errors: u32, flagged: &[&str]) -> CycleSummary {
        CycleSummary {
            samples: samples.to_vec(),
            error_count: errors,
            flagged_ips: flagged.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn sample_triggers() {
        let t = Thresholds::default();
        assert!(t.is_good_sample(120, 10.5));
        assert!(t.is_good_sample(600, 1.0));
        assert!(!t.is_good_sample(120, 10.0));
        assert!(t.is_bad_sample(120, 2.9));
        assert!(t.is_bad_sample(20_001, 50.0));
        assert!(!t.is_bad_sample(-1, 3.0));
    }

    #[test]
    fn cycle_verdicts() {
        let t = Thresholds::default();
        assert_eq!(
            t.judge_cycle(Tier::Good, &cycle(&[12.0, 9.0], 0, &[])),
            CycleVerdict::GoodTier {
                confirmed: true,
                evict: false
            }
        );
        assert_eq!(
            t.judge_cycle(Tier::Good, &cycle(&[], 3, &[])),
            CycleVerdict::GoodTier {
                confirmed: false,
                evict: true
            }
        );
        assert_eq!(
            t.judge_cycle(Tier::Quarantined, &cycle(&[5.0], 2, &["1.1.1.1"])),
            CycleVerdict::Resolved {
                audit: vec!["1.1.1.1".to_string()]
            }
        );
        assert_eq!(
            t.judge_cycle(Tier::Quarantined, &cycle(&[2.0, 2.0], 3, &[])),
            CycleVerdict::Resolved { audit: vec![] }
        );
        assert_eq!(
            t.judge_cycle(Tier::Quarantined, &cycle(&[5.0], 3, &[])),
            CycleVerdict::Degraded
        );
    }

    #[tokio::test]
    async fn promotes_exactly_on_the_third_good_sample() {
        let (store, classifier) = classifier();
        store.insert_bad("9.9.9.9", 1).await.unwrap();
        for round in 1..=4 {
            let outcome = classifier.apply_sample(1, "1.2.3.4", 100, 50.0).await;
            assert_eq!(outcome.promoted, round == 3);
            assert_eq!(store.is_good(1).await.unwrap(), round >= 3);
        }
        assert!(store.is_good(1).await.unwrap());
        assert!(!store.is_bad_node(1).await.unwrap());
    }

    #[tokio::test]
    async fn weak_sample_resets_and_demotes() {
        let (store, classifier) = classifier();
        store.insert_good(2).await.unwrap();
        store.bump_good(2).await.unwrap();
        classifier.apply_sample(2, "1.2.3.4", 100, 5.0).await;
        assert!(!store.is_good(2).await.unwrap());
        assert_eq!(store.counters(2).await.unwrap().good_count, 0);
    }

    #[tokio::test]
    async fn quarantines_on_the_third_bad_sample() {
        let (store, classifier) = classifier();
        for round in 1..=4 {
            let outcome = classifier.apply_sample(3, "5.5.5.5", 100, 1.0).await;
            assert_eq!(outcome.quarantined, round == 3);
        }
        assert!(store.is_bad_ip("5.5.5.5").await.unwrap());
        assert_eq!(store.bad_entries().await.unwrap().len(), 1);
        assert_eq!(store.counters(3).await.unwrap().bad_count, 4);
    }

    #[tokio::test]
    async fn degraded_cycle_quarantine_clears_the_good_tier() {
        let (store, classifier) = classifier();
        store.insert_good(6).await.unwrap();
        store.bump_good(6).await.unwrap();
        store.bump_bad(6).await.unwrap();
        store.bump_bad(6).await.unwrap();
        let verdict = classifier
            .apply_cycle(6, "6.6.6.6", Tier::Quarantined, &cycle(&[5.0, 6.0], 3, &[]))
            .await
            .unwrap();
        assert_eq!(verdict, CycleVerdict::Degraded);
        assert!(store.is_bad_ip("6.6.6.6").await.unwrap());
        assert!(!store.is_good(6).await.unwrap());
        assert_eq!(store.counters(6).await.unwrap().good_count, 0);
    }

    #[tokio::test]
    async fn healthy_sample_releases_the_ip() {
        let (store, classifier) = classifier();
        store.insert_bad("5.5.5.5", 3).await.unwrap();
        store.bump_bad(3).await.unwrap();
        classifier.apply_sample(3, "5.5.5.5", 100, 8.0).await;
        assert!(!store.is_bad_ip("5.5.5.5").await.unwrap());
        assert_eq!(store.counters(3).await.unwrap().bad_count, 0);
    }

    #[tokio::test]
    async fn good_cycle_evicts_when_every_sample_is_slow() {
        let (store, classifier) = classifier();
        store.insert_good(4).await.unwrap();
        for _ in 0..5 {
            store.bump_good(4).await.unwrap();
        }
        let verdict = classifier
            .apply_cycle(4, "1.1.1.1", Tier::Good, &cycle(&[9.9, 4.0, 0.0], 1, &[]))
            .await
            .unwrap();
        assert_eq!(
            verdict,
            CycleVerdict::GoodTier {
                confirmed: false,
                evict: true
            }
        );
        assert!(!store.is_good(4).await.unwrap());
        assert_eq!(store.counters(4).await.unwrap().good_count, 0);
    }

    #[tokio::test]
    async fn resolved_cycle_audits_flagged_ips() {
        let (store, classifier) = classifier();
        store.insert_bad("7.7.7.7", 5).await.unwrap();
        store.bump_bad(5).await.unwrap();
        classifier
            .apply_cycle(5, "7.7.7.8", Tier::Quarantined, &cycle(&[20.0], 2, &["7.7.7.7"]))
            .await
            .unwrap();
        assert!(!store.is_bad_node(5).await.unwrap());
        assert_eq!(store.counters(5).await.unwrap().bad_count, 0);
        let history = store.bad_ip_history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outbound_ip, "7.7.7.7");
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_path_reports_no_change() {
        let (_store, classifier) = classifier();
        let work = tokio::spawn(async {
            time::sleep(Duration::from_secs(6)).await;
            Ok(true)
        });
        assert!(!classifier.time_boxed(1, "good path", work).await);
    }
}
