//! Anomaly scanner and the remediation pipeline it drives.
//!
//! Each scan holds the exit error map's investigation lock from start to end.
//! Flagged nodes are remediated first; otherwise the scanner samples the
//! quarantine tier, falling back to the good tier once the quarantine tier
//! keeps coming up empty.

use crate::classifier::CycleSummary;
use crate::dedupe::DedupeCache;
use crate::error::{CycleError, FetchError};
use crate::line::{FailureClass, Line, NodeId, Tier, TradeId};
use crate::monitor::Shared;
use crate::retry::retry;
use crate::socks5;
use crate::store::DownloadUrl;
use crate::throughput::ThroughputProbe;

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Tier the next draw comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawSource {
    Quarantined,
    Good,
}

/// Counts consecutive empty quarantine draws within a scan.
#[derive(Debug, Clone)]
pub struct DrawState {
    consecutive_empty: u32,
    threshold: u32,
}

impl DrawState {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_empty: 0,
            threshold,
        }
    }

    /// Note an empty quarantine draw and return where to draw from next.
    pub fn record_empty(&mut self) -> DrawSource {
        self.consecutive_empty = self.consecutive_empty.saturating_add(1);
        self.source()
    }

    pub fn source(&self) -> DrawSource {
        if self.consecutive_empty >= self.threshold {
            DrawSource::Good
        } else {
            DrawSource::Quarantined
        }
    }
}

/// How a scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A node went through the remediation pipeline.
    Remediated(NodeId),
    /// Remediation of the node was aborted before any line was judged.
    Failed(NodeId),
    /// Nothing to do, or shutdown interrupted the scan.
    Idle,
    /// Both tiers were empty and the scanner idled.
    TiersEmpty,
    /// Every draw in the budget was skipped.
    Exhausted,
    StoreFailure,
}

pub struct AnomalyScanner {
    shared: Arc<Shared>,
    watch_trade: TradeId,
    probe: ThroughputProbe,
    download_url: DownloadUrl,
    scanned: DedupeCache,
    good_checked: DedupeCache,
}

impl AnomalyScanner {
    pub(crate) fn new(shared: Arc<Shared>, watch_trade: TradeId) -> Self {
        let cooldown = shared.config.dedupe_cooldown;
        // never records: in coupled mode the scan already holds the map lock
        let probe = shared.probe();
        let download_url = DownloadUrl::new(shared.config.download_url.clone());
        Self {
            shared,
            watch_trade,
            probe,
            download_url,
            scanned: DedupeCache::new(cooldown),
            good_checked: DedupeCache::new(cooldown),
        }
    }

    /// Nodes recently scanned.
    pub fn scanned(&self) -> &DedupeCache {
        &self.scanned
    }

    /// Good-tier nodes recently re-verified.
    pub fn good_checked(&self) -> &DedupeCache {
        &self.good_checked
    }

    /// Scan every poll interval until shutdown.
    pub async fn run(self) {
        info!("Scanner started with watch trade {}", self.watch_trade);
        while !self.shared.shutdown.is_cancelled() {
            let outcome = self.scan().await;
            debug!(
                "Scan finished: {:?}, {} nodes cooling down",
                outcome,
                self.scanned.len()
            );
            if !self.shared.pause(self.shared.config.scan_interval).await {
                break;
            }
        }

        let left = self.shared.exit_errors.investigate().await.drain().await;
        if !left.is_empty() {
            warn!(
                "Scanner stopped with {} flagged nodes uninvestigated: {:?}",
                left.len(),
                left.iter().map(|(node, _)| *node).collect::<Vec<_>>()
            );
        }
        info!("Scanner stopped");
    }

    pub async fn scan(&self) -> ScanOutcome {
        let mut investigation = self.shared.exit_errors.investigate().await;

        if !investigation.is_empty().await {
            while let Some((node, ips)) = investigation.pop_any().await {
                if node == 0 {
                    warn!("Discarding flagged entry without a node id");
                    continue;
                }
                warn!("Investigating node {} flagged for {:?}", node, ips);
                return self.remediate_logged(node).await;
            }
            return ScanOutcome::Idle;
        }

        let config = &self.shared.config;
        let store = &self.shared.store;
        let mut draws = DrawState::new(config.empty_draws_before_good);

        for _ in 0..config.max_scan_draws {
            let node = match store.random_bad().await {
                Ok(Some(node)) => node,
                Ok(None) => {
                    if draws.record_empty() == DrawSource::Quarantined {
                        debug!("Quarantine tier is empty");
                        continue;
                    }
                    match store.random_good().await {
                        Ok(Some(node)) => {
                            if !self.good_checked.insert_if_absent(node) {
                                debug!("Good node {} was verified recently", node);
                                continue;
                            }
                            node
                        }
                        Ok(None) => {
                            warn!(
                                "Both tiers are empty, idling {} minutes",
                                config.idle_backoff_minutes
                            );
                            self.idle().await;
                            return ScanOutcome::TiersEmpty;
                        }
                        Err(e) => {
                            error!("Failed to draw from the good tier: {}", e);
                            return ScanOutcome::StoreFailure;
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to draw from the quarantine tier: {}", e);
                    return ScanOutcome::StoreFailure;
                }
            };

            if node == 0 {
                self.scanned.mark(0);
                continue;
            }
            if !self.scanned.insert_if_absent(node) {
                warn!(
                    "Node {} was scanned recently, drawing again in {:?}",
                    node, config.draw_backoff
                );
                if !self.shared.pause(config.draw_backoff).await {
                    return ScanOutcome::Idle;
                }
                continue;
            }
            return self.remediate_logged(node).await;
        }

        warn!("No candidates available after {} draws", config.max_scan_draws);
        ScanOutcome::Exhausted
    }

    async fn idle(&self) {
        let minutes = self.shared.config.idle_backoff_minutes;
        for elapsed in 0..minutes {
            if !self.shared.pause(Duration::from_secs(60)).await {
                return;
            }
            debug!("Next scan in {} minutes", minutes - elapsed - 1);
        }
    }

    async fn remediate_logged(&self, node: NodeId) -> ScanOutcome {
        match self.remediate(node).await {
            Ok(lines) => {
                info!("Remediated node {} across {} lines", node, lines);
                ScanOutcome::Remediated(node)
            }
            Err(e) => {
                error!("Remediation of node {} aborted: {}", node, e);
                ScanOutcome::Failed(node)
            }
        }
    }

    /// Run the remediation pipeline for `node`. Returns the number of lines judged.
    pub async fn remediate(&self, node: NodeId) -> Result<usize, CycleError> {
        if node == 0 {
            self.scanned.mark(0);
            return Ok(0);
        }

        let config = &self.shared.config;
        let cp = &*self.shared.control_plane;
        let trade = self.watch_trade;

        let tier = if self.shared.store.is_good(node).await? {
            Tier::Good
        } else {
            Tier::Quarantined
        };
        info!("Remediating node {} ({:?}) with trade {}", node, tier, trade);

        retry(
            config.scanner_retry,
            &format!("binding trade {} to node {}", trade, node),
            || cp.bind_trade_to_node(trade, node),
        )
        .await
        .map_err(|cause| CycleError::Bind { node, cause })?;

        let lines = retry(config.scanner_retry, "listing lines", || cp.list_lines())
            .await
            .map_err(CycleError::ListLines)?;
        let owned: Vec<Line> = lines.into_iter().filter(|l| l.owned_by(trade)).collect();

        let download_url = self.download_url.get(&*self.shared.store).await;
        for line in &owned {
            let cycle = self.remediation_cycle(node, line, tier, &download_url).await;
            let verdict = self
                .shared
                .classifier
                .apply_cycle(node, &line.outbound_ip, tier, &cycle)
                .await?;
            info!(
                "Node {} via {}: avg {:.2} Mbps, {} errors, {:?}",
                node,
                line.outbound_ip,
                cycle.avg_mbps(),
                cycle.error_count,
                verdict
            );
        }
        Ok(owned.len())
    }

    async fn remediation_cycle(
        &self,
        node: NodeId,
        line: &Line,
        tier: Tier,
        download_url: &str,
    ) -> CycleSummary {
        let config = &self.shared.config;
        let floor = self.shared.classifier.thresholds().floor(tier);
        let rotation = self.shared.rotation(self.watch_trade);
        let mut cycle = CycleSummary::default();

        for round in 1..=config.remediation_rounds {
            match socks5::test_reachability(line, &config.target_addr, 1, config.dial_timeout)
                .await
            {
                Ok(reach) => debug!(
                    "Node {} round {}: dial ok in {} ms",
                    node, round, reach.avg_latency_ms
                ),
                Err(e) => warn!("Node {} round {}: {}", node, round, e),
            }

            match self.probe.measure(node, line, download_url).await {
                Ok(speed) => {
                    cycle.samples.push(speed);
                    if speed < floor {
                        info!(
                            "Node {} round {}: {:.2} Mbps under the {:?} floor, rotating",
                            node, round, speed, tier
                        );
                        rotation.rotate().await;
                    }
                }
                Err(FetchError::Cancelled) => break,
                Err(e) if e.failure_class() == FailureClass::ProxyExhausted => {
                    error!("Node {} round {}: {}, rotating", node, round, e);
                    cycle.error_count += 1;
                    cycle.flagged_ips.insert(line.outbound_ip.clone());
                    rotation.rotate().await;
                }
                Err(e) => {
                    error!("Node {} round {}: {}, rotating", node, round, e);
                    cycle.error_count += 1;
                    cycle.samples.push(0.0);
                    rotation.rotate().await;
                }
            }
        }
        cycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switches_to_good_tier_after_three_empty_draws() {
        let mut state = DrawState::new(3);
        assert_eq!(state.source(), DrawSource::Quarantined);
        assert_eq!(state.record_empty(), DrawSource::Quarantined);
        assert_eq!(state.record_empty(), DrawSource::Quarantined);
        assert_eq!(state.record_empty(), DrawSource::Good);
        assert_eq!(state.record_empty(), DrawSource::Good);
    }
}
