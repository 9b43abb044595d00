//! Per-trade probe loop.

use crate::error::CycleError;
use crate::line::{FailureClass, Line, NodeId, ProbeResult, SampleRecord, TradeId};
use crate::monitor::Shared;
use crate::retry::retry;
use crate::socks5::{self, Reachability};
use crate::store::DownloadUrl;
use crate::throughput::ThroughputProbe;

use log::{debug, info, warn};
use rand::seq::IndexedRandom;
use std::sync::Arc;

/// Binds its trade to random catalog nodes and probes the resulting lines.
pub struct Worker {
    shared: Arc<Shared>,
    trade: TradeId,
    probe: ThroughputProbe,
    download_url: DownloadUrl,
}

impl Worker {
    pub(crate) fn new(shared: Arc<Shared>, trade: TradeId) -> Self {
        let probe = shared.probe().recording_into(shared.exit_errors.clone());
        let download_url = DownloadUrl::new(shared.config.download_url.clone());
        Self {
            shared,
            trade,
            probe,
            download_url,
        }
    }

    pub fn trade(&self) -> TradeId {
        self.trade
    }

    /// Loop until shutdown, pausing the cycle interval between cycles.
    pub async fn run(self) {
        info!("Worker for trade {} started", self.trade);
        while !self.shared.shutdown.is_cancelled() {
            match self.run_cycle().await {
                Ok(probed) => debug!("Trade {} probed {} lines", self.trade, probed),
                Err(e) => warn!("Cycle for trade {} aborted: {}", self.trade, e),
            }
            if !self.shared.pause(self.shared.config.cycle_interval).await {
                break;
            }
        }
        info!("Worker for trade {} stopped", self.trade);
    }

    /// One cycle under a concurrency permit. Returns the number of lines probed.
    pub async fn run_cycle(&self) -> Result<usize, CycleError> {
        let _permit = self
            .shared
            .permits
            .acquire()
            .await
            .map_err(|_| CycleError::Closed)?;

        let config = &self.shared.config;
        let cp = &*self.shared.control_plane;
        let trade = self.trade;

        let nodes = self.shared.store.node_ids().await?;
        let node = *nodes
            .choose(&mut rand::rng())
            .ok_or(CycleError::NoCandidates)?;
        debug!("Trade {} sampling node {}", trade, node);

        retry(
            config.worker_retry,
            &format!("binding trade {} to node {}", trade, node),
            || cp.bind_trade_to_node(trade, node),
        )
        .await
        .map_err(|cause| CycleError::Bind { node, cause })?;

        let lines = retry(config.worker_retry, "listing lines", || cp.list_lines())
            .await
            .map_err(CycleError::ListLines)?;
        let owned: Vec<Line> = lines.into_iter().filter(|l| l.owned_by(trade)).collect();
        if owned.is_empty() {
            warn!("No line is bound to trade {} after binding node {}", trade, node);
        }

        let download_url = self.download_url.get(&*self.shared.store).await;
        for line in &owned {
            let result = self.probe_line(node, line, &download_url).await;
            info!(
                "Trade {} node {} via {}: {:.0}% ok, {} ms, {:.2} Mbps{}",
                trade,
                node,
                line.outbound_ip,
                result.success_rate,
                result.avg_latency_ms,
                result.throughput_mbps,
                result
                    .failure
                    .map(|f| format!(" ({:?})", f))
                    .unwrap_or_default()
            );
        }
        Ok(owned.len())
    }

    async fn probe_line(&self, node: NodeId, line: &Line, download_url: &str) -> ProbeResult {
        let config = &self.shared.config;

        let reach = match socks5::test_reachability(
            line,
            &config.target_addr,
            config.reachability_attempts,
            config.dial_timeout,
        )
        .await
        {
            Ok(reach) => reach,
            Err(e) => {
                warn!("Reachability probe of node {} failed: {}", node, e);
                Reachability {
                    success_rate: 0.0,
                    avg_latency_ms: -1,
                }
            }
        };

        let download = self
            .probe
            .download_cycle(
                node,
                line,
                download_url,
                config.download_test_count,
                &self.shared.rotation(self.trade),
            )
            .await;
        let failure = download.failure.or_else(|| {
            (download.avg_mbps < config.thresholds.bad_speed_mbps).then_some(FailureClass::Slow)
        });
        let result = ProbeResult {
            success_rate: reach.success_rate,
            avg_latency_ms: reach.avg_latency_ms,
            throughput_mbps: download.avg_mbps,
            failure,
        };

        let sample = SampleRecord {
            node_id: node,
            node_name: line.display_name().to_string(),
            outbound_ip: line.outbound_ip.clone(),
            success_rate: result.success_rate,
            avg_latency_ms: result.avg_latency_ms,
            download_mbps: result.throughput_mbps,
            tested_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        if let Err(e) = self.shared.store.record_sample(&sample).await {
            warn!("Failed to record sample of node {}: {}", node, e);
        }

        self.shared
            .classifier
            .apply_sample(
                node,
                &line.outbound_ip,
                result.avg_latency_ms,
                result.throughput_mbps,
            )
            .await;
        result
    }
}
