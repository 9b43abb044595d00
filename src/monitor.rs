//! Monitor wiring: shared state, catalog bootstrap and task supervision.

use crate::classifier::HealthClassifier;
use crate::config::MonitorConfig;
use crate::control_plane::{ControlPlane, Rotation};
use crate::error::CatalogError;
use crate::exit_errors::ExitErrorMap;
use crate::line::TradeId;
use crate::scanner::AnomalyScanner;
use crate::store::Store;
use crate::throughput::{ThroughputProbe, ThroughputProber};
use crate::worker::Worker;

use futures::future;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time;
use tokio_util::sync::CancellationToken;

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// State shared by every worker and the scanner.
pub(crate) struct Shared {
    pub(crate) config: MonitorConfig,
    pub(crate) control_plane: Arc<dyn ControlPlane>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) classifier: HealthClassifier,
    pub(crate) exit_errors: ExitErrorMap,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) shutdown: CancellationToken,
    prober: Arc<dyn ThroughputProber>,
}

impl Shared {
    /// Throughput probe that does not record into the exit error map.
    pub(crate) fn probe(&self) -> ThroughputProbe {
        ThroughputProbe::new(
            Arc::clone(&self.prober),
            self.config.transfer_timeout,
            self.shutdown.child_token(),
        )
    }

    pub(crate) fn rotation(&self, trade: TradeId) -> Rotation<'_> {
        Rotation {
            control_plane: &*self.control_plane,
            trade,
            cooldown: self.config.rotation_cooldown,
        }
    }

    /// Sleep unless shutdown is requested first. Returns false on shutdown.
    pub(crate) async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = time::sleep(duration) => true,
            _ = self.shutdown.cancelled() => false,
        }
    }
}

/// Snapshot of the tier sets and the concurrency limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorStats {
    pub good_nodes: usize,
    pub quarantined_ips: usize,
    /// `None` while a scan holds the exit error map.
    pub flagged_nodes: Option<usize>,
    pub available_permits: usize,
}

/// Owns the shared state and spawns the workers and the scanner.
pub struct LineMonitor {
    shared: Arc<Shared>,
}

impl LineMonitor {
    pub fn new(
        config: MonitorConfig,
        control_plane: Arc<dyn ControlPlane>,
        store: Arc<dyn Store>,
        prober: Arc<dyn ThroughputProber>,
    ) -> Self {
        let classifier = HealthClassifier::new(
            Arc::clone(&store),
            config.thresholds.clone(),
            config.classification_timeout,
        );
        let shared = Shared {
            exit_errors: ExitErrorMap::new(config.lock_mode),
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            shutdown: CancellationToken::new(),
            classifier,
            control_plane,
            store,
            prober,
            config,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.shared.store
    }

    pub fn exit_errors(&self) -> &ExitErrorMap {
        &self.shared.exit_errors
    }

    /// Pull provinces and their nodes from the control plane into the store.
    /// Returns the number of nodes saved.
    pub async fn sync_catalog(&self) -> Result<usize, CatalogError> {
        let cp = &self.shared.control_plane;
        let store = &self.shared.store;

        let provinces = cp.list_provinces().await?;
        store.save_provinces(&provinces).await?;
        info!("Fetched {} provinces", provinces.len());

        let mut saved = 0;
        for province in &provinces {
            match cp.list_nodes(province.id).await {
                Ok(nodes) => {
                    store.save_nodes(&nodes).await?;
                    saved += nodes.len();
                }
                Err(e) => {
                    warn!("Failed to fetch nodes of province {} ({}): {}", province.name, province.id, e);
                }
            }
        }
        info!("Catalog holds {} nodes from {} provinces", saved, provinces.len());
        Ok(saved)
    }

    /// Sync the catalog if asked to, or if the store has none yet.
    pub async fn ensure_catalog(&self, refresh: bool) -> Result<(), CatalogError> {
        if refresh || !self.shared.store.has_catalog().await? {
            self.sync_catalog().await?;
        } else {
            info!("Using the stored node catalog");
        }
        Ok(())
    }

    /// Worker for `trade`. Proxy-exhausted failures are recorded into the exit error map.
    pub fn worker(&self, trade: TradeId) -> Worker {
        Worker::new(Arc::clone(&self.shared), trade)
    }

    /// The scanner, when a watch trade id is configured.
    pub fn scanner(&self) -> Option<AnomalyScanner> {
        self.shared
            .config
            .watch_trade_id
            .map(|trade| AnomalyScanner::new(Arc::clone(&self.shared), trade))
    }

    pub async fn get_stats(&self) -> MonitorStats {
        let store = &self.shared.store;
        let good_nodes = match store.good_nodes().await {
            Ok(nodes) => nodes.len(),
            Err(e) => {
                warn!("Failed to count good nodes: {}", e);
                0
            }
        };
        let quarantined_ips = match store.bad_entries().await {
            Ok(entries) => entries.len(),
            Err(e) => {
                warn!("Failed to count quarantined ips: {}", e);
                0
            }
        };
        MonitorStats {
            good_nodes,
            quarantined_ips,
            flagged_nodes: self.shared.exit_errors.pending_nodes(),
            available_permits: self.shared.permits.available_permits(),
        }
    }

    /// Ask every task to stop after its current step.
    pub fn shutdown(&self) {
        info!("Shutting down line monitor");
        self.shared.shutdown.cancel();
        self.shared.permits.close();
    }

    /// Run one worker per trade id, the scanner and a status reporter until shutdown.
    pub async fn run(&self) {
        let mut tasks = Vec::new();
        for &trade in &self.shared.config.trade_ids {
            let worker = self.worker(trade);
            tasks.push(tokio::spawn(worker.run()));
        }
        if let Some(scanner) = self.scanner() {
            tasks.push(tokio::spawn(scanner.run()));
        }
        info!(
            "Started {} workers{}",
            self.shared.config.trade_ids.len(),
            if self.shared.config.watch_trade_id.is_some() { " and the scanner" } else { "" }
        );

        let status = async {
            while self.shared.pause(STATUS_INTERVAL).await {
                let stats = self.get_stats().await;
                info!(
                    "Monitor status: {} good nodes, {} quarantined ips, {} flagged nodes, {}/{} permits free",
                    stats.good_nodes,
                    stats.quarantined_ips,
                    stats
                        .flagged_nodes
                        .map_or_else(|| "?".to_string(), |n| n.to_string()),
                    stats.available_permits,
                    self.shared.config.max_concurrency
                );
            }
        };

        let (results, ()) = tokio::join!(future::join_all(tasks), status);
        for result in results {
            if let Err(e) = result {
                warn!("Monitor task ended abnormally: {}", e);
            }
        }
        info!("Line monitor stopped");
    }
}
