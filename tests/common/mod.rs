#![allow(dead_code)]

use async_trait::async_trait;
use line_monitor::line::{BadEntry, HealthCounters, Node, Province, SampleRecord};
use line_monitor::{
    ControlPlane, ControlPlaneError, FetchError, FetchRequest, Line, LineMonitor, MemoryStore,
    MonitorConfig, MonitorConfigBuilder, NodeId, Store, StoreError, ThroughputProber, TradeId,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

pub const WORKER_TRADE: TradeId = 1001;
pub const WATCH_TRADE: TradeId = 2001;

/// Call made against a fake collaborator, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Bind { trade: TradeId, node: NodeId },
    ListLines,
    Rotate(TradeId),
    Fetch,
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

pub fn line(trade: TradeId, ip: &str) -> Line {
    Line {
        id: trade,
        trade_name: format!("trade-{}", trade),
        ss_user: trade.to_string(),
        ss_pass: "secret".to_string(),
        // nothing listens here, so reachability probes fail fast
        endpoint_addr: "127.0.0.1:1".to_string(),
        outbound_ip: ip.to_string(),
        node_name: "#Hangzhou".to_string(),
    }
}

#[derive(Default)]
pub struct FakeControlPlane {
    pub events: EventLog,
    pub lines: Mutex<Vec<Line>>,
    /// Bind calls left to fail.
    pub bind_failures: Mutex<u32>,
    pub provinces: Vec<Province>,
    /// Province id to nodes. Missing provinces fail.
    pub nodes: HashMap<i64, Vec<Node>>,
}

impl FakeControlPlane {
    pub fn with_lines(events: EventLog, lines: Vec<Line>) -> Self {
        Self {
            events,
            lines: Mutex::new(lines),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn list_lines(&self) -> Result<Vec<Line>, ControlPlaneError> {
        self.events.lock().push(Event::ListLines);
        let lines = self.lines.lock().clone();
        if lines.is_empty() {
            return Err(ControlPlaneError::EmptyLines);
        }
        Ok(lines)
    }

    async fn bind_trade_to_node(
        &self,
        trade: TradeId,
        node: NodeId,
    ) -> Result<(), ControlPlaneError> {
        self.events.lock().push(Event::Bind { trade, node });
        let mut failures = self.bind_failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(ControlPlaneError::Rejected {
                code: 500,
                msg: "busy".to_string(),
            });
        }
        Ok(())
    }

    async fn rotate_outbound_ip(&self, trade: TradeId) -> Result<(), ControlPlaneError> {
        self.events.lock().push(Event::Rotate(trade));
        Ok(())
    }

    async fn list_provinces(&self) -> Result<Vec<Province>, ControlPlaneError> {
        Ok(self.provinces.clone())
    }

    async fn list_nodes(&self, province: i64) -> Result<Vec<Node>, ControlPlaneError> {
        self.nodes
            .get(&province)
            .cloned()
            .ok_or(ControlPlaneError::Rejected {
                code: 404,
                msg: "unknown province".to_string(),
            })
    }
}

/// Scripted outcome of one fetch.
#[derive(Debug, Clone, Copy)]
pub enum Fetch {
    Mbps(f64),
    Exit(i32),
}

/// Replays scripted outcomes, then keeps answering `fallback`.
pub struct ScriptedProber {
    events: EventLog,
    script: Mutex<VecDeque<Fetch>>,
    fallback: Fetch,
}

impl ScriptedProber {
    pub fn new(events: EventLog, script: impl IntoIterator<Item = Fetch>, fallback: Fetch) -> Self {
        Self {
            events,
            script: Mutex::new(script.into_iter().collect()),
            fallback,
        }
    }
}

#[async_trait]
impl ThroughputProber for ScriptedProber {
    async fn fetch(
        &self,
        _request: &FetchRequest,
        _cancel: &CancellationToken,
    ) -> Result<f64, FetchError> {
        self.events.lock().push(Event::Fetch);
        let next = self.script.lock().pop_front().unwrap_or(self.fallback);
        match next {
            // bytes per second that convert back to the scripted Mbps
            Fetch::Mbps(mbps) => Ok(mbps * 1024.0 * 1024.0 / 8.0),
            Fetch::Exit(code) => Err(FetchError::Exit(code)),
        }
    }
}

pub fn config() -> MonitorConfigBuilder {
    MonitorConfig::builder()
        .base_api_addr("http://control-plane.invalid")
        .trade_ids(vec![WORKER_TRADE])
        .watch_trade_id(WATCH_TRADE)
        .target_addr("127.0.0.1:1")
        .download_url("http://files.invalid/100MB.bin")
        .reachability_attempts(2)
        .dial_timeout(Duration::from_secs(1))
}

pub struct Harness {
    pub events: EventLog,
    pub store: Arc<MemoryStore>,
    pub control_plane: Arc<FakeControlPlane>,
    pub monitor: LineMonitor,
}

pub fn harness(
    config: MonitorConfigBuilder,
    store: MemoryStore,
    lines: Vec<Line>,
    script: Vec<Fetch>,
    fallback: Fetch,
) -> Harness {
    let events = EventLog::default();
    let store = Arc::new(store);
    let control_plane = Arc::new(FakeControlPlane::with_lines(events.clone(), lines));
    let prober = Arc::new(ScriptedProber::new(events.clone(), script, fallback));
    let monitor = LineMonitor::new(
        config.build(),
        control_plane.clone(),
        store.clone(),
        prober,
    );
    Harness {
        events,
        store,
        control_plane,
        monitor,
    }
}

impl Harness {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn binds(&self) -> Vec<NodeId> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Bind { node, .. } => Some(node),
                _ => None,
            })
            .collect()
    }
}

/// Holds every fetch for `hold` and remembers the most fetches seen at once.
pub struct GaugeProber {
    hold: Duration,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
    pub total: AtomicUsize,
}

impl GaugeProber {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ThroughputProber for GaugeProber {
    async fn fetch(
        &self,
        _request: &FetchRequest,
        _cancel: &CancellationToken,
    ) -> Result<f64, FetchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        time::sleep(self.hold).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(20.0 * 1024.0 * 1024.0 / 8.0)
    }
}

/// Memory store whose `remove_bad_node` takes `delay`.
pub struct SlowStore {
    pub inner: MemoryStore,
    pub delay: Duration,
}

#[async_trait]
impl Store for SlowStore {
    async fn save_provinces(&self, provinces: &[Province]) -> Result<(), StoreError> {
        self.inner.save_provinces(provinces).await
    }
    async fn save_nodes(&self, nodes: &[Node]) -> Result<(), StoreError> {
        self.inner.save_nodes(nodes).await
    }
    async fn has_catalog(&self) -> Result<bool, StoreError> {
        self.inner.has_catalog().await
    }
    async fn node_ids(&self) -> Result<Vec<NodeId>, StoreError> {
        self.inner.node_ids().await
    }
    async fn record_sample(&self, sample: &SampleRecord) -> Result<(), StoreError> {
        self.inner.record_sample(sample).await
    }
    async fn download_url(&self) -> Result<Option<String>, StoreError> {
        self.inner.download_url().await
    }
    async fn set_download_url(&self, url: &str) -> Result<(), StoreError> {
        self.inner.set_download_url(url).await
    }
    async fn counters(&self, node: NodeId) -> Result<HealthCounters, StoreError> {
        self.inner.counters(node).await
    }
    async fn bump_good(&self, node: NodeId) -> Result<u32, StoreError> {
        self.inner.bump_good(node).await
    }
    async fn reset_good(&self, node: NodeId) -> Result<(), StoreError> {
        self.inner.reset_good(node).await
    }
    async fn bump_bad(&self, node: NodeId) -> Result<u32, StoreError> {
        self.inner.bump_bad(node).await
    }
    async fn reset_bad(&self, node: NodeId) -> Result<(), StoreError> {
        self.inner.reset_bad(node).await
    }
    async fn is_good(&self, node: NodeId) -> Result<bool, StoreError> {
        self.inner.is_good(node).await
    }
    async fn insert_good(&self, node: NodeId) -> Result<bool, StoreError> {
        self.inner.insert_good(node).await
    }
    async fn remove_good(&self, node: NodeId) -> Result<bool, StoreError> {
        self.inner.remove_good(node).await
    }
    async fn random_good(&self) -> Result<Option<NodeId>, StoreError> {
        self.inner.random_good().await
    }
    async fn good_nodes(&self) -> Result<Vec<NodeId>, StoreError> {
        self.inner.good_nodes().await
    }
    async fn is_bad_ip(&self, ip: &str) -> Result<bool, StoreError> {
        self.inner.is_bad_ip(ip).await
    }
    async fn is_bad_node(&self, node: NodeId) -> Result<bool, StoreError> {
        self.inner.is_bad_node(node).await
    }
    async fn insert_bad(&self, ip: &str, node: NodeId) -> Result<bool, StoreError> {
        self.inner.insert_bad(ip, node).await
    }
    async fn remove_bad_ip(&self, ip: &str) -> Result<bool, StoreError> {
        self.inner.remove_bad_ip(ip).await
    }
    async fn remove_bad_node(&self, node: NodeId) -> Result<usize, StoreError> {
        time::sleep(self.delay).await;
        self.inner.remove_bad_node(node).await
    }
    async fn random_bad(&self) -> Result<Option<NodeId>, StoreError> {
        self.inner.random_bad().await
    }
    async fn bad_entries(&self) -> Result<Vec<BadEntry>, StoreError> {
        self.inner.bad_entries().await
    }
    async fn record_bad_ip(&self, ip: &str, node: NodeId) -> Result<(), StoreError> {
        self.inner.record_bad_ip(ip, node).await
    }
    async fn bad_ip_history(&self) -> Result<Vec<BadEntry>, StoreError> {
        self.inner.bad_ip_history().await
    }
}
