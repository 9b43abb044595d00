//! # line-monitor
//!
//! Health monitor for SOCKS5 egress lines.
//!
//! Workers bind trade accounts to catalog nodes and probe the resulting lines for
//! reachability and throughput. A scanner re-investigates nodes whose outbound ip
//! was exhausted, and a hysteresis classifier moves nodes between the good tier
//! and quarantine.

pub mod classifier;
pub mod config;
pub mod control_plane;
pub mod dedupe;
pub mod error;
pub mod exit_errors;
pub mod line;
pub mod monitor;
pub mod retry;
pub mod scanner;
pub mod socks5;
pub mod store;
pub mod throughput;
mod utils;
pub mod worker;

pub use classifier::{CycleSummary, CycleVerdict, HealthClassifier, Thresholds};
pub use config::{MonitorConfig, MonitorConfigBuilder};
pub use control_plane::{ControlPlane, HttpControlPlane};
pub use error::{
    CatalogError, ConfigError, ControlPlaneError, CycleError, FetchError, ProbeError,
    RetryError, Socks5Error, StoreError,
};
pub use exit_errors::{ExitErrorMap, LockMode};
pub use line::{FailureClass, Line, NodeId, ProbeResult, Tier, TradeId};
pub use monitor::{LineMonitor, MonitorStats};
pub use scanner::{AnomalyScanner, ScanOutcome};
pub use store::{MemoryStore, SqliteStore, Store};
pub use throughput::{CurlProber, FetchRequest, ThroughputProbe, ThroughputProber};
pub use utils::{bytes_per_sec_to_mbps, format_speed};
pub use worker::Worker;
