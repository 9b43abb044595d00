//! Configuration for the line monitor.

use crate::classifier::Thresholds;
use crate::error::ConfigError;
use crate::exit_errors::LockMode;
use crate::line::TradeId;
use crate::retry::RetryPolicy;

use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the line monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Control-plane origin.
    pub base_api_addr: String,
    /// One worker per trade id.
    pub trade_ids: Vec<TradeId>,
    /// Trade the scanner binds to nodes under investigation. No scanner when unset.
    pub watch_trade_id: Option<TradeId>,
    /// `host:port` the reachability probe dials through each line.
    pub target_addr: String,
    /// Fallback download URL for throughput probes.
    pub download_url: String,
    /// Fetches per worker download cycle.
    pub download_test_count: u32,
    /// Rounds per line in a remediation pass.
    pub remediation_rounds: u32,
    /// Dials per worker reachability probe.
    pub reachability_attempts: u32,
    /// Global cap on concurrent worker cycles.
    pub max_concurrency: usize,
    pub cycle_interval: Duration,
    pub scan_interval: Duration,
    /// Cooldown of both scanner dedupe caches.
    pub dedupe_cooldown: Duration,
    pub control_plane_timeout: Duration,
    pub dial_timeout: Duration,
    /// Transfer cap handed to the prober.
    pub transfer_timeout: Duration,
    /// The prober is killed after this long.
    pub kill_timeout: Duration,
    /// Pause after each outbound-ip rotation.
    pub rotation_cooldown: Duration,
    /// Time box of each classifier path.
    pub classification_timeout: Duration,
    /// Back-off when the scanner draws a node still cooling down.
    pub draw_backoff: Duration,
    /// Minutes the scanner idles when both tiers are empty.
    pub idle_backoff_minutes: u32,
    /// Empty quarantine draws before the scanner samples the good tier.
    pub empty_draws_before_good: u32,
    /// Upper bound on draws per scan.
    pub max_scan_draws: u32,
    pub worker_retry: RetryPolicy,
    pub scanner_retry: RetryPolicy,
    pub thresholds: Thresholds,
    pub lock_mode: LockMode,
    /// Line type the node catalog is filtered by.
    pub catalog_line_id: i64,
    /// Project the node catalog is filtered by.
    pub catalog_project_id: i64,
    pub database_path: PathBuf,
    /// Prober executable.
    pub curl_program: String,
}

impl MonitorConfig {
    /// Create a new configuration builder.
    pub fn builder() -> MonitorConfigBuilder {
        MonitorConfigBuilder::new()
    }

    /// Read a TOML file, apply defaults and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        MonitorConfigBuilder::from_toml_str(&raw)?.build().validate()
    }

    /// Reject configurations the monitor cannot run with.
    pub fn validate(self) -> Result<Self, ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.base_api_addr.trim().is_empty() {
            return invalid("base_api_addr must be set");
        }
        if self.trade_ids.is_empty() && self.watch_trade_id.is_none() {
            return invalid("at least one of trade_ids or watch_trade_id must be set");
        }
        if self.target_addr.trim().is_empty() {
            return invalid("target_addr must be set");
        }
        if self.download_url.trim().is_empty() {
            return invalid("download_url must be set");
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be at least 1");
        }
        if self.download_test_count == 0 || self.remediation_rounds == 0 {
            return invalid("download_test_count and remediation_rounds must be at least 1");
        }
        if self.reachability_attempts == 0 {
            return invalid("reachability_attempts must be at least 1");
        }
        if self.transfer_timeout < Duration::from_secs(1) {
            return invalid("transfer_timeout must be at least one second");
        }
        if self.kill_timeout < self.transfer_timeout {
            return invalid("kill_timeout must not be shorter than transfer_timeout");
        }
        Ok(self)
    }
}

fn secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
}

/// Builder for `MonitorConfig`. Also the shape of the TOML file, where
/// durations are given in whole seconds (`*_secs`).
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfigBuilder {
    base_api_addr: Option<String>,
    trade_ids: Vec<TradeId>,
    watch_trade_id: Option<TradeId>,
    target_addr: Option<String>,
    download_url: Option<String>,
    download_test_count: Option<u32>,
    remediation_rounds: Option<u32>,
    reachability_attempts: Option<u32>,
    max_concurrency: Option<usize>,
    #[serde(rename = "cycle_interval_secs", deserialize_with = "secs")]
    cycle_interval: Option<Duration>,
    #[serde(rename = "scan_interval_secs", deserialize_with = "secs")]
    scan_interval: Option<Duration>,
    #[serde(rename = "dedupe_cooldown_secs", deserialize_with = "secs")]
    dedupe_cooldown: Option<Duration>,
    #[serde(rename = "control_plane_timeout_secs", deserialize_with = "secs")]
    control_plane_timeout: Option<Duration>,
    #[serde(rename = "dial_timeout_secs", deserialize_with = "secs")]
    dial_timeout: Option<Duration>,
    #[serde(rename = "transfer_timeout_secs", deserialize_with = "secs")]
    transfer_timeout: Option<Duration>,
    #[serde(rename = "kill_timeout_secs", deserialize_with = "secs")]
    kill_timeout: Option<Duration>,
    #[serde(rename = "rotation_cooldown_secs", deserialize_with = "secs")]
    rotation_cooldown: Option<Duration>,
    #[serde(rename = "classification_timeout_secs", deserialize_with = "secs")]
    classification_timeout: Option<Duration>,
    #[serde(rename = "draw_backoff_secs", deserialize_with = "secs")]
    draw_backoff: Option<Duration>,
    idle_backoff_minutes: Option<u32>,
    empty_draws_before_good: Option<u32>,
    max_scan_draws: Option<u32>,
    worker_retry_attempts: Option<u32>,
    #[serde(rename = "worker_retry_delay_secs", deserialize_with = "secs")]
    worker_retry_delay: Option<Duration>,
    scanner_retry_attempts: Option<u32>,
    #[serde(rename = "scanner_retry_delay_secs", deserialize_with = "secs")]
    scanner_retry_delay: Option<Duration>,
    thresholds: Option<Thresholds>,
    lock_mode: Option<LockMode>,
    catalog_line_id: Option<i64>,
    catalog_project_id: Option<i64>,
    database_path: Option<PathBuf>,
    curl_program: Option<String>,
}

impl MonitorConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document into a builder.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Set the control-plane origin.
    pub fn base_api_addr(mut self, addr: impl Into<String>) -> Self {
        self.base_api_addr = Some(addr.into());
        self
    }

    /// Set the trade ids that each get a worker.
    pub fn trade_ids(mut self, ids: Vec<TradeId>) -> Self {
        self.trade_ids = ids;
        self
    }

    /// Set the trade id the scanner binds to investigated nodes.
    pub fn watch_trade_id(mut self, id: TradeId) -> Self {
        self.watch_trade_id = Some(id);
        self
    }

    /// Set the address dialed by reachability probes.
    pub fn target_addr(mut self, addr: impl Into<String>) -> Self {
        self.target_addr = Some(addr.into());
        self
    }

    /// Set the fallback download URL.
    pub fn download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = Some(url.into());
        self
    }

    /// Set the number of fetches per worker download cycle.
    pub fn download_test_count(mut self, count: u32) -> Self {
        self.download_test_count = Some(count);
        self
    }

    /// Set the number of rounds per line in a remediation pass.
    pub fn remediation_rounds(mut self, rounds: u32) -> Self {
        self.remediation_rounds = Some(rounds);
        self
    }

    /// Set the number of dials per worker reachability probe.
    pub fn reachability_attempts(mut self, attempts: u32) -> Self {
        self.reachability_attempts = Some(attempts);
        self
    }

    /// Set the global cap on concurrent worker cycles.
    pub fn max_concurrency(mut self, permits: usize) -> Self {
        self.max_concurrency = Some(permits);
        self
    }

    /// Set the pause between worker cycles.
    pub fn cycle_interval(mut self, interval: Duration) -> Self {
        self.cycle_interval = Some(interval);
        self
    }

    /// Set the pause between scans.
    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = Some(interval);
        self
    }

    /// Set the cooldown of the scanner's dedupe caches.
    pub fn dedupe_cooldown(mut self, cooldown: Duration) -> Self {
        self.dedupe_cooldown = Some(cooldown);
        self
    }

    /// Set the HTTP timeout of control-plane calls.
    pub fn control_plane_timeout(mut self, timeout: Duration) -> Self {
        self.control_plane_timeout = Some(timeout);
        self
    }

    /// Set the timeout of each reachability dial.
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    /// Set the transfer cap and the kill deadline of the prober.
    pub fn transfer_timeouts(mut self, transfer: Duration, kill: Duration) -> Self {
        self.transfer_timeout = Some(transfer);
        self.kill_timeout = Some(kill);
        self
    }

    /// Set the pause after each outbound-ip rotation.
    pub fn rotation_cooldown(mut self, cooldown: Duration) -> Self {
        self.rotation_cooldown = Some(cooldown);
        self
    }

    /// Set the time box of each classifier path.
    pub fn classification_timeout(mut self, timeout: Duration) -> Self {
        self.classification_timeout = Some(timeout);
        self
    }

    /// Set the back-off after drawing a node that is still cooling down.
    pub fn draw_backoff(mut self, backoff: Duration) -> Self {
        self.draw_backoff = Some(backoff);
        self
    }

    /// Set how many minutes the scanner idles when both tiers are empty.
    pub fn idle_backoff_minutes(mut self, minutes: u32) -> Self {
        self.idle_backoff_minutes = Some(minutes);
        self
    }

    /// Set the empty quarantine draws before the scanner samples the good tier.
    pub fn empty_draws_before_good(mut self, draws: u32) -> Self {
        self.empty_draws_before_good = Some(draws);
        self
    }

    /// Set the upper bound on draws per scan.
    pub fn max_scan_draws(mut self, draws: u32) -> Self {
        self.max_scan_draws = Some(draws);
        self
    }

    /// Set the retry policy of worker control-plane calls.
    pub fn worker_retry(mut self, policy: RetryPolicy) -> Self {
        self.worker_retry_attempts = Some(policy.max_attempts);
        self.worker_retry_delay = Some(policy.delay);
        self
    }

    /// Set the retry policy of scanner control-plane calls.
    pub fn scanner_retry(mut self, policy: RetryPolicy) -> Self {
        self.scanner_retry_attempts = Some(policy.max_attempts);
        self.scanner_retry_delay = Some(policy.delay);
        self
    }

    /// Set the classification thresholds.
    pub fn thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    /// Set how the scanner's investigation lock relates to the exit error map.
    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = Some(mode);
        self
    }

    /// Set the line type and project the node catalog is filtered by.
    pub fn catalog_filter(mut self, line_id: i64, project_id: i64) -> Self {
        self.catalog_line_id = Some(line_id);
        self.catalog_project_id = Some(project_id);
        self
    }

    /// Set the SQLite database path.
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Set the prober executable.
    pub fn curl_program(mut self, program: impl Into<String>) -> Self {
        self.curl_program = Some(program.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> MonitorConfig {
        MonitorConfig {
            base_api_addr: self.base_api_addr.unwrap_or_default(),
            trade_ids: self.trade_ids,
            watch_trade_id: self.watch_trade_id,
            target_addr: self.target_addr.unwrap_or_default(),
            download_url: self.download_url.unwrap_or_default(),
            download_test_count: self.download_test_count.unwrap_or(3),
            remediation_rounds: self.remediation_rounds.unwrap_or(3),
            reachability_attempts: self.reachability_attempts.unwrap_or(10),
            max_concurrency: self.max_concurrency.unwrap_or(5),
            cycle_interval: self.cycle_interval.unwrap_or(Duration::from_secs(3)),
            scan_interval: self.scan_interval.unwrap_or(Duration::from_secs(5)),
            dedupe_cooldown: self.dedupe_cooldown.unwrap_or(Duration::from_secs(30 * 60)),
            control_plane_timeout: self.control_plane_timeout.unwrap_or(Duration::from_secs(10)),
            dial_timeout: self.dial_timeout.unwrap_or(Duration::from_secs(10)),
            transfer_timeout: self.transfer_timeout.unwrap_or(Duration::from_secs(120)),
            kill_timeout: self.kill_timeout.unwrap_or(Duration::from_secs(130)),
            rotation_cooldown: self.rotation_cooldown.unwrap_or(Duration::from_secs(5)),
            classification_timeout: self.classification_timeout.unwrap_or(Duration::from_secs(5)),
            draw_backoff: self.draw_backoff.unwrap_or(Duration::from_secs(15)),
            idle_backoff_minutes: self.idle_backoff_minutes.unwrap_or(10),
            empty_draws_before_good: self.empty_draws_before_good.unwrap_or(3),
            max_scan_draws: self.max_scan_draws.unwrap_or(32),
            worker_retry: RetryPolicy::new(
                self.worker_retry_attempts.unwrap_or(3),
                self.worker_retry_delay.unwrap_or(Duration::from_secs(2)),
            ),
            scanner_retry: RetryPolicy::new(
                self.scanner_retry_attempts.unwrap_or(3),
                self.scanner_retry_delay.unwrap_or(Duration::from_secs(1)),
            ),
            thresholds: self.thresholds.unwrap_or_default(),
            lock_mode: self.lock_mode.unwrap_or_default(),
            catalog_line_id: self.catalog_line_id.unwrap_or(22),
            catalog_project_id: self.catalog_project_id.unwrap_or(592),
            database_path: self.database_path.unwrap_or_else(|| PathBuf::from("monitor.db")),
            curl_program: self.curl_program.unwrap_or_else(|| "curl".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = MonitorConfig::builder().build();
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.reachability_attempts, 10);
        assert_eq!(config.transfer_timeout, Duration::from_secs(120));
        assert_eq!(config.kill_timeout, Duration::from_secs(130));
        assert_eq!(config.dedupe_cooldown, Duration::from_secs(1800));
        assert_eq!(config.worker_retry, RetryPolicy::new(3, Duration::from_secs(2)));
        assert_eq!(config.scanner_retry, RetryPolicy::new(3, Duration::from_secs(1)));
        assert_eq!(config.lock_mode, LockMode::Coupled);
        assert_eq!(config.thresholds, Thresholds::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_overrides() {
        let raw = r#"
            base_api_addr = "http://10.0.0.5:8080"
            trade_ids = [1001, 1002]
            watch_trade_id = 2001
            target_addr = "10.0.0.5:8080"
            download_url = "http://mirror/100MB.bin"
            max_concurrency = 2
            cycle_interval_secs = 7
            lock_mode = "decoupled"

            [thresholds]
            good_speed_mbps = 20.0
        "#;
        let config = MonitorConfigBuilder::from_toml_str(raw)
            .unwrap()
            .build()
            .validate()
            .unwrap();
        assert_eq!(config.trade_ids, vec![1001, 1002]);
        assert_eq!(config.watch_trade_id, Some(2001));
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.cycle_interval, Duration::from_secs(7));
        assert_eq!(config.scan_interval, Duration::from_secs(5));
        assert_eq!(config.lock_mode, LockMode::Decoupled);
        assert_eq!(config.thresholds.good_speed_mbps, 20.0);
        assert_eq!(config.thresholds.bad_speed_mbps, 3.0);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = MonitorConfigBuilder::from_toml_str("max_concurency = 2").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn kill_deadline_must_cover_transfer_cap() {
        let result = MonitorConfig::builder()
            .base_api_addr("http://cp")
            .trade_ids(vec![1])
            .target_addr("cp:80")
            .download_url("http://d/f")
            .transfer_timeouts(Duration::from_secs(120), Duration::from_secs(60))
            .build()
            .validate();
        assert!(result.is_err());
    }

    #[test]
    fn sub_second_transfer_cap_is_rejected() {
        let result = MonitorConfig::builder()
            .base_api_addr("http://cp")
            .trade_ids(vec![1])
            .target_addr("cp:80")
            .download_url("http://d/f")
            .transfer_timeouts(Duration::from_millis(500), Duration::from_secs(2))
            .build()
            .validate();
        match result {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("transfer_timeout")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }
}
