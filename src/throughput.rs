//! Throughput probing through a line's SOCKS5 endpoint.
//!
//! The transfer itself is delegated to a [`ThroughputProber`]. The default
//! implementation shells out to curl and reads `%{speed_download}` from stdout.

use crate::control_plane::Rotation;
use crate::error::FetchError;
use crate::exit_errors::ExitErrorMap;
use crate::line::{FailureClass, Line, NodeId};
use crate::utils::{bytes_per_sec_to_mbps, format_speed, parse_transfer_rate};

use async_trait::async_trait;
use log::{debug, info, warn};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time;
use tokio_util::sync::CancellationToken;

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// One download through a proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub proxy_url: String,
    pub download_url: String,
    /// Transfer cap handed to the prober.
    pub transfer_timeout: Duration,
}

/// Capability that performs a download and reports bytes per second.
#[async_trait]
pub trait ThroughputProber: Send + Sync {
    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<f64, FetchError>;
}

/// Runs `curl` as a child process, killed if it outlives `kill_after`.
#[derive(Debug, Clone)]
pub struct CurlProber {
    program: String,
    kill_after: Duration,
}

impl CurlProber {
    pub fn new(program: impl Into<String>, kill_after: Duration) -> Self {
        Self {
            program: program.into(),
            kill_after,
        }
    }
}

impl Default for CurlProber {
    fn default() -> Self {
        Self::new("curl", Duration::from_secs(130))
    }
}

#[async_trait]
impl ThroughputProber for CurlProber {
    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<f64, FetchError> {
        let child = Command::new(&self.program)
            .arg("-x")
            .arg(&request.proxy_url)
            .arg("--insecure")
            .arg("--silent")
            .arg("-m")
            .arg(max_time_arg(request.transfer_timeout))
            .arg("--write-out")
            .arg("%{speed_download}")
            .arg("--output")
            .arg(NULL_DEVICE)
            .arg(&request.download_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(FetchError::Spawn)?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            waited = time::timeout(self.kill_after, child.wait_with_output()) => match waited {
                Ok(output) => output.map_err(FetchError::Wait)?,
                Err(_) => {
                    warn!("Prober exceeded {:?}, killed", self.kill_after);
                    return Err(FetchError::TimedOut(self.kill_after));
                }
            },
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        };

        if !output.status.success() {
            return Err(match output.status.code() {
                Some(code) => FetchError::Exit(code),
                None => FetchError::Signaled,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_transfer_rate(&stdout).ok_or_else(|| FetchError::Parse(stdout.trim().to_string()))
    }
}

/// Whole seconds for curl's `-m`, rounded up. `-m 0` would mean no limit.
fn max_time_arg(cap: Duration) -> String {
    (cap.as_secs_f64().ceil() as u64).max(1).to_string()
}

/// Averaged result of a download cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadSummary {
    /// Sum of successful speeds over the number of fetches, two decimals.
    pub avg_mbps: f64,
    /// `ProxyExhausted` if any fetch hit it, else `TransientIo` if any fetch failed.
    pub failure: Option<FailureClass>,
}

/// Throughput measurement owned by a worker or the scanner.
#[derive(Clone)]
pub struct ThroughputProbe {
    prober: Arc<dyn ThroughputProber>,
    exit_errors: Option<ExitErrorMap>,
    transfer_timeout: Duration,
    cancel: CancellationToken,
}

impl ThroughputProbe {
    pub fn new(
        prober: Arc<dyn ThroughputProber>,
        transfer_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            prober,
            exit_errors: None,
            transfer_timeout,
            cancel,
        }
    }

    /// Record proxy-exhausted outbound ips into `map`.
    pub fn recording_into(mut self, map: ExitErrorMap) -> Self {
        self.exit_errors = Some(map);
        self
    }

    /// Download `download_url` through `line`, returning Mbps.
    pub async fn measure(
        &self,
        node: NodeId,
        line: &Line,
        download_url: &str,
    ) -> Result<f64, FetchError> {
        let proxy_url = line
            .proxy_url()
            .map_err(|e| FetchError::InvalidProxy(e.to_string()))?;
        let request = FetchRequest {
            proxy_url,
            download_url: download_url.to_string(),
            transfer_timeout: self.transfer_timeout,
        };

        match self.prober.fetch(&request, &self.cancel).await {
            Ok(rate) => Ok(bytes_per_sec_to_mbps(rate)),
            Err(e) => {
                if e.failure_class() == FailureClass::ProxyExhausted {
                    if let Some(map) = &self.exit_errors {
                        if map.record(node, &line.outbound_ip).await {
                            info!("Flagged {} on node {}: {}", line.outbound_ip, node, e);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Run `count` fetches. Failed fetches count as zero toward the average.
    ///
    /// A proxy-exhausted failure rotates the outbound ip before the next fetch.
    pub async fn download_cycle(
        &self,
        node: NodeId,
        line: &Line,
        download_url: &str,
        count: u32,
        rotation: &Rotation<'_>,
    ) -> DownloadSummary {
        let mut total = 0.0;
        let mut failure = None;

        for round in 1..=count {
            match self.measure(node, line, download_url).await {
                Ok(mbps) => {
                    debug!("Fetch {}/{} via {}: {:.2} Mbps", round, count, line.outbound_ip, mbps);
                    total += mbps;
                }
                Err(FetchError::Cancelled) => {
                    failure.get_or_insert(FailureClass::TransientIo);
                    break;
                }
                Err(e) => {
                    let class = e.failure_class();
                    warn!("Fetch {}/{} via {} failed: {}", round, count, line.outbound_ip, e);
                    if class == FailureClass::ProxyExhausted {
                        failure = Some(FailureClass::ProxyExhausted);
                        rotation.rotate().await;
                    } else {
                        failure.get_or_insert(class);
                    }
                }
            }
        }

        let avg_mbps = if count == 0 {
            0.0
        } else {
            format_speed(total / f64::from(count))
        };
        DownloadSummary { avg_mbps, failure }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn script(name: &str, body: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("line-monitor-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request() -> FetchRequest {
        FetchRequest {
            proxy_url: "socks5://u:p@127.0.0.1:1".to_string(),
            download_url: "http://example.invalid/file".to_string(),
            transfer_timeout: Duration::from_secs(120),
        }
    }

    #[tokio::test]
    async fn curl_prober_outcomes() {
        let ok = script("ok.sh", "printf 1310720.000");
        let prober = CurlProber::new(ok.to_string_lossy(), Duration::from_secs(10));
        let rate = prober.fetch(&request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(format_speed(bytes_per_sec_to_mbps(rate)), 10.0);

        let exhausted = script("exit28.sh", "exit 28");
        let prober = CurlProber::new(exhausted.to_string_lossy(), Duration::from_secs(10));
        let err = prober.fetch(&request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::Exit(28)));
        assert_eq!(err.failure_class(), FailureClass::ProxyExhausted);

        let garbage = script("garbage.sh", "echo fast");
        let prober = CurlProber::new(garbage.to_string_lossy(), Duration::from_secs(10));
        let err = prober.fetch(&request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
        assert_eq!(err.failure_class(), FailureClass::TransientIo);
    }

    #[tokio::test]
    async fn hung_prober_is_killed() {
        let hang = script("hang.sh", "sleep 30");
        let prober = CurlProber::new(hang.to_string_lossy(), Duration::from_millis(200));
        let err = prober.fetch(&request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::TimedOut(_)));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let prober = CurlProber::new(hang.to_string_lossy(), Duration::from_secs(30));
        let err = prober.fetch(&request(), &cancel).await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }

    #[test]
    fn transfer_cap_rounds_up_to_whole_seconds() {
        assert_eq!(max_time_arg(Duration::from_secs(120)), "120");
        assert_eq!(max_time_arg(Duration::from_millis(1500)), "2");
        assert_eq!(max_time_arg(Duration::from_millis(200)), "1");
        assert_eq!(max_time_arg(Duration::ZERO), "1");
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let prober = CurlProber::new("/nonexistent/curl-binary", Duration::from_secs(1));
        let err = prober.fetch(&request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::Spawn(_)));
    }
}
