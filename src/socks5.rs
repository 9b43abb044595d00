//! SOCKS5 reachability probing.
//!
//! Each attempt opens a fresh tunnel through the line's endpoint to the target
//! and closes it again. The handshake itself is done by `tokio-socks`.

use crate::error::{ProbeError, Socks5Error};
use crate::line::Line;

use log::{debug, warn};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;

/// Username/password pair for RFC 1929 authentication.
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub user: &'a str,
    pub pass: &'a str,
}

/// Aggregate of a reachability probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reachability {
    /// Percentage of dials that succeeded.
    pub success_rate: f64,
    /// Mean dial time over the successful attempts.
    pub avg_latency_ms: i64,
}

impl Reachability {
    /// Fold the latencies of the successful dials out of `attempts`.
    /// `None` when nothing succeeded.
    pub fn from_dials(attempts: u32, latencies_ms: &[i64]) -> Option<Self> {
        if latencies_ms.is_empty() || attempts == 0 {
            return None;
        }
        let successes = latencies_ms.len() as f64;
        Some(Self {
            success_rate: successes / f64::from(attempts) * 100.0,
            avg_latency_ms: latencies_ms.iter().sum::<i64>() / latencies_ms.len() as i64,
        })
    }
}

/// Dial `target_addr` through the line `attempts` times.
///
/// Partial success is averaged; only zero successes is an error.
pub async fn test_reachability(
    line: &Line,
    target_addr: &str,
    attempts: u32,
    dial_timeout: Duration,
) -> Result<Reachability, ProbeError> {
    let mut latencies = Vec::with_capacity(attempts as usize);
    let mut last_error = String::from("no attempts made");

    for attempt in 1..=attempts {
        let start = Instant::now();
        match timeout(dial_timeout, connect(&line.endpoint_addr, target_addr, line.credentials()))
            .await
        {
            Ok(Ok(stream)) => {
                drop(stream);
                latencies.push(start.elapsed().as_millis() as i64);
            }
            Ok(Err(e)) => {
                debug!("Dial {}/{} via {} failed: {}", attempt, attempts, line.endpoint_addr, e);
                last_error = e.to_string();
            }
            Err(_) => {
                debug!("Dial {}/{} via {} timed out", attempt, attempts, line.endpoint_addr);
                last_error = Socks5Error::Timeout(dial_timeout).to_string();
            }
        }
    }

    Reachability::from_dials(attempts, &latencies).ok_or_else(|| {
        warn!(
            "Every dial via {} (user {}) to {} failed",
            line.endpoint_addr, line.ss_user, target_addr
        );
        ProbeError::Unreachable {
            endpoint: line.endpoint_addr.clone(),
            user: line.ss_user.clone(),
            target: target_addr.to_string(),
            attempts,
            last: last_error,
        }
    })
}

/// Open a tunnel to `target` (`host:port`) through the SOCKS5 server at `endpoint`.
pub async fn connect(
    endpoint: &str,
    target: &str,
    credentials: Option<Credentials<'_>>,
) -> Result<Socks5Stream<TcpStream>, Socks5Error> {
    let stream = match credentials {
        Some(Credentials { user, pass }) => {
            Socks5Stream::connect_with_password(endpoint, target, user, pass).await?
        }
        None => Socks5Stream::connect(endpoint, target).await?,
    };
    Ok(stream)
}
