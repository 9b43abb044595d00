//! Error types for the line-monitor crate.

use crate::line::{FailureClass, NodeId};
use std::time::Duration;
use thiserror::Error;

/// Failure while opening a tunnel through a SOCKS5 endpoint.
#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("socks5 handshake failed: {0}")]
    Handshake(#[from] tokio_socks::Error),
    #[error("dial timed out after {0:?}")]
    Timeout(Duration),
}

/// Reachability probe failure. Only raised when no dial succeeded.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("all {attempts} dials via {endpoint} (user {user}) to {target} failed: {last}")]
    Unreachable {
        endpoint: String,
        user: String,
        target: String,
        attempts: u32,
        last: String,
    },
}

/// Failure of one throughput fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to spawn prober: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed waiting for prober: {0}")]
    Wait(#[source] std::io::Error),
    #[error("prober exited with code {0}")]
    Exit(i32),
    #[error("prober terminated by signal")]
    Signaled,
    #[error("prober killed after {0:?}")]
    TimedOut(Duration),
    #[error("fetch cancelled")]
    Cancelled,
    #[error("unparseable transfer rate {0:?}")]
    Parse(String),
    #[error("invalid proxy address: {0}")]
    InvalidProxy(String),
}

impl FetchError {
    /// Exit codes in the hard-failure set mean the outbound ip is spent.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            FetchError::Exit(code) => FailureClass::from_exit_code(*code),
            _ => FailureClass::TransientIo,
        }
    }
}

/// Control-plane call failure.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("control plane request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid control plane url: {0}")]
    Url(#[from] url::ParseError),
    #[error("control plane rejected request: code {code}, msg {msg:?}")]
    Rejected { code: i64, msg: String },
    #[error("control plane returned no lines")]
    EmptyLines,
}

/// Persistence failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Configuration loading failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// An operation that kept failing after every allowed attempt.
#[derive(Debug, Error)]
#[error("{action} failed after {attempts} attempts: {last}")]
pub struct RetryError<E> {
    pub action: String,
    pub attempts: u32,
    pub last: E,
}

/// Why a worker cycle or remediation pass stopped early.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("no candidate nodes in the catalog")]
    NoCandidates,
    #[error("concurrency limiter closed")]
    Closed,
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("binding node {node}: {cause}")]
    Bind {
        node: NodeId,
        cause: RetryError<ControlPlaneError>,
    },
    #[error("listing lines: {0}")]
    ListLines(RetryError<ControlPlaneError>),
}

/// Catalog bootstrap failure.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
