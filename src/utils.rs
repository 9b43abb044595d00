//! Utility functions for throughput figures.

/// Convert a transfer rate in bytes per second to megabits per second.
pub fn bytes_per_sec_to_mbps(rate: f64) -> f64 {
    rate * 8.0 / 1024.0 / 1024.0
}

/// Round a speed to two decimals.
pub fn format_speed(speed: f64) -> f64 {
    (speed * 100.0).round() / 100.0
}

/// Parse the transfer rate the prober wrote to stdout. The last non-empty line wins.
pub(crate) fn parse_transfer_rate(output: &str) -> Option<f64> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .and_then(|line| line.parse::<f64>().ok())
        .filter(|rate| rate.is_finite() && *rate >= 0.0)
}
