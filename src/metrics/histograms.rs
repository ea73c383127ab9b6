//! Histogram metrics

use super::labels;

/// Record how long a TLS handshake took
pub fn handshake_duration(side: &'static str, millis: u64) {
    metrics::histogram!(labels::HANDSHAKE_DURATION_MS, "side" => side).record(millis as f64);
}
