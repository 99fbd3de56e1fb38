use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Byte-level progress of one transfer attempt, annotated with which
/// provider and attempt produced it. Numbers only; presentation strings
/// belong to the embedding UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub bytes_sent: u64,
    pub bytes_total: u64,
    pub percent: f32,
    pub bytes_per_sec: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    pub elapsed_ms: u64,
    pub provider: String,
    pub attempt: u32,
}

/// Derives throughput and remaining-time estimates from raw counters.
pub fn snapshot(
    bytes_sent: u64,
    bytes_total: u64,
    elapsed: Duration,
    provider: &str,
    attempt: u32,
) -> ProgressSnapshot {
    let percent = if bytes_total > 0 {
        ((bytes_sent as f64 / bytes_total as f64) * 100.0).min(100.0) as f32
    } else {
        0.0
    };

    let elapsed_secs = elapsed.as_secs_f64();
    let rate = if elapsed_secs > 0.0 {
        bytes_sent as f64 / elapsed_secs
    } else {
        0.0
    };

    let remaining = bytes_total.saturating_sub(bytes_sent);
    let eta_seconds = if bytes_sent > 0 && rate > 0.0 {
        Some((remaining as f64 / rate) as u64)
    } else {
        None
    };

    ProgressSnapshot {
        bytes_sent,
        bytes_total,
        percent,
        bytes_per_sec: rate as u64,
        eta_seconds,
        elapsed_ms: elapsed.as_millis() as u64,
        provider: provider.to_string(),
        attempt,
    }
}
