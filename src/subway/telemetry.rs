use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::tunnel::error::CloseReason;

/// Lifecycle hooks fired by sessions. Every method defaults to a no-op.
pub trait MetricsSink: Send + Sync {
    fn on_session_opened(&self, _subdomain: &str) {}
    fn on_stream_opened(&self, _subdomain: &str) {}
    fn on_stream_closed(&self, _subdomain: &str, _bytes_in: u64, _bytes_out: u64) {}
    fn on_session_closed(&self, _subdomain: &str, _reason: &CloseReason) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Records through the `metrics` facade. Without an installed recorder the
/// calls are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetrics;

impl MetricsSink for FacadeMetrics {
    fn on_session_opened(&self, subdomain: &str) {
        metrics::counter!("subway_sessions_opened_total").increment(1);
        metrics::gauge!("subway_sessions_active").increment(1.0);
        tracing::trace!(subdomain, "metrics: session opened");
    }

    fn on_stream_opened(&self, _subdomain: &str) {
        metrics::counter!("subway_streams_opened_total").increment(1);
        metrics::gauge!("subway_streams_active").increment(1.0);
    }

    fn on_stream_closed(&self, _subdomain: &str, bytes_in: u64, bytes_out: u64) {
        metrics::gauge!("subway_streams_active").decrement(1.0);
        metrics::counter!("subway_stream_bytes_total", "direction" => "in").increment(bytes_in);
        metrics::counter!("subway_stream_bytes_total", "direction" => "out").increment(bytes_out);
    }

    fn on_session_closed(&self, _subdomain: &str, reason: &CloseReason) {
        metrics::gauge!("subway_sessions_active").decrement(1.0);
        metrics::counter!("subway_sessions_closed_total", "reason" => reason.kind()).increment(1);
    }
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// 128 bits from the thread-local CSPRNG, hex encoded.
pub fn new_session_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}
