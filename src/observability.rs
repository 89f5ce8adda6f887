use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── Protocol metrics ────────────────────────────────────────────

/// Counter: hold attempts. Labels: outcome (`held` or the rejection code).
pub const HOLDS_TOTAL: &str = "rentd_holds_total";

/// Counter: holds and bookings handing capacity back. Labels: status.
pub const RELEASES_TOTAL: &str = "rentd_releases_total";

/// Counter: per-token confirmation results. Labels: outcome.
pub const CONFIRMATIONS_TOTAL: &str = "rentd_confirmations_total";

/// Counter: webhook deliveries dropped as already processed.
pub const WEBHOOK_DUPLICATES_TOTAL: &str = "rentd_webhook_duplicates_total";

/// Counter: expiry sweep runs.
pub const SWEEP_RUNS_TOTAL: &str = "rentd_sweep_runs_total";

/// Counter: holds expired by the sweep.
pub const SWEEP_EXPIRED_TOTAL: &str = "rentd_sweep_expired_total";

// ── HTTP ────────────────────────────────────────────────────────

/// Histogram: request latency in seconds. Labels: route, status.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "rentd_http_request_duration_seconds";

/// Counter: storefront requests refused by the rate limiter.
pub const RATE_LIMITED_TOTAL: &str = "rentd_rate_limited_total";

// ── Storage ─────────────────────────────────────────────────────

/// Counter: write batches. Labels: outcome (`committed`, `aborted`, `wal_error`).
pub const BATCHES_TOTAL: &str = "rentd_batches_total";

/// Histogram: WAL append + fsync duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rentd_wal_flush_duration_seconds";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
