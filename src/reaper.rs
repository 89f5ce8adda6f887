use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::booking::BookingService;
use crate::engine::Engine;
use crate::ratelimit::RateLimiter;

/// Background task that periodically expires stale holds and prunes finished
/// rate-limit windows.
pub async fn run_sweeper(service: Arc<BookingService>, limiter: Arc<RateLimiter>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let report = service.sweep_expired().await;
        if report.expired > 0 {
            info!("sweeper expired {} holds", report.expired);
        }
        let pruned = limiter.prune(service.now());
        if pruned > 0 {
            tracing::debug!("sweeper pruned {pruned} rate-limit windows");
        }
    }
}

/// Background task that rewrites the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    if threshold == 0 {
        return;
    }
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// One compactor pass. Returns whether the WAL was rewritten.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    if engine.wal_appends_since_compact().await < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}
