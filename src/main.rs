use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use rentd::api::{self, AppState};
use rentd::booking::BookingService;
use rentd::clock::SystemClock;
use rentd::config::Config;
use rentd::engine::Engine;
use rentd::gateway::LogOnlyGateway;
use rentd::ratelimit::RateLimiter;
use rentd::reaper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    rentd::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let engine = Arc::new(Engine::new(config.wal_path())?);
    let service = Arc::new(BookingService::new(
        engine.clone(),
        Arc::new(LogOnlyGateway),
        Arc::new(SystemClock),
        config.hold_settings(),
    ));
    let limiter = Arc::new(RateLimiter::per_minute(config.rate_limit_per_min));

    tokio::spawn(reaper::run_sweeper(service.clone(), limiter.clone(), config.sweep_interval));
    tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold));

    let app = api::router(AppState { service, limiter });

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("rentd listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  hold ttl: {}s", config.hold_ttl.as_secs());
    info!("  sweep interval: {}s", config.sweep_interval.as_secs());
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("rentd stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM; in-flight requests are drained by axum.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable ({e}), waiting for ctrl-c only");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received, draining requests");
}
