use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use pricecache::api::rest::{create_router, ApiState};
use pricecache::cache::PriceCache;
use pricecache::config::AppConfig;
use pricecache::error::Result;
use pricecache::fetch::fetcher::PriceFetcher;
use pricecache::logger::init_tracing;
use pricecache::rate_limit::RateLimiter;
use pricecache::scheduler::RefreshScheduler;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("starting pricecache");

    let config = AppConfig::load()?;

    // Construction order: cache and limiter first, the fetcher capturing
    // both, the scheduler capturing the fetcher, the HTTP surface last.
    let cache = Arc::new(PriceCache::new(config.ttl_min(), config.ttl_max()));
    let limiter = Arc::new(RateLimiter::new(config.window()));
    let fetcher = Arc::new(PriceFetcher::new(
        config.clone(),
        Arc::clone(&cache),
        Arc::clone(&limiter),
    )?);
    let scheduler = Arc::new(RefreshScheduler::new(
        Arc::clone(&fetcher),
        config.scheduler_interval(),
        config.refresh_threshold(),
    ));

    if config.seed_on_startup {
        scheduler.seed().await;
    }
    scheduler.start();

    let state = Arc::new(ApiState {
        config: config.clone(),
        cache,
        limiter,
        fetcher,
        scheduler: Arc::clone(&scheduler),
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(scheduler: Arc<RefreshScheduler>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
    scheduler.stop();
}
