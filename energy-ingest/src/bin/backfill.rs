use std::env;
use std::sync::Arc;

use anyhow::{bail, Result};
use energy_ingest::{
    api::{HttpMeteringApi, RateLimiter},
    config::AppConfig,
    observability,
    plan::FetchWindow,
    run::Orchestrator,
    sinks::LocalBlobStore,
};
use time::{Duration, OffsetDateTime};

/// One-shot backfill over an explicit lookback, bypassing bookmarks but
/// writing through the same idempotent partitions.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration (can point INGESTION_CONFIG to a backfill-specific file).
    let cfg = AppConfig::load()?;

    let args: Vec<String> = env::args().collect();
    let days_back: i64 = match args.get(1) {
        Some(arg) => arg
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid <days-back> '{arg}': {e}"))?,
        None => cfg.ingest.bootstrap_lookback_days,
    };
    if days_back <= 0 {
        bail!("usage: backfill [days-back], days-back must be positive");
    }

    let now = OffsetDateTime::now_utc();
    let window = FetchWindow {
        start: now - Duration::days(days_back),
        end: now,
    };
    tracing::info!(start = %window.start, end = %window.end, "backfill window");

    let limiter = Arc::new(RateLimiter::from_config(&cfg.api.rate_limit));
    let api = Arc::new(HttpMeteringApi::new(&cfg.api, limiter)?);
    let store = Arc::new(LocalBlobStore::new(&cfg.storage.root));

    let orchestrator = Orchestrator::new(api, store, &cfg);
    let summary = orchestrator.run_window(window).await?;

    if summary.succeeded() == 0 && summary.failed() > 0 {
        bail!("backfill failed for every meter ({} errors)", summary.failed());
    }
    Ok(())
}
