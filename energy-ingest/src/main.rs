use std::sync::Arc;

use anyhow::Result;
use energy_ingest::{
    api::{HttpMeteringApi, RateLimiter},
    config::AppConfig,
    metrics_server, observability,
    run::Orchestrator,
    sinks::LocalBlobStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    // The rate limiter is the only state shared across meters.
    let limiter = Arc::new(RateLimiter::from_config(&cfg.api.rate_limit));
    let api = Arc::new(HttpMeteringApi::new(&cfg.api, limiter)?);
    let store = Arc::new(LocalBlobStore::new(&cfg.storage.root));

    let orchestrator = Orchestrator::new(api, store, &cfg);
    let summary = orchestrator.run().await?;

    // Partial failure is tolerated; a run where nothing succeeded is not.
    if summary.succeeded() == 0 && summary.failed() > 0 {
        anyhow::bail!("all meters failed ({} errors)", summary.failed());
    }
    Ok(())
}
