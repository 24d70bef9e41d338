use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use energy_domain::Meter;
use serde::Deserialize;

use crate::error::IngestError;

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    /// May be left empty in the file and supplied via `ENERGY_API_KEY`.
    #[serde(default)]
    pub api_key: String,
    pub account_number: String,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_pct: 0.25,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5.0,
            burst: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of the local blob store; object-store backends sit behind the
    /// same `BlobStore` trait.
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub bootstrap_lookback_days: i64,
    pub safety_lag_minutes: i64,
    pub granularity_minutes: i64,
    pub concurrency: usize,
    pub run_deadline_secs: Option<u64>,
    pub enrich_costs: bool,
    pub write_max_retries: u32,
    pub write_retry_backoff_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bootstrap_lookback_days: 30,
            safety_lag_minutes: 60,
            granularity_minutes: 30,
            concurrency: 1,
            run_deadline_secs: None,
            enrich_costs: true,
            write_max_retries: 3,
            write_retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TariffConfig {
    pub electricity_product_code: Option<String>,
    pub gas_product_code: Option<String>,
    pub electricity_tariff_code: Option<String>,
    pub gas_tariff_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub tariffs: TariffConfig,
    #[serde(default)]
    pub meters: Vec<Meter>,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("INGESTION_CONFIG").unwrap_or_else(|_| "ingestion-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        let mut cfg: AppConfig = toml::from_str(&contents)?;
        if let Ok(key) = env::var("ENERGY_API_KEY") {
            cfg.api.api_key = key;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Collects every problem before failing so an operator sees them all at
    /// once.
    pub fn validate(&self) -> Result<(), IngestError> {
        let mut problems: Vec<String> = Vec::new();

        if self.api.api_key.trim().is_empty() {
            problems.push("api.api_key is empty (set it in the file or via ENERGY_API_KEY)".to_string());
        }
        if self.api.account_number.trim().is_empty() {
            problems.push("api.account_number is empty".to_string());
        }
        if self.api.base_url.trim().is_empty() {
            problems.push("api.base_url is empty".to_string());
        }
        if !(0.0..=1.0).contains(&self.api.retry.jitter_pct) {
            problems.push("api.retry.jitter_pct must be within [0, 1]".to_string());
        }
        if self.api.rate_limit.requests_per_second <= 0.0 {
            problems.push("api.rate_limit.requests_per_second must be positive".to_string());
        }
        if self.ingest.bootstrap_lookback_days <= 0 {
            problems.push("ingest.bootstrap_lookback_days must be positive".to_string());
        }
        if self.ingest.safety_lag_minutes < 0 {
            problems.push("ingest.safety_lag_minutes must not be negative".to_string());
        }
        if self.ingest.granularity_minutes <= 0 {
            problems.push("ingest.granularity_minutes must be positive".to_string());
        }
        if self.ingest.concurrency == 0 {
            problems.push("ingest.concurrency must be at least 1".to_string());
        }

        let mut seen: HashSet<String> = HashSet::new();
        for meter in &self.meters {
            if meter.mpan_mprn.trim().is_empty() || meter.serial.trim().is_empty() {
                problems.push(format!(
                    "meter '{}' has an empty mpan_mprn or serial",
                    meter.state_key()
                ));
            }
            if !seen.insert(meter.state_key()) {
                problems.push(format!(
                    "duplicate meter configuration for '{}'",
                    meter.state_key()
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(IngestError::Config(problems.join("; ")))
        }
    }
}
