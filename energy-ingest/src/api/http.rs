use std::sync::Arc;
use std::time::Duration;

use energy_domain::{IntervalRecord, Meter, MeterKind, RateRecord};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

use crate::api::retry::{RateLimiter, RetryPolicy};
use crate::api::{Account, IntervalStream, MeteringApi, Page};
use crate::config::ApiConfig;
use crate::error::IngestError;
use crate::plan::FetchWindow;

const PAGE_SIZE: u32 = 250;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Paginated, retrying access to the upstream metering/tariff API.
///
/// Transient failures (network, 5xx, timeouts) retry on the jittered
/// schedule; 429 sleeps for the signaled `Retry-After` instead; 401/403 and
/// other 4xx fail immediately and are fatal for the meter being processed.
#[derive(Clone)]
pub struct HttpMeteringApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    account_number: String,
    retry: RetryPolicy,
    limiter: Arc<RateLimiter>,
}

impl HttpMeteringApi {
    pub fn new(cfg: &ApiConfig, limiter: Arc<RateLimiter>) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| IngestError::Fetch(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            account_number: cfg.account_number.clone(),
            retry: RetryPolicy::from(&cfg.retry),
            limiter,
        })
    }

    fn consumption_path(&self, meter: &Meter) -> String {
        match meter.kind {
            MeterKind::Electricity => format!(
                "/electricity-meter-points/{}/meters/{}/consumption/",
                meter.mpan_mprn, meter.serial
            ),
            MeterKind::Gas => format!(
                "/gas-meter-points/{}/meters/{}/consumption/",
                meter.mpan_mprn, meter.serial
            ),
        }
    }

    fn rates_path(&self, product_code: &str, tariff_code: &str, kind: MeterKind) -> String {
        match kind {
            MeterKind::Electricity => format!(
                "/products/{product_code}/electricity-tariffs/{tariff_code}/standard-unit-rates/"
            ),
            MeterKind::Gas => {
                format!("/products/{product_code}/gas-tariffs/{tariff_code}/standard-unit-rates/")
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, IngestError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt: u32 = 0;
        loop {
            self.limiter.acquire().await;
            // (message, upstream-signaled delay) for transient outcomes only.
            let (message, signaled_delay) = match self
                .client
                .get(&url)
                .basic_auth(&self.api_key, Some(""))
                .query(params)
                .send()
                .await
            {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.json::<T>().await {
                            Ok(value) => return Ok(value),
                            Err(e) => {
                                return Err(IngestError::Fetch(format!(
                                    "invalid JSON from {url}: {e}"
                                )))
                            }
                        }
                    } else if status == StatusCode::TOO_MANY_REQUESTS {
                        metrics::counter!("api_rate_limited_total").increment(1);
                        (format!("rate limited ({status}) by {url}"), retry_after(&resp))
                    } else if status.is_server_error() {
                        (format!("upstream {status} for {url}"), None)
                    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
                    {
                        return Err(IngestError::Auth(format!("{status} for {url}")));
                    } else {
                        return Err(IngestError::Fetch(format!("unexpected {status} for {url}")));
                    }
                }
                Err(e) => (format!("request to {url} failed: {e}"), None),
            };

            attempt += 1;
            if attempt >= self.retry.max_attempts() {
                metrics::counter!("api_fetch_exhausted_total").increment(1);
                return Err(IngestError::Fetch(format!(
                    "{message} (gave up after {attempt} attempts)"
                )));
            }
            let delay = signaled_delay.unwrap_or_else(|| self.retry.next_delay(attempt - 1));
            tracing::warn!(
                error = %message,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "transient fetch failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait::async_trait]
impl MeteringApi for HttpMeteringApi {
    async fn fetch_intervals(&self, meter: &Meter, window: FetchWindow) -> IntervalStream {
        let api = self.clone();
        let path = self.consumption_path(meter);
        let s = async_stream::try_stream! {
            let period_from = fmt_utc(window.start)?;
            let period_to = fmt_utc(window.end)?;
            let mut page: u32 = 1;
            loop {
                let params = [
                    ("period_from", period_from.clone()),
                    ("period_to", period_to.clone()),
                    ("order_by", "period".to_string()),
                    ("page_size", PAGE_SIZE.to_string()),
                    ("page", page.to_string()),
                ];
                let data: Page<IntervalRecord> = api.get_json(&path, &params).await?;
                let last_page = data.next.is_none();
                for record in data.results {
                    yield record;
                }
                if last_page {
                    break;
                }
                page += 1;
            }
        };
        Box::pin(s)
    }

    async fn fetch_rates(
        &self,
        product_code: &str,
        tariff_code: &str,
        kind: MeterKind,
        window: FetchWindow,
    ) -> Result<Vec<RateRecord>, IngestError> {
        let path = self.rates_path(product_code, tariff_code, kind);
        let period_from = fmt_utc(window.start)?;
        let period_to = fmt_utc(window.end)?;
        let mut rates = Vec::new();
        let mut page: u32 = 1;
        loop {
            let params = [
                ("period_from", period_from.clone()),
                ("period_to", period_to.clone()),
                ("order_by", "period".to_string()),
                ("page_size", PAGE_SIZE.to_string()),
                ("page", page.to_string()),
            ];
            let data: Page<WireRate> = self.get_json(&path, &params).await?;
            let last_page = data.next.is_none();
            rates.extend(data.results.into_iter().map(|wire| RateRecord {
                product_code: product_code.to_string(),
                tariff_code: tariff_code.to_string(),
                kind,
                valid_from: wire.valid_from,
                valid_to: wire.valid_to,
                value_inc_vat: wire.value_inc_vat,
                value_ex_vat: wire.value_ex_vat,
            }));
            if last_page {
                break;
            }
            page += 1;
        }
        Ok(rates)
    }

    async fn fetch_account(&self) -> Result<Account, IngestError> {
        let path = format!("/accounts/{}/", self.account_number);
        self.get_json(&path, &[]).await
    }
}

/// Unit-rate record as the API serves it; product/tariff/kind are attached
/// from the request context.
#[derive(Debug, Deserialize)]
struct WireRate {
    #[serde(with = "time::serde::rfc3339")]
    valid_from: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    valid_to: Option<OffsetDateTime>,
    #[serde(default)]
    value_inc_vat: Option<f64>,
    value_ex_vat: f64,
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn fmt_utc(ts: OffsetDateTime) -> Result<String, IngestError> {
    ts.to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|e| IngestError::Fetch(format!("unrepresentable timestamp: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use time::macros::datetime;

    #[derive(Default)]
    struct Upstream {
        hits: AtomicU32,
        fail_first_with: Option<u16>,
    }

    async fn consumption(
        State(upstream): State<Arc<Upstream>>,
        Query(params): Query<HashMap<String, String>>,
    ) -> (axum::http::StatusCode, HeaderMap, Json<serde_json::Value>) {
        let hit = upstream.hits.fetch_add(1, Ordering::SeqCst);
        if hit == 0 {
            if let Some(status) = upstream.fail_first_with {
                let mut headers = HeaderMap::new();
                if status == 429 {
                    headers.insert("retry-after", "0".parse().unwrap());
                }
                return (
                    axum::http::StatusCode::from_u16(status).unwrap(),
                    headers,
                    Json(serde_json::json!({})),
                );
            }
        }
        let page: u32 = params.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
        assert_eq!(params.get("order_by").map(String::as_str), Some("period"));
        let body = match page {
            1 => serde_json::json!({
                "results": [
                    {"interval_start": "2024-01-01T00:00:00Z", "interval_end": "2024-01-01T00:30:00Z", "consumption": 0.5},
                    {"interval_start": "2024-01-01T00:30:00Z", "interval_end": "2024-01-01T01:00:00Z", "consumption": 0.7},
                ],
                "next": "page-2"
            }),
            _ => serde_json::json!({
                "results": [
                    {"interval_start": "2024-01-01T01:00:00Z", "interval_end": "2024-01-01T01:30:00Z", "consumption": 0.2},
                ],
                "next": null
            }),
        };
        (axum::http::StatusCode::OK, HeaderMap::new(), Json(body))
    }

    async fn serve(upstream: Arc<Upstream>) -> SocketAddr {
        let app = Router::new()
            .route(
                "/electricity-meter-points/:mpan/meters/:serial/consumption/",
                get(consumption),
            )
            .with_state(upstream);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        addr
    }

    fn api_for(addr: SocketAddr, max_attempts: u32) -> HttpMeteringApi {
        let cfg = ApiConfig {
            base_url: format!("http://{addr}"),
            api_key: "k".to_string(),
            account_number: "A-1".to_string(),
            retry: crate::config::RetryConfig {
                max_attempts,
                base_delay_ms: 1,
                max_delay_ms: 5,
                jitter_pct: 0.0,
            },
            rate_limit: crate::config::RateLimitConfig::default(),
        };
        HttpMeteringApi::new(&cfg, Arc::new(RateLimiter::new(1000.0, 100))).unwrap()
    }

    fn meter() -> Meter {
        Meter {
            kind: MeterKind::Electricity,
            mpan_mprn: "123".to_string(),
            serial: "ABC".to_string(),
            tariff_code: None,
        }
    }

    fn window() -> FetchWindow {
        FetchWindow {
            start: datetime!(2024-01-01 00:00 UTC),
            end: datetime!(2024-01-02 00:00 UTC),
        }
    }

    #[tokio::test]
    async fn walks_every_page_in_order() {
        let addr = serve(Arc::new(Upstream::default())).await;
        let api = api_for(addr, 3);
        let records: Vec<_> = api
            .fetch_intervals(&meter(), window())
            .await
            .collect::<Vec<_>>()
            .await;
        let records: Vec<IntervalRecord> =
            records.into_iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].interval_start, datetime!(2024-01-01 01:00 UTC));
    }

    #[tokio::test]
    async fn retries_rate_limited_responses() {
        let upstream = Arc::new(Upstream {
            hits: AtomicU32::new(0),
            fail_first_with: Some(429),
        });
        let addr = serve(upstream.clone()).await;
        let api = api_for(addr, 3);
        let records: Vec<_> = api
            .fetch_intervals(&meter(), window())
            .await
            .collect::<Vec<_>>()
            .await;
        assert!(records.iter().all(Result::is_ok));
        assert_eq!(records.len(), 3);
        // first hit 429, then two pages
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_failure_is_immediate_and_fatal() {
        let upstream = Arc::new(Upstream {
            hits: AtomicU32::new(0),
            fail_first_with: Some(401),
        });
        let addr = serve(upstream.clone()).await;
        let api = api_for(addr, 5);
        let first = api
            .fetch_intervals(&meter(), window())
            .await
            .next()
            .await
            .unwrap();
        assert!(matches!(first, Err(IngestError::Auth(_))));
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_exhaust_the_attempt_budget() {
        let upstream = Arc::new(Upstream {
            hits: AtomicU32::new(0),
            fail_first_with: Some(500),
        });
        let addr = serve(upstream).await;
        let api = api_for(addr, 1);
        let first = api
            .fetch_intervals(&meter(), window())
            .await
            .next()
            .await
            .unwrap();
        assert!(matches!(first, Err(IngestError::Fetch(_))));
    }
}
