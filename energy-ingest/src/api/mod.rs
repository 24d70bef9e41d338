pub mod http;
pub mod retry;

use std::pin::Pin;

use energy_domain::{IntervalRecord, Meter, MeterKind, RateRecord};
use futures::Stream;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::IngestError;
use crate::plan::FetchWindow;

pub use http::HttpMeteringApi;
pub use retry::{RateLimiter, RetryPolicy};

pub type IntervalStream =
    Pin<Box<dyn Stream<Item = Result<IntervalRecord, IngestError>> + Send>>;

/// Narrow seam to the upstream metering/tariff API.
///
/// `fetch_intervals` is lazy and transparently paginated; callers see one
/// finite stream per window and can restart it by calling again.
#[async_trait::async_trait]
pub trait MeteringApi: Send + Sync {
    async fn fetch_intervals(&self, meter: &Meter, window: FetchWindow) -> IntervalStream;

    async fn fetch_rates(
        &self,
        product_code: &str,
        tariff_code: &str,
        kind: MeterKind,
        window: FetchWindow,
    ) -> Result<Vec<RateRecord>, IngestError>;

    async fn fetch_account(&self) -> Result<Account, IngestError>;
}

/// One page of a paginated listing endpoint.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Page<T> {
    #[serde(default)]
    pub results: Vec<T>,
    #[serde(default)]
    pub next: Option<String>,
}

/// Account payload subset used for tariff auto-discovery.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub electricity_meter_points: Vec<MeterPoint>,
    #[serde(default)]
    pub gas_meter_points: Vec<MeterPoint>,
}

impl Account {
    pub fn meter_points(&self, kind: MeterKind) -> &[MeterPoint] {
        match kind {
            MeterKind::Electricity => &self.electricity_meter_points,
            MeterKind::Gas => &self.gas_meter_points,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeterPoint {
    #[serde(default)]
    pub agreements: Vec<Agreement>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Agreement {
    #[serde(default)]
    pub tariff_code: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_to: Option<OffsetDateTime>,
}
