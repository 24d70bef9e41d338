use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use energy_domain::Meter;
use futures::{stream, StreamExt};
use time::{Duration, OffsetDateTime};
use tokio::time::Instant;

use crate::api::MeteringApi;
use crate::config::{AppConfig, TariffConfig};
use crate::enrich::{join_costs, RateTable};
use crate::error::IngestError;
use crate::plan::{plan, FetchWindow, PlanOptions};
use crate::rates;
use crate::sinks::blob::BlobStore;
use crate::sinks::parquet::PartitionWriter;
use crate::state::StateStore;
use crate::tariff;
use crate::validate::{dedup_intervals, missing_slots};

/// Pipeline stage a meter was in when it failed. Stages before
/// `CommitState` leave the bookmark untouched, so the meter is safe to
/// retry next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Planned,
    Fetching,
    Validating,
    WritingRaw,
    ResolvingTariff,
    JoiningRates,
    WritingCost,
    CommitState,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Planned => "planned",
            Stage::Fetching => "fetching",
            Stage::Validating => "validating",
            Stage::WritingRaw => "writing_raw",
            Stage::ResolvingTariff => "resolving_tariff",
            Stage::JoiningRates => "joining_rates",
            Stage::WritingCost => "writing_cost",
            Stage::CommitState => "commit_state",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum MeterOutcome {
    Succeeded {
        rows: usize,
        missing_slots: usize,
        unmatched_rates: usize,
        cost_rows: Option<usize>,
        /// Reason the cost branch was skipped, when it was.
        cost_skipped: Option<String>,
        /// Bookmark committed this run; `None` when the window held no data.
        bookmark: Option<OffsetDateTime>,
    },
    Skipped {
        reason: String,
    },
    Failed {
        stage: Stage,
        error: IngestError,
    },
}

#[derive(Debug)]
pub struct MeterReport {
    pub meter: Meter,
    pub outcome: MeterOutcome,
}

/// Structured per-run result: succeeded / skipped / failed meters with
/// reasons.
#[derive(Debug)]
pub struct RunSummary {
    pub reports: Vec<MeterReport>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, MeterOutcome::Succeeded { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, MeterOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, MeterOutcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&MeterOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.outcome)).count()
    }

    /// True when every meter failed in the storage layer; the one condition
    /// that aborts a whole run.
    fn storage_unavailable(&self) -> bool {
        !self.reports.is_empty()
            && self.reports.iter().all(|r| {
                matches!(&r.outcome, MeterOutcome::Failed { error, .. } if error.is_storage())
            })
    }

    fn log(&self) {
        for report in &self.reports {
            let key = report.meter.state_key();
            match &report.outcome {
                MeterOutcome::Succeeded {
                    rows,
                    missing_slots,
                    unmatched_rates,
                    cost_rows,
                    cost_skipped,
                    bookmark,
                } => {
                    tracing::info!(
                        meter = %key,
                        rows,
                        missing_slots,
                        unmatched_rates,
                        cost_rows = cost_rows.unwrap_or(0),
                        cost_skipped = cost_skipped.as_deref().unwrap_or(""),
                        bookmark = %bookmark.map(|b| b.to_string()).unwrap_or_default(),
                        "meter succeeded"
                    );
                }
                MeterOutcome::Skipped { reason } => {
                    tracing::info!(meter = %key, reason, "meter skipped");
                }
                MeterOutcome::Failed { stage, error } => {
                    tracing::error!(meter = %key, stage = %stage, error = %error, "meter failed");
                }
            }
        }
        metrics::counter!("meters_succeeded_total").increment(self.succeeded() as u64);
        metrics::counter!("meters_skipped_total").increment(self.skipped() as u64);
        metrics::counter!("meters_failed_total").increment(self.failed() as u64);
        tracing::info!(
            succeeded = self.succeeded(),
            skipped = self.skipped(),
            failed = self.failed(),
            "run completed"
        );
    }
}

/// Drives the per-meter pipeline and commits bookmarks.
///
/// Meters are independent: one meter's failure is logged and isolated. The
/// only cross-meter shared state is the API client's rate limiter.
pub struct Orchestrator<A, B> {
    api: Arc<A>,
    writer: PartitionWriter<B>,
    state: StateStore<B>,
    meters: Vec<Meter>,
    tariffs: TariffConfig,
    plan_opts: PlanOptions,
    concurrency: usize,
    run_deadline: Option<StdDuration>,
    enrich_costs: bool,
}

impl<A, B> Orchestrator<A, B>
where
    A: MeteringApi + 'static,
    B: BlobStore + 'static,
{
    pub fn new(api: Arc<A>, store: Arc<B>, cfg: &AppConfig) -> Self {
        let writer = PartitionWriter::new(
            store.clone(),
            cfg.ingest.write_max_retries,
            StdDuration::from_millis(cfg.ingest.write_retry_backoff_ms),
        );
        let state = StateStore::new(store);
        Self {
            api,
            writer,
            state,
            meters: cfg.meters.clone(),
            tariffs: cfg.tariffs.clone(),
            plan_opts: PlanOptions {
                safety_lag: Duration::minutes(cfg.ingest.safety_lag_minutes),
                bootstrap_lookback: Duration::days(cfg.ingest.bootstrap_lookback_days),
                granularity: Duration::minutes(cfg.ingest.granularity_minutes),
            },
            concurrency: cfg.ingest.concurrency.max(1),
            run_deadline: cfg.ingest.run_deadline_secs.map(StdDuration::from_secs),
            enrich_costs: cfg.ingest.enrich_costs,
        }
    }

    /// One scheduled incremental run across all configured meters.
    pub async fn run(&self) -> Result<RunSummary, IngestError> {
        self.run_at(OffsetDateTime::now_utc()).await
    }

    pub async fn run_at(&self, now: OffsetDateTime) -> Result<RunSummary, IngestError> {
        self.execute(now, None).await
    }

    /// Backfill of an explicit window, bypassing planned bookmarks but
    /// writing through the same idempotent partitions. Bookmarks still only
    /// move forward.
    pub async fn run_window(&self, window: FetchWindow) -> Result<RunSummary, IngestError> {
        self.execute(OffsetDateTime::now_utc(), Some(window)).await
    }

    async fn execute(
        &self,
        now: OffsetDateTime,
        window_override: Option<FetchWindow>,
    ) -> Result<RunSummary, IngestError> {
        let bookmarks = self.state.load().await;
        let deadline = self.run_deadline.map(|d| Instant::now() + d);

        let reports: Vec<MeterReport> = stream::iter(self.meters.clone())
            .map(|meter| {
                let bookmark = bookmarks.get(&meter.state_key()).copied();
                async move {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return MeterReport {
                                meter,
                                outcome: MeterOutcome::Skipped {
                                    reason: "run deadline reached before start".to_string(),
                                },
                            };
                        }
                    }
                    let outcome = match self
                        .process_meter(&meter, bookmark, now, window_override)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err((stage, error)) => MeterOutcome::Failed { stage, error },
                    };
                    MeterReport { meter, outcome }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let summary = RunSummary { reports };
        summary.log();
        if summary.storage_unavailable() {
            return Err(IngestError::Write(
                "storage unavailable: every meter failed in the storage layer".to_string(),
            ));
        }
        Ok(summary)
    }

    async fn process_meter(
        &self,
        meter: &Meter,
        bookmark: Option<OffsetDateTime>,
        now: OffsetDateTime,
        window_override: Option<FetchWindow>,
    ) -> Result<MeterOutcome, (Stage, IngestError)> {
        let window = match window_override.or_else(|| plan(bookmark, now, &self.plan_opts)) {
            Some(window) => window,
            None => {
                return Ok(MeterOutcome::Skipped {
                    reason: "bookmark already at the fetch horizon".to_string(),
                })
            }
        };
        tracing::info!(
            meter = %meter.state_key(),
            start = %window.start,
            end = %window.end,
            "fetch window planned"
        );

        let mut interval_stream = self.api.fetch_intervals(meter, window).await;
        let mut raw = Vec::new();
        while let Some(item) = interval_stream.next().await {
            raw.push(item.map_err(|e| (Stage::Fetching, e))?);
        }

        let validated = dedup_intervals(raw);
        if validated.duplicates > 0 || validated.malformed > 0 {
            tracing::warn!(
                meter = %meter.state_key(),
                duplicates = validated.duplicates,
                malformed = validated.malformed,
                "discarded raw intervals"
            );
        }
        if validated.records.is_empty() {
            tracing::info!(meter = %meter.state_key(), "no new consumption data");
            return Ok(MeterOutcome::Succeeded {
                rows: 0,
                missing_slots: 0,
                unmatched_rates: 0,
                cost_rows: None,
                cost_skipped: None,
                bookmark: None,
            });
        }

        let missing = missing_slots(&validated.records, self.plan_opts.granularity);
        if !missing.is_empty() {
            metrics::counter!("missing_interval_slots_total").increment(missing.len() as u64);
            tracing::warn!(
                meter = %meter.state_key(),
                missing = missing.len(),
                first = %missing[0],
                "gaps in interval coverage"
            );
        }

        let rows = self
            .writer
            .write_consumption(meter, &validated.records)
            .await
            .map_err(|e| (Stage::WritingRaw, e))?;

        let mut unmatched_rates = 0;
        let mut cost_rows = None;
        let mut cost_skipped = None;
        if self.enrich_costs {
            match self.enrich_meter(meter, &validated.records, window, now).await {
                Ok((written, unmatched)) => {
                    cost_rows = Some(written);
                    unmatched_rates = unmatched;
                }
                // The cost branch never blocks committing the raw path.
                Err((stage, error)) => {
                    metrics::counter!("cost_enrichment_skipped_total").increment(1);
                    tracing::warn!(
                        meter = %meter.state_key(),
                        stage = %stage,
                        error = %error,
                        "cost enrichment skipped"
                    );
                    cost_skipped = Some(format!("{stage}: {error}"));
                }
            }
        }

        let max_end = validated
            .records
            .iter()
            .map(|r| r.interval_end)
            .max()
            .ok_or_else(|| {
                (
                    Stage::CommitState,
                    IngestError::State("no interval to commit".to_string()),
                )
            })?;
        self.state
            .commit(&meter.state_key(), max_end)
            .await
            .map_err(|e| (Stage::CommitState, e))?;

        Ok(MeterOutcome::Succeeded {
            rows,
            missing_slots: missing.len(),
            unmatched_rates,
            cost_rows,
            cost_skipped,
            bookmark: Some(max_end),
        })
    }

    async fn enrich_meter(
        &self,
        meter: &Meter,
        records: &[energy_domain::IntervalRecord],
        window: FetchWindow,
        now: OffsetDateTime,
    ) -> Result<(usize, usize), (Stage, IngestError)> {
        let resolved = tariff::resolve(self.api.as_ref(), meter, &self.tariffs, now)
            .await
            .map_err(|e| (Stage::ResolvingTariff, e))?;

        let rate_set = rates::fetch_and_store(
            self.api.as_ref(),
            &self.writer,
            &resolved.product_code,
            &resolved.tariff_code,
            meter.kind,
            window,
        )
        .await
        .map_err(|e| (Stage::JoiningRates, e))?;

        let table = RateTable::new(rate_set);
        let result = join_costs(records, &table);
        if result.unmatched > 0 {
            metrics::counter!("unmatched_rate_intervals_total").increment(result.unmatched as u64);
            tracing::warn!(
                meter = %meter.state_key(),
                unmatched = result.unmatched,
                "intervals with no applicable rate"
            );
        }

        let written = self
            .writer
            .write_costed(meter, &result.rows)
            .await
            .map_err(|e| (Stage::WritingCost, e))?;
        Ok((written, result.unmatched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use energy_domain::MeterKind;

    fn meter(id: &str) -> Meter {
        Meter {
            kind: MeterKind::Electricity,
            mpan_mprn: id.to_string(),
            serial: "S".to_string(),
            tariff_code: None,
        }
    }

    fn failed(error: IngestError) -> MeterOutcome {
        MeterOutcome::Failed {
            stage: Stage::WritingRaw,
            error,
        }
    }

    #[test]
    fn storage_unavailable_requires_every_meter_failing_on_storage() {
        let all_write_failures = RunSummary {
            reports: vec![
                MeterReport {
                    meter: meter("1"),
                    outcome: failed(IngestError::Write("disk".to_string())),
                },
                MeterReport {
                    meter: meter("2"),
                    outcome: failed(IngestError::Write("disk".to_string())),
                },
            ],
        };
        assert!(all_write_failures.storage_unavailable());

        let mixed = RunSummary {
            reports: vec![
                MeterReport {
                    meter: meter("1"),
                    outcome: failed(IngestError::Write("disk".to_string())),
                },
                MeterReport {
                    meter: meter("2"),
                    outcome: failed(IngestError::Fetch("net".to_string())),
                },
            ],
        };
        assert!(!mixed.storage_unavailable());

        let empty = RunSummary { reports: vec![] };
        assert!(!empty.storage_unavailable());
    }

    #[test]
    fn stage_names_are_snake_case() {
        assert_eq!(Stage::WritingRaw.to_string(), "writing_raw");
        assert_eq!(Stage::CommitState.to_string(), "commit_state");
    }
}
