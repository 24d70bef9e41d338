use time::{Duration, OffsetDateTime};

/// Half-open `[start, end)` fetch horizon for one meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

#[derive(Debug, Clone, Copy)]
pub struct PlanOptions {
    /// How far behind "now" the upstream data is assumed complete.
    pub safety_lag: Duration,
    /// History pulled for a meter with no bookmark.
    pub bootstrap_lookback: Duration,
    /// Interval granularity the window end is floored to.
    pub granularity: Duration,
}

/// Computes the fetch window for one meter.
///
/// `end` is now minus the safety lag, floored to the last fully completed
/// interval boundary. `start` resumes from the bookmark when present,
/// otherwise reaches back by the bootstrap lookback. An empty window means
/// the meter is up to date and is skipped for this run.
pub fn plan(
    bookmark: Option<OffsetDateTime>,
    now: OffsetDateTime,
    opts: &PlanOptions,
) -> Option<FetchWindow> {
    let end = floor_to_granularity(now - opts.safety_lag, opts.granularity);
    let start = bookmark.unwrap_or(now - opts.bootstrap_lookback);
    if start >= end {
        None
    } else {
        Some(FetchWindow { start, end })
    }
}

fn floor_to_granularity(ts: OffsetDateTime, granularity: Duration) -> OffsetDateTime {
    let step = granularity.whole_seconds().max(1);
    let rem = ts.unix_timestamp().rem_euclid(step);
    ts - Duration::seconds(rem) - Duration::nanoseconds(i64::from(ts.nanosecond()))
}
