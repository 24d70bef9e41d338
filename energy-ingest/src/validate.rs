use std::collections::HashSet;

use energy_domain::IntervalRecord;
use time::{Duration, OffsetDateTime};

/// Cleaned interval sequence for one meter, plus what was discarded.
#[derive(Debug)]
pub struct ValidatedIntervals {
    /// Sorted by `(interval_start, interval_end)`, duplicate-free.
    pub records: Vec<IntervalRecord>,
    pub duplicates: usize,
    pub malformed: usize,
}

/// Deduplicates raw intervals keyed by `(interval_start, interval_end)`.
///
/// First occurrence wins; records whose end does not follow their start are
/// dropped and counted. The survivors come back sorted.
pub fn dedup_intervals(raw: Vec<IntervalRecord>) -> ValidatedIntervals {
    let mut seen: HashSet<(OffsetDateTime, OffsetDateTime)> = HashSet::with_capacity(raw.len());
    let mut records = Vec::with_capacity(raw.len());
    let mut duplicates = 0;
    let mut malformed = 0;

    for record in raw {
        if !record.is_well_formed() {
            malformed += 1;
            continue;
        }
        if seen.insert((record.interval_start, record.interval_end)) {
            records.push(record);
        } else {
            duplicates += 1;
        }
    }

    records.sort_by(|a, b| {
        a.interval_start
            .cmp(&b.interval_start)
            .then(a.interval_end.cmp(&b.interval_end))
    });

    ValidatedIntervals {
        records,
        duplicates,
        malformed,
    }
}

/// Expected interval slots with no record, spanning
/// `[min(interval_start), max(interval_end))` at the given granularity.
///
/// A quality signal only; gaps never block writing.
pub fn missing_slots(records: &[IntervalRecord], granularity: Duration) -> Vec<OffsetDateTime> {
    if records.is_empty() || granularity.is_zero() || granularity.is_negative() {
        return Vec::new();
    }
    let span_start = match records.iter().map(|r| r.interval_start).min() {
        Some(start) => start,
        None => return Vec::new(),
    };
    let span_end = match records.iter().map(|r| r.interval_end).max() {
        Some(end) => end,
        None => return Vec::new(),
    };
    let present: HashSet<OffsetDateTime> = records.iter().map(|r| r.interval_start).collect();

    let mut missing = Vec::new();
    let mut slot = span_start;
    while slot < span_end {
        if !present.contains(&slot) {
            missing.push(slot);
        }
        slot += granularity;
    }
    missing
}
