use energy_domain::{IntervalRecord, RateRecord};
use time::OffsetDateTime;

/// Rates for one `(product, tariff, kind)` triple, sorted once by
/// `valid_from` so each probe is a binary search.
///
/// This is the hot path of a large backfill: O(log R) per interval,
/// O(N log R) overall.
pub struct RateTable {
    rates: Vec<RateRecord>,
}

impl RateTable {
    pub fn new(mut rates: Vec<RateRecord>) -> Self {
        rates.sort_by(|a, b| a.valid_from.cmp(&b.valid_from));
        Self { rates }
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Rate whose `[valid_from, valid_to)` contains `ts`; an open-ended rate
    /// matches from its `valid_from` until superseded by a later one.
    pub fn rate_at(&self, ts: OffsetDateTime) -> Option<&RateRecord> {
        let idx = self.rates.partition_point(|rate| rate.valid_from <= ts);
        if idx == 0 {
            return None;
        }
        let candidate = &self.rates[idx - 1];
        candidate.applies_at(ts).then_some(candidate)
    }
}

/// A consumption interval with its applicable unit rate and cost, when a
/// rate matched.
#[derive(Debug, Clone, PartialEq)]
pub struct CostedInterval {
    pub interval: IntervalRecord,
    pub unit_rate: Option<f64>,
    pub cost: Option<f64>,
}

#[derive(Debug)]
pub struct EnrichmentResult {
    pub rows: Vec<CostedInterval>,
    /// Intervals with no applicable rate; reported, never fatal.
    pub unmatched: usize,
}

/// Joins each interval to the rate containing its `interval_start` and
/// computes `cost = consumption * unit_rate`, VAT-inclusive price preferred.
/// Intervals without a matching rate keep an unset cost.
pub fn join_costs(records: &[IntervalRecord], table: &RateTable) -> EnrichmentResult {
    let mut rows = Vec::with_capacity(records.len());
    let mut unmatched = 0;
    for record in records {
        let matched = table.rate_at(record.interval_start);
        if matched.is_none() {
            unmatched += 1;
        }
        let unit_rate = matched.map(RateRecord::unit_price);
        rows.push(CostedInterval {
            cost: unit_rate.map(|rate| record.consumption * rate),
            unit_rate,
            interval: record.clone(),
        });
    }
    EnrichmentResult { rows, unmatched }
}

#[cfg(test)]
mod tests {
    use super::*;
    use energy_domain::MeterKind;
    use time::macros::datetime;

    fn rate(
        valid_from: OffsetDateTime,
        valid_to: Option<OffsetDateTime>,
        price: f64,
    ) -> RateRecord {
        RateRecord {
            product_code: "AGILE-24-09-01".to_string(),
            tariff_code: "E-1R-AGILE-24-09-01-A".to_string(),
            kind: MeterKind::Electricity,
            valid_from,
            valid_to,
            value_inc_vat: Some(price),
            value_ex_vat: price - 0.02,
        }
    }

    fn interval(start: OffsetDateTime, consumption: f64) -> IntervalRecord {
        IntervalRecord {
            interval_start: start,
            interval_end: start + time::Duration::minutes(30),
            consumption,
            unit: None,
        }
    }

    fn day_rates() -> RateTable {
        RateTable::new(vec![
            rate(
                datetime!(2024-01-01 00:00 UTC),
                Some(datetime!(2024-01-01 12:00 UTC)),
                10.0,
            ),
            rate(datetime!(2024-01-01 12:00 UTC), None, 12.0),
        ])
    }

    #[test]
    fn interval_before_boundary_gets_the_earlier_rate() {
        let table = day_rates();
        let matched = table.rate_at(datetime!(2024-01-01 11:30 UTC)).unwrap();
        assert_eq!(matched.unit_price(), 10.0);
    }

    #[test]
    fn interval_on_boundary_gets_the_later_rate() {
        let table = day_rates();
        let matched = table.rate_at(datetime!(2024-01-01 12:00 UTC)).unwrap();
        assert_eq!(matched.unit_price(), 12.0);
    }

    #[test]
    fn interval_before_all_rates_is_unmatched() {
        let table = day_rates();
        assert!(table.rate_at(datetime!(2023-12-31 23:30 UTC)).is_none());
    }

    #[test]
    fn gap_between_rates_leaves_cost_unset() {
        let table = RateTable::new(vec![rate(
            datetime!(2024-01-01 00:00 UTC),
            Some(datetime!(2024-01-01 00:15 UTC)),
            10.0,
        )]);
        let records = vec![
            interval(datetime!(2024-01-01 00:00 UTC), 0.5),
            interval(datetime!(2024-01-01 00:30 UTC), 0.7),
        ];
        let result = join_costs(&records, &table);
        assert_eq!(result.unmatched, 1);
        assert_eq!(result.rows[0].cost, Some(5.0));
        assert_eq!(result.rows[1].cost, None);
        assert_eq!(result.rows.len(), 2);
    }

    #[test]
    fn costs_multiply_consumption_by_inclusive_rate() {
        let table = RateTable::new(vec![
            rate(
                datetime!(2023-12-31 23:30 UTC),
                Some(datetime!(2024-01-01 00:30 UTC)),
                0.30,
            ),
            rate(datetime!(2024-01-01 00:30 UTC), None, 0.28),
        ]);
        let records = vec![
            interval(datetime!(2024-01-01 00:00 UTC), 0.5),
            interval(datetime!(2024-01-01 00:30 UTC), 0.7),
        ];
        let result = join_costs(&records, &table);
        assert_eq!(result.unmatched, 0);
        let total: f64 = result.rows.iter().filter_map(|r| r.cost).sum();
        assert!((total - (0.5 * 0.30 + 0.7 * 0.28)).abs() < 1e-9);
    }

    #[test]
    fn ex_vat_price_is_used_when_inclusive_is_absent() {
        let mut only_ex = rate(datetime!(2024-01-01 00:00 UTC), None, 0.30);
        only_ex.value_inc_vat = None;
        let table = RateTable::new(vec![only_ex]);
        let records = vec![interval(datetime!(2024-01-01 00:00 UTC), 1.0)];
        let result = join_costs(&records, &table);
        assert!((result.rows[0].cost.unwrap() - 0.28).abs() < 1e-9);
    }
}
