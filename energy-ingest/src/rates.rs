use energy_domain::{MeterKind, RateRecord};

use crate::api::MeteringApi;
use crate::error::IngestError;
use crate::plan::FetchWindow;
use crate::sinks::blob::BlobStore;
use crate::sinks::parquet::PartitionWriter;

/// Sorts by `(valid_from, valid_to)` and collapses duplicate validity
/// windows, first occurrence winning.
pub fn dedup_rates(mut rates: Vec<RateRecord>) -> Vec<RateRecord> {
    rates.sort_by(|a, b| {
        a.valid_from
            .cmp(&b.valid_from)
            .then(a.valid_to.cmp(&b.valid_to))
    });
    rates.dedup_by(|next, kept| {
        next.valid_from == kept.valid_from && next.valid_to == kept.valid_to
    });
    rates
}

/// Fetches rate records overlapping the window, persists them to the rates
/// partition layout, and returns the cleaned set for joining.
///
/// Rate partitions accumulate across runs; this engine never deletes them.
pub async fn fetch_and_store<A, B>(
    api: &A,
    writer: &PartitionWriter<B>,
    product_code: &str,
    tariff_code: &str,
    kind: MeterKind,
    window: FetchWindow,
) -> Result<Vec<RateRecord>, IngestError>
where
    A: MeteringApi + ?Sized,
    B: BlobStore,
{
    let fetched = api
        .fetch_rates(product_code, tariff_code, kind, window)
        .await?;
    let rates = dedup_rates(fetched);
    if !rates.is_empty() {
        writer.write_rates(&rates).await?;
    }
    tracing::debug!(
        product_code,
        tariff_code,
        count = rates.len(),
        "rates fetched and persisted"
    );
    Ok(rates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::OffsetDateTime;

    fn rate(valid_from: OffsetDateTime, valid_to: Option<OffsetDateTime>, price: f64) -> RateRecord {
        RateRecord {
            product_code: "AGILE-24-09-01".to_string(),
            tariff_code: "E-1R-AGILE-24-09-01-A".to_string(),
            kind: MeterKind::Electricity,
            valid_from,
            valid_to,
            value_inc_vat: Some(price),
            value_ex_vat: price,
        }
    }

    #[test]
    fn duplicate_validity_windows_collapse() {
        let a = rate(
            datetime!(2024-01-01 00:00 UTC),
            Some(datetime!(2024-01-01 12:00 UTC)),
            0.30,
        );
        let mut b = a.clone();
        b.value_inc_vat = Some(0.99);
        let out = dedup_rates(vec![a, b]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value_inc_vat, Some(0.30));
    }

    #[test]
    fn output_is_sorted_by_valid_from() {
        let later = rate(datetime!(2024-02-01 00:00 UTC), None, 0.28);
        let earlier = rate(
            datetime!(2024-01-01 00:00 UTC),
            Some(datetime!(2024-02-01 00:00 UTC)),
            0.30,
        );
        let out = dedup_rates(vec![later, earlier]);
        assert_eq!(out[0].valid_from, datetime!(2024-01-01 00:00 UTC));
        assert_eq!(out[1].valid_from, datetime!(2024-02-01 00:00 UTC));
    }
}
