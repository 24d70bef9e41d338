use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{ArrayRef, Float64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use energy_domain::{IntervalRecord, Meter, MeterKind, RateRecord};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use time::{Date, OffsetDateTime, UtcOffset};

use crate::enrich::CostedInterval;
use crate::error::IngestError;
use crate::sinks::blob::BlobStore;

pub fn consumption_partition_path(meter: &Meter, date: Date) -> String {
    format!(
        "consumption/kind={}/mpan_mprn={}/serial={}/date={}/data.parquet",
        meter.kind, meter.mpan_mprn, meter.serial, date
    )
}

pub fn cost_partition_path(meter: &Meter, date: Date) -> String {
    format!(
        "consumption_cost/kind={}/mpan_mprn={}/serial={}/date={}/data.parquet",
        meter.kind, meter.mpan_mprn, meter.serial, date
    )
}

pub fn rates_partition_path(
    kind: MeterKind,
    product_code: &str,
    tariff_code: &str,
    date: Date,
) -> String {
    format!("rates/kind={kind}/product={product_code}/tariff={tariff_code}/date={date}/data.parquet")
}

/// Idempotent writer of columnar partitions.
///
/// A partition is replaced wholesale on every write, so its content is a
/// pure function of the records supplied for that date, not of write
/// history. Failed puts retry with linear backoff before aborting the
/// meter's run.
pub struct PartitionWriter<B> {
    store: Arc<B>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl<B: BlobStore> PartitionWriter<B> {
    pub fn new(store: Arc<B>, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            store,
            max_retries,
            retry_backoff,
        }
    }

    /// Writes raw consumption partitions, one per UTC date of
    /// `interval_end`. Returns the row count written.
    pub async fn write_consumption(
        &self,
        meter: &Meter,
        records: &[IntervalRecord],
    ) -> Result<usize, IngestError> {
        let mut by_date: BTreeMap<Date, Vec<&IntervalRecord>> = BTreeMap::new();
        for record in records {
            by_date
                .entry(utc_date(record.interval_end))
                .or_default()
                .push(record);
        }
        let mut written = 0;
        for (date, rows) in by_date {
            let path = consumption_partition_path(meter, date);
            let bytes = encode_consumption(meter, &rows)?;
            self.put_with_retry(&path, &bytes).await?;
            metrics::counter!("consumption_rows_written_total").increment(rows.len() as u64);
            written += rows.len();
        }
        Ok(written)
    }

    /// Writes costed partitions mirroring the raw layout with `unit_rate`
    /// and `cost` columns added.
    pub async fn write_costed(
        &self,
        meter: &Meter,
        rows: &[CostedInterval],
    ) -> Result<usize, IngestError> {
        let mut by_date: BTreeMap<Date, Vec<&CostedInterval>> = BTreeMap::new();
        for row in rows {
            by_date
                .entry(utc_date(row.interval.interval_end))
                .or_default()
                .push(row);
        }
        let mut written = 0;
        for (date, rows) in by_date {
            let path = cost_partition_path(meter, date);
            let bytes = encode_costed(meter, &rows)?;
            self.put_with_retry(&path, &bytes).await?;
            metrics::counter!("cost_rows_written_total").increment(rows.len() as u64);
            written += rows.len();
        }
        Ok(written)
    }

    /// Writes rate partitions keyed by the UTC date of `valid_from`.
    pub async fn write_rates(&self, rates: &[RateRecord]) -> Result<usize, IngestError> {
        let mut by_date: BTreeMap<Date, Vec<&RateRecord>> = BTreeMap::new();
        for rate in rates {
            by_date
                .entry(utc_date(rate.valid_from))
                .or_default()
                .push(rate);
        }
        let mut written = 0;
        for (date, rows) in by_date {
            // All rows in one partition share the triple by construction;
            // take the key columns from the first.
            let first = rows[0];
            let path = rates_partition_path(first.kind, &first.product_code, &first.tariff_code, date);
            let bytes = encode_rates(&rows)?;
            self.put_with_retry(&path, &bytes).await?;
            written += rows.len();
        }
        Ok(written)
    }

    async fn put_with_retry(&self, path: &str, bytes: &[u8]) -> Result<(), IngestError> {
        let mut attempt: u32 = 0;
        loop {
            match self.store.put(path, bytes).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        path,
                        "partition write failed, retrying with backoff"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, path, "partition write failed, giving up");
                    metrics::counter!("partition_write_errors_total").increment(1);
                    return Err(IngestError::Write(e.to_string()));
                }
            }
        }
    }
}

fn utc_date(ts: OffsetDateTime) -> Date {
    ts.to_offset(UtcOffset::UTC).date()
}

fn micros(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000) as i64
}

fn timestamp_field(name: &str, nullable: bool) -> Field {
    Field::new(
        name,
        DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        nullable,
    )
}

fn consumption_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        timestamp_field("interval_start", false),
        timestamp_field("interval_end", false),
        Field::new("consumption", DataType::Float64, false),
        Field::new("unit", DataType::Utf8, true),
        Field::new("kind", DataType::Utf8, false),
        Field::new("mpan_mprn", DataType::Utf8, false),
        Field::new("serial", DataType::Utf8, false),
    ]))
}

fn costed_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        timestamp_field("interval_start", false),
        timestamp_field("interval_end", false),
        Field::new("consumption", DataType::Float64, false),
        Field::new("unit", DataType::Utf8, true),
        Field::new("kind", DataType::Utf8, false),
        Field::new("mpan_mprn", DataType::Utf8, false),
        Field::new("serial", DataType::Utf8, false),
        Field::new("unit_rate", DataType::Float64, true),
        Field::new("cost", DataType::Float64, true),
    ]))
}

fn rates_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        timestamp_field("valid_from", false),
        timestamp_field("valid_to", true),
        Field::new("value_inc_vat", DataType::Float64, true),
        Field::new("value_ex_vat", DataType::Float64, false),
        Field::new("product_code", DataType::Utf8, false),
        Field::new("tariff_code", DataType::Utf8, false),
        Field::new("kind", DataType::Utf8, false),
    ]))
}

fn meter_identity_columns(meter: &Meter, len: usize) -> Vec<ArrayRef> {
    vec![
        Arc::new(StringArray::from_iter_values(
            std::iter::repeat(meter.kind.to_string()).take(len),
        )),
        Arc::new(StringArray::from_iter_values(
            std::iter::repeat(meter.mpan_mprn.clone()).take(len),
        )),
        Arc::new(StringArray::from_iter_values(
            std::iter::repeat(meter.serial.clone()).take(len),
        )),
    ]
}

fn encode_consumption(meter: &Meter, rows: &[&IntervalRecord]) -> Result<Vec<u8>, IngestError> {
    let starts = TimestampMicrosecondArray::from(
        rows.iter().map(|r| micros(r.interval_start)).collect::<Vec<_>>(),
    )
    .with_timezone("UTC");
    let ends = TimestampMicrosecondArray::from(
        rows.iter().map(|r| micros(r.interval_end)).collect::<Vec<_>>(),
    )
    .with_timezone("UTC");
    let consumption =
        Float64Array::from(rows.iter().map(|r| r.consumption).collect::<Vec<_>>());
    let unit: StringArray = rows.iter().map(|r| r.unit.as_deref()).collect();

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(starts),
        Arc::new(ends),
        Arc::new(consumption),
        Arc::new(unit),
    ];
    columns.extend(meter_identity_columns(meter, rows.len()));
    encode_batch(consumption_schema(), columns)
}

fn encode_costed(meter: &Meter, rows: &[&CostedInterval]) -> Result<Vec<u8>, IngestError> {
    let starts = TimestampMicrosecondArray::from(
        rows.iter()
            .map(|r| micros(r.interval.interval_start))
            .collect::<Vec<_>>(),
    )
    .with_timezone("UTC");
    let ends = TimestampMicrosecondArray::from(
        rows.iter()
            .map(|r| micros(r.interval.interval_end))
            .collect::<Vec<_>>(),
    )
    .with_timezone("UTC");
    let consumption =
        Float64Array::from(rows.iter().map(|r| r.interval.consumption).collect::<Vec<_>>());
    let unit: StringArray = rows.iter().map(|r| r.interval.unit.as_deref()).collect();
    let unit_rate = Float64Array::from(rows.iter().map(|r| r.unit_rate).collect::<Vec<_>>());
    let cost = Float64Array::from(rows.iter().map(|r| r.cost).collect::<Vec<_>>());

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(starts),
        Arc::new(ends),
        Arc::new(consumption),
        Arc::new(unit),
    ];
    columns.extend(meter_identity_columns(meter, rows.len()));
    columns.push(Arc::new(unit_rate));
    columns.push(Arc::new(cost));
    encode_batch(costed_schema(), columns)
}

fn encode_rates(rows: &[&RateRecord]) -> Result<Vec<u8>, IngestError> {
    let valid_from = TimestampMicrosecondArray::from(
        rows.iter().map(|r| micros(r.valid_from)).collect::<Vec<_>>(),
    )
    .with_timezone("UTC");
    let valid_to = TimestampMicrosecondArray::from(
        rows.iter()
            .map(|r| r.valid_to.map(micros))
            .collect::<Vec<_>>(),
    )
    .with_timezone("UTC");
    let inc_vat = Float64Array::from(rows.iter().map(|r| r.value_inc_vat).collect::<Vec<_>>());
    let ex_vat = Float64Array::from(rows.iter().map(|r| r.value_ex_vat).collect::<Vec<_>>());
    let product: StringArray =
        StringArray::from_iter_values(rows.iter().map(|r| r.product_code.as_str()));
    let tariff: StringArray =
        StringArray::from_iter_values(rows.iter().map(|r| r.tariff_code.as_str()));
    let kind: StringArray =
        StringArray::from_iter_values(rows.iter().map(|r| r.kind.to_string()));

    encode_batch(
        rates_schema(),
        vec![
            Arc::new(valid_from),
            Arc::new(valid_to),
            Arc::new(inc_vat),
            Arc::new(ex_vat),
            Arc::new(product),
            Arc::new(tariff),
            Arc::new(kind),
        ],
    )
}

fn encode_batch(schema: SchemaRef, columns: Vec<ArrayRef>) -> Result<Vec<u8>, IngestError> {
    let batch = RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| IngestError::Write(format!("failed to build record batch: {e}")))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, Some(props))
        .map_err(|e| IngestError::Write(format!("failed to open parquet writer: {e}")))?;
    writer
        .write(&batch)
        .map_err(|e| IngestError::Write(format!("failed to write record batch: {e}")))?;
    writer
        .close()
        .map_err(|e| IngestError::Write(format!("failed to finish parquet file: {e}")))?;
    Ok(buf)
}
