use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One metering reading bounded by explicit start/end timestamps (UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub interval_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub interval_end: OffsetDateTime,
    pub consumption: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

impl IntervalRecord {
    /// A record is well formed when its end strictly follows its start.
    pub fn is_well_formed(&self) -> bool {
        self.interval_end > self.interval_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn zero_length_interval_is_malformed() {
        let rec = IntervalRecord {
            interval_start: datetime!(2024-01-01 00:00 UTC),
            interval_end: datetime!(2024-01-01 00:00 UTC),
            consumption: 0.1,
            unit: None,
        };
        assert!(!rec.is_well_formed());
    }

    #[test]
    fn parses_api_payload_shape() {
        let rec: IntervalRecord = serde_json::from_str(
            r#"{"interval_start":"2024-01-01T00:00:00Z","interval_end":"2024-01-01T00:30:00Z","consumption":0.5}"#,
        )
        .unwrap();
        assert!(rec.is_well_formed());
        assert_eq!(rec.interval_end, datetime!(2024-01-01 00:30 UTC));
    }
}
