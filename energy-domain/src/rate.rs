use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::meter::MeterKind;

/// A time-bounded unit price for a `(product, tariff, kind)` triple.
///
/// Windows for one triple are non-overlapping and sorted by `valid_from`;
/// at most one record is open-ended (`valid_to = None`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateRecord {
    pub product_code: String,
    pub tariff_code: String,
    pub kind: MeterKind,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_from: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_to: Option<OffsetDateTime>,
    #[serde(default)]
    pub value_inc_vat: Option<f64>,
    pub value_ex_vat: f64,
}

impl RateRecord {
    /// Whether `ts` falls in `[valid_from, valid_to)`, treating a missing
    /// `valid_to` as open-ended.
    pub fn applies_at(&self, ts: OffsetDateTime) -> bool {
        ts >= self.valid_from && self.valid_to.map_or(true, |valid_to| ts < valid_to)
    }

    /// Unit price used for cost figures: VAT-inclusive when available.
    pub fn unit_price(&self) -> f64 {
        self.value_inc_vat.unwrap_or(self.value_ex_vat)
    }
}

/// Parsed components of a tariff code such as `E-1R-AGILE-24-09-01-A`.
///
/// The last single-character segment is the region; everything between the
/// register and the region is the product code. Codes with extra distributor
/// fragments keep them inside the product code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TariffCode {
    pub kind: Option<MeterKind>,
    pub register: Option<String>,
    pub product_code: Option<String>,
    pub region: Option<String>,
}

impl TariffCode {
    pub fn parse(code: &str) -> Self {
        let parts: Vec<&str> = code.split('-').collect();
        let kind = parts.first().and_then(|p| match p.chars().next() {
            Some('E') => Some(MeterKind::Electricity),
            Some('G') => Some(MeterKind::Gas),
            _ => None,
        });
        if parts.len() < 3 {
            return TariffCode {
                kind,
                register: None,
                product_code: None,
                region: None,
            };
        }
        let register = Some(parts[1].to_string());
        let region = parts
            .last()
            .filter(|last| last.len() == 1)
            .map(|last| last.to_string());
        let core = if region.is_some() {
            &parts[2..parts.len() - 1]
        } else {
            &parts[2..]
        };
        let product_code = if core.is_empty() {
            None
        } else {
            Some(core.join("-"))
        };
        TariffCode {
            kind,
            register,
            product_code,
            region,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn rate(valid_from: OffsetDateTime, valid_to: Option<OffsetDateTime>) -> RateRecord {
        RateRecord {
            product_code: "AGILE-24-09-01".to_string(),
            tariff_code: "E-1R-AGILE-24-09-01-A".to_string(),
            kind: MeterKind::Electricity,
            valid_from,
            valid_to,
            value_inc_vat: Some(0.30),
            value_ex_vat: 0.28,
        }
    }

    #[test]
    fn open_ended_rate_applies_from_valid_from_onward() {
        let r = rate(datetime!(2024-01-01 12:00 UTC), None);
        assert!(!r.applies_at(datetime!(2024-01-01 11:30 UTC)));
        assert!(r.applies_at(datetime!(2024-01-01 12:00 UTC)));
        assert!(r.applies_at(datetime!(2030-01-01 00:00 UTC)));
    }

    #[test]
    fn bounded_rate_excludes_valid_to() {
        let r = rate(
            datetime!(2024-01-01 00:00 UTC),
            Some(datetime!(2024-01-01 12:00 UTC)),
        );
        assert!(r.applies_at(datetime!(2024-01-01 11:30 UTC)));
        assert!(!r.applies_at(datetime!(2024-01-01 12:00 UTC)));
    }

    #[test]
    fn unit_price_prefers_vat_inclusive() {
        let mut r = rate(datetime!(2024-01-01 00:00 UTC), None);
        assert_eq!(r.unit_price(), 0.30);
        r.value_inc_vat = None;
        assert_eq!(r.unit_price(), 0.28);
    }

    #[test]
    fn parses_electricity_tariff_code() {
        let parsed = TariffCode::parse("E-1R-AGILE-24-09-01-A");
        assert_eq!(parsed.kind, Some(MeterKind::Electricity));
        assert_eq!(parsed.register.as_deref(), Some("1R"));
        assert_eq!(parsed.product_code.as_deref(), Some("AGILE-24-09-01"));
        assert_eq!(parsed.region.as_deref(), Some("A"));
    }

    #[test]
    fn parses_gas_tariff_code_without_region() {
        let parsed = TariffCode::parse("G-1R-GAS-24-09-01");
        assert_eq!(parsed.kind, Some(MeterKind::Gas));
        assert_eq!(parsed.product_code.as_deref(), Some("GAS-24-09-01"));
        assert_eq!(parsed.region, None);
    }

    #[test]
    fn short_code_yields_no_product() {
        let parsed = TariffCode::parse("E-1R");
        assert_eq!(parsed.kind, Some(MeterKind::Electricity));
        assert_eq!(parsed.product_code, None);
    }
}
