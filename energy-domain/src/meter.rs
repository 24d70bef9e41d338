use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Energy kind of a metering point. Serialized lowercase in config and
/// partition paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterKind {
    Electricity,
    Gas,
}

impl fmt::Display for MeterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeterKind::Electricity => f.write_str("electricity"),
            MeterKind::Gas => f.write_str("gas"),
        }
    }
}

impl FromStr for MeterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "electricity" => Ok(MeterKind::Electricity),
            "gas" => Ok(MeterKind::Gas),
            other => Err(format!("unknown meter kind '{other}'")),
        }
    }
}

/// A metering point identified by kind, MPAN/MPRN and serial number.
///
/// Identity is `(mpan_mprn, serial)`; the optional tariff code overrides
/// tariff resolution for this meter only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meter {
    pub kind: MeterKind,
    pub mpan_mprn: String,
    pub serial: String,
    #[serde(default)]
    pub tariff_code: Option<String>,
}

impl Meter {
    /// Key under which this meter's bookmark is stored.
    pub fn state_key(&self) -> String {
        format!("{}:{}", self.mpan_mprn, self.serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_display() {
        for kind in [MeterKind::Electricity, MeterKind::Gas] {
            assert_eq!(kind.to_string().parse::<MeterKind>(), Ok(kind));
        }
    }

    #[test]
    fn state_key_joins_id_and_serial() {
        let meter = Meter {
            kind: MeterKind::Electricity,
            mpan_mprn: "1900021218905".to_string(),
            serial: "19L3269639".to_string(),
            tariff_code: None,
        };
        assert_eq!(meter.state_key(), "1900021218905:19L3269639");
    }

    #[test]
    fn meter_deserializes_without_tariff_override() {
        let meter: Meter =
            serde_json::from_str(r#"{"kind":"gas","mpan_mprn":"701337809","serial":"E6E07565322221"}"#)
                .unwrap();
        assert_eq!(meter.kind, MeterKind::Gas);
        assert!(meter.tariff_code.is_none());
    }
}
