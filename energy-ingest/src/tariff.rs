use energy_domain::{Meter, MeterKind, TariffCode};
use time::OffsetDateTime;

use crate::api::{Account, MeteringApi};
use crate::config::TariffConfig;
use crate::error::IngestError;

/// Product/tariff pair a meter's rates are fetched under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTariff {
    pub product_code: String,
    pub tariff_code: String,
}

/// Resolves the applicable tariff for a meter.
///
/// Precedence: per-meter override, then globally configured codes, then
/// auto-discovery from the account's agreements. Resolution happens per run;
/// nothing is cached across invocations. Failure skips the cost branch for
/// the meter, never the raw path.
pub async fn resolve<A: MeteringApi + ?Sized>(
    api: &A,
    meter: &Meter,
    config: &TariffConfig,
    now: OffsetDateTime,
) -> Result<ResolvedTariff, IngestError> {
    if let Some(code) = &meter.tariff_code {
        let parsed = TariffCode::parse(code);
        return match parsed.product_code {
            Some(product_code) => Ok(ResolvedTariff {
                product_code,
                tariff_code: code.clone(),
            }),
            None => Err(IngestError::Resolution(format!(
                "tariff override '{code}' for meter {} has no parseable product code",
                meter.state_key()
            ))),
        };
    }

    let (product, tariff) = match meter.kind {
        MeterKind::Electricity => (
            config.electricity_product_code.as_ref(),
            config.electricity_tariff_code.as_ref(),
        ),
        MeterKind::Gas => (
            config.gas_product_code.as_ref(),
            config.gas_tariff_code.as_ref(),
        ),
    };
    if let (Some(product_code), Some(tariff_code)) = (product, tariff) {
        return Ok(ResolvedTariff {
            product_code: product_code.clone(),
            tariff_code: tariff_code.clone(),
        });
    }

    let account = api.fetch_account().await.map_err(|e| {
        IngestError::Resolution(format!("account lookup for auto-discovery failed: {e}"))
    })?;
    discover(&account, meter.kind, now).ok_or_else(|| {
        IngestError::Resolution(format!(
            "no agreement covering now for {} meter {}",
            meter.kind,
            meter.state_key()
        ))
    })
}

/// Picks the agreement with the latest `valid_from` whose window contains
/// `as_of`; agreements with unparseable tariff codes are skipped.
fn discover(account: &Account, kind: MeterKind, as_of: OffsetDateTime) -> Option<ResolvedTariff> {
    let mut chosen: Option<(OffsetDateTime, ResolvedTariff)> = None;
    for point in account.meter_points(kind) {
        for agreement in &point.agreements {
            let code = match &agreement.tariff_code {
                Some(code) => code,
                None => continue,
            };
            let valid_from = match agreement.valid_from {
                Some(valid_from) => valid_from,
                None => continue,
            };
            let covers_now =
                valid_from <= as_of && agreement.valid_to.map_or(true, |valid_to| as_of < valid_to);
            if !covers_now {
                continue;
            }
            let product_code = match TariffCode::parse(code).product_code {
                Some(product_code) => product_code,
                None => continue,
            };
            let better = chosen
                .as_ref()
                .map_or(true, |(start, _)| valid_from > *start);
            if better {
                chosen = Some((
                    valid_from,
                    ResolvedTariff {
                        product_code,
                        tariff_code: code.clone(),
                    },
                ));
            }
        }
        if chosen.is_some() {
            // First meter point with a live agreement settles the kind.
            break;
        }
    }
    chosen.map(|(_, tariff)| tariff)
}
