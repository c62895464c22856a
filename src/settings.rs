//! Global referral settings and the tier table, held as immutable versioned
//! snapshots.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which per-band commission table applies to repeat purchases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommissionModel {
    #[default]
    #[serde(rename = "option1")]
    ModelA,
    #[serde(rename = "option2")]
    ModelB,
}

/// How a band's buyer discount is chosen when the band only gives a maximum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CappedDiscountRule {
    /// Always grant the maximum.
    #[default]
    AtMax,
    /// Grow from zero at the band's lower bound to the maximum at its upper
    /// bound. Open-ended bands grant the maximum.
    LinearInBand,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "payment_gateway_fee_percent")]
    pub gateway_fee_percent: Decimal,
    /// Upper bound on commissions plus buyer discount, as a percent of the
    /// order's net amount.
    #[serde(rename = "referral_total_payout_percent")]
    pub total_payout_percent: Decimal,
    #[serde(rename = "referral_unlock_purchase_threshold")]
    pub unlock_purchase_threshold: i64,
    #[serde(rename = "referral_commission_model")]
    pub commission_model: CommissionModel,
    #[serde(default)]
    pub capped_discount_rule: CappedDiscountRule,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway_fee_percent: Decimal::new(25, 1),
            total_payout_percent: Decimal::from(20),
            unlock_purchase_threshold: 5_000,
            commission_model: CommissionModel::ModelA,
            capped_discount_rule: CappedDiscountRule::AtMax,
        }
    }
}

/// Level-1 and levels-2..8 commission percents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelRates {
    pub level1_percent: Decimal,
    pub levels2_to8_percent: Decimal,
}

impl LevelRates {
    pub fn new(level1_percent: Decimal, levels2_to8_percent: Decimal) -> Self {
        Self {
            level1_percent,
            levels2_to8_percent,
        }
    }

    pub fn for_level(&self, level: u8) -> Decimal {
        if level == 1 {
            self.level1_percent
        } else {
            self.levels2_to8_percent
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuyerDiscount {
    Fixed { percent: Decimal },
    UpTo { max_percent: Decimal },
}

impl BuyerDiscount {
    fn ceiling(&self) -> Decimal {
        match self {
            BuyerDiscount::Fixed { percent } => *percent,
            BuyerDiscount::UpTo { max_percent } => *max_percent,
        }
    }
}

/// A repeat-purchase band covering `min_amount..=max_amount` of the order's net
/// amount. `max_amount = None` means open-ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBand {
    pub min_amount: i64,
    pub max_amount: Option<i64>,
    pub buyer_discount: BuyerDiscount,
    pub model_a: LevelRates,
    pub model_b: LevelRates,
}

impl TierBand {
    pub fn contains(&self, amount: i64) -> bool {
        amount >= self.min_amount && self.max_amount.is_none_or(|max| amount <= max)
    }

    pub fn rates(&self, model: CommissionModel) -> &LevelRates {
        match model {
            CommissionModel::ModelA => &self.model_a,
            CommissionModel::ModelB => &self.model_b,
        }
    }

    /// The discount percent granted for `amount` under `rule`.
    pub fn discount_percent(&self, amount: i64, rule: CappedDiscountRule) -> Decimal {
        match (self.buyer_discount, rule) {
            (BuyerDiscount::Fixed { percent }, _) => percent,
            (BuyerDiscount::UpTo { max_percent }, CappedDiscountRule::AtMax) => max_percent,
            (BuyerDiscount::UpTo { max_percent }, CappedDiscountRule::LinearInBand) => {
                match self.max_amount {
                    Some(max) if max > self.min_amount => {
                        let pos =
                            Decimal::from(amount.clamp(self.min_amount, max) - self.min_amount);
                        let width = Decimal::from(max - self.min_amount);
                        max_percent * pos / width
                    }
                    _ => max_percent,
                }
            }
        }
    }
}

/// First-purchase flat rates plus the repeat-purchase bands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTable {
    pub first_purchase: LevelRates,
    pub bands: Vec<TierBand>,
}

impl TierTable {
    pub fn band_for(&self, amount: i64) -> Option<&TierBand> {
        self.bands.iter().find(|b| b.contains(amount))
    }
}

impl Default for TierTable {
    fn default() -> Self {
        fn pct(v: i64) -> Decimal {
            Decimal::from(v)
        }
        Self {
            first_purchase: LevelRates::new(pct(10), pct(5)),
            bands: vec![
                TierBand {
                    min_amount: 0,
                    max_amount: Some(5_000),
                    buyer_discount: BuyerDiscount::Fixed { percent: pct(3) },
                    model_a: LevelRates::new(pct(6), pct(2)),
                    model_b: LevelRates::new(pct(8), pct(1)),
                },
                TierBand {
                    min_amount: 5_001,
                    max_amount: Some(10_000),
                    buyer_discount: BuyerDiscount::UpTo { max_percent: pct(5) },
                    model_a: LevelRates::new(pct(8), pct(3)),
                    model_b: LevelRates::new(pct(10), pct(2)),
                },
                TierBand {
                    min_amount: 10_001,
                    max_amount: None,
                    buyer_discount: BuyerDiscount::Fixed { percent: pct(7) },
                    model_a: LevelRates::new(pct(10), pct(4)),
                    model_b: LevelRates::new(pct(12), pct(3)),
                },
            ],
        }
    }
}

/// One immutable version of the full configuration. A calculation reads a
/// single snapshot from start to finish.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub version: i64,
    pub settings: Settings,
    pub tiers: TierTable,
    pub created_at: DateTime<Utc>,
}

impl ConfigSnapshot {
    pub fn initial() -> Self {
        Self {
            version: 1,
            settings: Settings::default(),
            tiers: TierTable::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_settings(&self, settings: Settings) -> Self {
        Self {
            version: self.version + 1,
            settings,
            tiers: self.tiers.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn with_tiers(&self, tiers: TierTable) -> Self {
        Self {
            version: self.version + 1,
            settings: self.settings.clone(),
            tiers,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must be between 0 and 100, got {value}")]
    PercentOutOfRange { field: String, value: Decimal },
    #[error("unlock purchase threshold must be >= 0")]
    NegativeThreshold,
    #[error("tier table has no bands")]
    NoBands,
    #[error("band {index} has a negative lower bound")]
    NegativeBound { index: usize },
    #[error("band {index} upper bound is below its lower bound")]
    InvertedBand { index: usize },
    #[error("band {index} is open-ended but is not the last band")]
    OpenBandNotLast { index: usize },
    #[error("band {index} does not start right after band {prev}")]
    NotContiguous { index: usize, prev: usize },
    #[error("the first band must start at 0")]
    FirstBandNotAtZero,
    #[error("the last band must be open-ended")]
    LastBandClosed,
}

fn check_percent(field: &str, value: Decimal) -> Result<(), ValidationError> {
    if value < Decimal::ZERO || value > Decimal::ONE_HUNDRED {
        return Err(ValidationError::PercentOutOfRange {
            field: field.to_string(),
            value,
        });
    }
    Ok(())
}

fn check_rates(prefix: &str, rates: &LevelRates) -> Result<(), ValidationError> {
    check_percent(&format!("{prefix}.level1_percent"), rates.level1_percent)?;
    check_percent(
        &format!("{prefix}.levels2_to8_percent"),
        rates.levels2_to8_percent,
    )
}

impl Settings {
    /// Deducts the payment gateway fee from a gross order amount.
    pub fn net_of_gateway_fee(&self, gross: i64) -> i64 {
        gross - crate::percent_of(gross, self.gateway_fee_percent)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_percent("payment_gateway_fee_percent", self.gateway_fee_percent)?;
        check_percent("referral_total_payout_percent", self.total_payout_percent)?;
        if self.unlock_purchase_threshold < 0 {
            return Err(ValidationError::NegativeThreshold);
        }
        Ok(())
    }
}

impl TierTable {
    /// Bands must cover every amount from 0 upwards: ascending, contiguous,
    /// non-overlapping, and only the last band open-ended.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_rates("first_purchase", &self.first_purchase)?;
        let (Some(first), Some(tail)) = (self.bands.first(), self.bands.last()) else {
            return Err(ValidationError::NoBands);
        };
        if first.min_amount != 0 {
            return Err(ValidationError::FirstBandNotAtZero);
        }
        if tail.max_amount.is_some() {
            return Err(ValidationError::LastBandClosed);
        }
        let last = self.bands.len() - 1;
        for (index, band) in self.bands.iter().enumerate() {
            if band.min_amount < 0 {
                return Err(ValidationError::NegativeBound { index });
            }
            match band.max_amount {
                Some(max) if max < band.min_amount => {
                    return Err(ValidationError::InvertedBand { index });
                }
                None if index != last => {
                    return Err(ValidationError::OpenBandNotLast { index });
                }
                _ => {}
            }
            check_percent(
                &format!("bands[{index}].buyer_discount"),
                band.buyer_discount.ceiling(),
            )?;
            check_rates(&format!("bands[{index}].model_a"), &band.model_a)?;
            check_rates(&format!("bands[{index}].model_b"), &band.model_b)?;

            if index > 0 {
                let prev = &self.bands[index - 1];
                if prev.max_amount.and_then(|m| m.checked_add(1)) != Some(band.min_amount) {
                    return Err(ValidationError::NotContiguous {
                        index,
                        prev: index - 1,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(Settings::default().validate(), Ok(()));
        assert_eq!(TierTable::default().validate(), Ok(()));
    }

    #[test]
    fn model_serializes_as_option_names() {
        let json = serde_json::to_string(&CommissionModel::ModelB).unwrap();
        assert_eq!(json, "\"option2\"");
        let model: CommissionModel = serde_json::from_str("\"option1\"").unwrap();
        assert_eq!(model, CommissionModel::ModelA);
        assert!(serde_json::from_str::<CommissionModel>("\"option3\"").is_err());
    }

    #[test]
    fn gateway_fee_is_deducted_from_gross() {
        let settings = Settings::default();
        assert_eq!(settings.net_of_gateway_fee(10_000), 9_750);
        assert_eq!(settings.net_of_gateway_fee(0), 0);
    }

    #[test]
    fn rejects_out_of_range_percent() {
        let settings = Settings {
            total_payout_percent: Decimal::from(101),
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ValidationError::PercentOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_gap_between_bands() {
        let mut tiers = TierTable::default();
        tiers.bands[1].min_amount = 5_002;
        assert_eq!(
            tiers.validate(),
            Err(ValidationError::NotContiguous { index: 1, prev: 0 })
        );
    }

    #[test]
    fn rejects_overlapping_bands() {
        let mut tiers = TierTable::default();
        tiers.bands[1].min_amount = 4_000;
        assert!(matches!(
            tiers.validate(),
            Err(ValidationError::NotContiguous { .. })
        ));
    }

    #[test]
    fn rejects_open_band_in_the_middle() {
        let mut tiers = TierTable::default();
        tiers.bands[0].max_amount = None;
        assert_eq!(
            tiers.validate(),
            Err(ValidationError::OpenBandNotLast { index: 0 })
        );
    }

    #[test]
    fn band_ending_at_i64_max_cannot_be_followed() {
        let mut tiers = TierTable::default();
        tiers.bands.truncate(2);
        tiers.bands[0].max_amount = Some(i64::MAX);
        tiers.bands[1].min_amount = 5;
        tiers.bands[1].max_amount = None;
        assert_eq!(
            tiers.validate(),
            Err(ValidationError::NotContiguous { index: 1, prev: 0 })
        );
    }

    #[test]
    fn bands_must_cover_every_amount() {
        let mut tiers = TierTable::default();
        tiers.bands[0].min_amount = 1;
        assert_eq!(tiers.validate(), Err(ValidationError::FirstBandNotAtZero));

        let mut tiers = TierTable::default();
        tiers.bands[2].max_amount = Some(50_000);
        assert_eq!(tiers.validate(), Err(ValidationError::LastBandClosed));
    }

    #[test]
    fn band_lookup_respects_inclusive_bounds() {
        let tiers = TierTable::default();
        assert_eq!(tiers.band_for(5_000).map(|b| b.min_amount), Some(0));
        assert_eq!(tiers.band_for(5_001).map(|b| b.min_amount), Some(5_001));
        assert_eq!(tiers.band_for(1_000_000).map(|b| b.min_amount), Some(10_001));
        assert!(tiers.band_for(-1).is_none());
    }

    #[test]
    fn linear_discount_scales_within_band() {
        let band = &TierTable::default().bands[1];
        let rule = CappedDiscountRule::LinearInBand;
        assert_eq!(band.discount_percent(5_001, rule), Decimal::ZERO);
        assert_eq!(band.discount_percent(10_000, rule), Decimal::from(5));
        assert_eq!(
            band.discount_percent(8_000, CappedDiscountRule::AtMax),
            Decimal::from(5)
        );
    }

    #[test]
    fn new_versions_do_not_touch_the_old_snapshot() {
        let v1 = ConfigSnapshot::initial();
        let v2 = v1.with_settings(Settings {
            commission_model: CommissionModel::ModelB,
            ..v1.settings.clone()
        });
        assert_eq!(v2.version, 2);
        assert_eq!(v1.settings.commission_model, CommissionModel::ModelA);
        assert_eq!(v2.tiers, v1.tiers);
    }
}
