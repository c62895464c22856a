//! Pure commission math for one order.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;

use crate::percent_of;
use crate::settings::ConfigSnapshot;
use crate::types::{Ancestor, OrderRecord, PayoutLine};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Buyer's first completed order: flat rates, no buyer discount.
    FirstPurchase,
    /// Any later order: amount band rates for the active model.
    RepeatPurchase,
}

/// The result of [`compute_commissions`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommissionBreakdown {
    pub scenario: Scenario,
    /// Ceiling for `buyer_discount + sum(lines)`.
    pub pool: i64,
    pub buyer_discount: i64,
    pub lines: Vec<PayoutLine>,
    /// True when the raw shares exceeded the pool and were scaled down.
    pub scaled: bool,
    /// True when no band matched a repeat purchase. Nothing is paid.
    pub band_missing: bool,
}

impl CommissionBreakdown {
    pub fn total_paid(&self) -> i64 {
        self.buyer_discount + self.lines.iter().map(|l| l.amount).sum::<i64>()
    }
}

/// Computes the buyer discount and per-ancestor payouts for `order`.
///
/// The discount and every payout line together never exceed
/// `net_amount * total_payout_percent`; when raw shares would, they are scaled
/// proportionally and the rounding leftover is handed out by largest
/// remainder. Lines that round to zero are dropped.
pub fn compute_commissions(
    order: &OrderRecord,
    ancestry: &[Ancestor],
    config: &ConfigSnapshot,
) -> CommissionBreakdown {
    let settings = &config.settings;
    let pool = percent_of(order.net_amount, settings.total_payout_percent).max(0);

    let (scenario, discount_percent, rates) = if order.first_order {
        (
            Scenario::FirstPurchase,
            Decimal::ZERO,
            config.tiers.first_purchase,
        )
    } else {
        match config.tiers.band_for(order.net_amount) {
            Some(band) => (
                Scenario::RepeatPurchase,
                band.discount_percent(order.net_amount, settings.capped_discount_rule),
                *band.rates(settings.commission_model),
            ),
            None => {
                warn!(
                    order_id = %order.order_id,
                    net_amount = order.net_amount,
                    config_version = config.version,
                    "no tier band matches order amount, paying no commission"
                );
                return CommissionBreakdown {
                    scenario: Scenario::RepeatPurchase,
                    pool,
                    buyer_discount: 0,
                    lines: Vec::new(),
                    scaled: false,
                    band_missing: true,
                };
            }
        }
    };

    // index 0 is the buyer discount, then one share per ancestor
    let mut raw = Vec::with_capacity(ancestry.len() + 1);
    raw.push(percent_of(order.net_amount, discount_percent));
    raw.extend(
        ancestry
            .iter()
            .map(|a| percent_of(order.net_amount, rates.for_level(a.level))),
    );

    let (shares, scaled) = fit_to_pool(&raw, pool);

    let lines = ancestry
        .iter()
        .zip(&shares[1..])
        .filter(|(_, amount)| **amount > 0)
        .map(|(a, amount)| PayoutLine {
            beneficiary_id: a.user_id,
            level: a.level,
            amount: *amount,
        })
        .collect();

    CommissionBreakdown {
        scenario,
        pool,
        buyer_discount: shares[0],
        lines,
        scaled,
        band_missing: false,
    }
}

/// Scales `raw` so its sum is at most `pool`. Returns the shares and whether
/// scaling happened. No scaled share exceeds its raw value.
pub fn fit_to_pool(raw: &[i64], pool: i64) -> (Vec<i64>, bool) {
    let total: i128 = raw.iter().map(|v| i128::from(*v)).sum();
    let pool = i128::from(pool.max(0));
    if total <= pool {
        return (raw.to_vec(), false);
    }

    let mut shares = Vec::with_capacity(raw.len());
    let mut remainders = Vec::with_capacity(raw.len());
    for (i, value) in raw.iter().enumerate() {
        let product = i128::from(*value) * pool;
        shares.push(product / total);
        remainders.push((product % total, i));
    }

    let mut leftover = pool - shares.iter().sum::<i128>();
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (rem, i) in remainders {
        if leftover == 0 || rem == 0 {
            break;
        }
        shares[i] += 1;
        leftover -= 1;
    }

    // every share is at most its raw i64 value, so the narrowing is lossless
    let shares = shares
        .into_iter()
        .zip(raw)
        .map(|(s, r)| i64::try_from(s).unwrap_or(*r))
        .collect();
    (shares, true)
}
