//! Cumulative purchase tracking and the one-way referral link unlock.

use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::types::{Listing, OrderId, Page, ReferralUser, UserId};

/// Outcome of crediting one order to its buyer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PurchaseOutcome {
    pub user_id: UserId,
    pub purchase_total: i64,
    pub referral_unlocked: bool,
    /// True only for the call that flipped the flag.
    pub newly_unlocked: bool,
    /// False when this order had already been credited.
    pub credited: bool,
}

/// Per-user purchase totals and unlock flags.
///
/// `record_purchase` is an atomic read-modify-write per user and credits each
/// order at most once.
pub trait UnlockTracker {
    fn record_purchase(
        &self,
        user_id: UserId,
        order_id: &OrderId,
        amount: i64,
        threshold: i64,
    ) -> impl Future<Output = Result<PurchaseOutcome>> + Send;

    fn referral_user(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Option<ReferralUser>>> + Send;

    fn list_referral_users(
        &self,
        page: Page,
    ) -> impl Future<Output = Result<Listing<ReferralUser>>> + Send;
}

/// Unlock fields after crediting `amount`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnlockState {
    pub purchase_total: i64,
    pub referral_unlocked: bool,
    pub referral_code: Option<String>,
    pub unlocked_at: Option<DateTime<Utc>>,
}

impl UnlockState {
    pub fn of(user: &ReferralUser) -> Self {
        Self {
            purchase_total: user.purchase_total,
            referral_unlocked: user.referral_unlocked,
            referral_code: user.referral_code.clone(),
            unlocked_at: user.unlocked_at,
        }
    }

    /// Adds `amount` and unlocks once the total reaches `threshold`. An
    /// unlocked state stays unlocked whatever the threshold is.
    pub fn credit(&self, amount: i64, threshold: i64, now: DateTime<Utc>) -> (Self, bool) {
        let purchase_total = self.purchase_total.saturating_add(amount.max(0));
        if self.referral_unlocked {
            let next = Self {
                purchase_total,
                ..self.clone()
            };
            return (next, false);
        }
        if purchase_total >= threshold {
            let next = Self {
                purchase_total,
                referral_unlocked: true,
                referral_code: Some(mint_referral_code()),
                unlocked_at: Some(now),
            };
            return (next, true);
        }
        let next = Self {
            purchase_total,
            ..self.clone()
        };
        (next, false)
    }

    pub fn apply_to(self, user: &mut ReferralUser) {
        user.purchase_total = self.purchase_total;
        user.referral_unlocked = self.referral_unlocked;
        user.referral_code = self.referral_code;
        user.unlocked_at = self.unlocked_at;
    }
}

/// A fresh shareable referral code.
pub fn mint_referral_code() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    raw[..10].to_uppercase()
}

/// The public link for a code.
pub fn referral_link(base: &str, code: &str) -> String {
    format!("{base}{code}")
}
