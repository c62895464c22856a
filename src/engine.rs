//! Order-completion intake and the administrative operations around it.

use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::calculator::{CommissionBreakdown, Scenario, compute_commissions};
use crate::error::EngineError;
use crate::ledger::{AppendOutcome, CommissionBatch, HistoryGroup, group_by_order};
use crate::resolver::resolve_ancestry;
use crate::settings::{ConfigSnapshot, Settings, TierTable};
use crate::store::CommissionStore;
use crate::types::{
    CompletedOrder, HistoryQuery, LedgerEntry, Listing, OrderAmount, OrderId, Page, PayoutLine,
    ReferralUser, ReferrerRef, UserId,
};
use crate::unlock::{PurchaseOutcome, referral_link};

/// What one `on_order_completed` call did.
#[derive(Clone, Debug, Serialize)]
pub struct IntakeReport {
    pub order_id: OrderId,
    pub buyer_id: UserId,
    pub net_amount: i64,
    pub first_order: bool,
    pub scenario: Scenario,
    pub config_version: i64,
    pub ancestry_depth: usize,
    pub cycle_detected: bool,
    pub band_missing: bool,
    pub pool: i64,
    pub buyer_discount: i64,
    pub payouts: Vec<PayoutLine>,
    /// False when the order had already been ledgered by an earlier call.
    pub ledger_written: bool,
    pub unlock: PurchaseOutcome,
}

/// A user's referral standing with a resolved link.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserReferralView {
    #[serde(flatten)]
    pub user: ReferralUser,
    pub referral_link: Option<String>,
}

#[derive(Clone)]
pub struct CommissionEngine<S> {
    store: S,
    link_base: Arc<str>,
}

impl<S: CommissionStore> CommissionEngine<S> {
    pub fn new(store: S, link_base: impl Into<Arc<str>>) -> Self {
        Self {
            store,
            link_base: link_base.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Processes one completed order. Safe to call again with the same order:
    /// the order snapshot, ledger batch and purchase credit are each written
    /// at most once.
    ///
    /// The ledger write and the purchase credit are attempted independently.
    /// If either fails the error is returned and the whole call can be retried.
    #[instrument(skip(self, order), fields(order_id = %order.order_id, buyer_id = order.buyer_id))]
    pub async fn on_order_completed(
        &self,
        order: CompletedOrder,
    ) -> Result<IntakeReport, EngineError> {
        if order.amount.value() < 0 {
            return Err(EngineError::InvalidAmount(order.amount.value()));
        }

        let current = self.store.current_config().await?;
        let net_amount = match order.amount {
            OrderAmount::Net(net) => net,
            OrderAmount::Gross(gross) => current.settings.net_of_gateway_fee(gross),
        };

        let record = self
            .store
            .record_order(
                &order.order_id,
                order.buyer_id,
                net_amount,
                current.version,
                order.completed_at,
            )
            .await?;
        if record.buyer_id != order.buyer_id {
            warn!(
                recorded_buyer = record.buyer_id,
                "order id reused with a different buyer, keeping the first record"
            );
        }

        // a retried order is priced with the version it was first seen under
        let config = if record.config_version == current.version {
            current
        } else {
            self.store
                .config_at(record.config_version)
                .await?
                .ok_or_else(|| {
                    anyhow!("config version {} is missing", record.config_version)
                })?
        };

        let ancestry = resolve_ancestry(&self.store, record.buyer_id).await?;
        let breakdown = compute_commissions(&record, &ancestry.ancestors, &config);

        let ledger = self
            .store
            .append_if_absent(CommissionBatch {
                order_id: record.order_id.clone(),
                buyer_id: record.buyer_id,
                config_version: config.version,
                buyer_discount: breakdown.buyer_discount,
                lines: breakdown.lines.clone(),
            })
            .await;
        let unlock = self
            .store
            .record_purchase(
                record.buyer_id,
                &record.order_id,
                record.net_amount,
                config.settings.unlock_purchase_threshold,
            )
            .await;

        let ledger = ledger?;
        let unlock = unlock?;

        log_outcome(&record.order_id, &breakdown, &ledger, &unlock);

        let payouts = if ledger.written {
            breakdown.lines.clone()
        } else {
            ledger
                .entries
                .iter()
                .map(|e| PayoutLine {
                    beneficiary_id: e.beneficiary_id,
                    level: e.level,
                    amount: e.amount,
                })
                .collect()
        };
        if !ledger.written && ledger.config_version != config.version {
            warn!(
                stored_version = ledger.config_version,
                config_version = config.version,
                "stored commission batch was priced with another config version"
            );
        }

        Ok(IntakeReport {
            order_id: record.order_id,
            buyer_id: record.buyer_id,
            net_amount: record.net_amount,
            first_order: record.first_order,
            scenario: breakdown.scenario,
            config_version: ledger.config_version,
            ancestry_depth: ancestry.len(),
            cycle_detected: ancestry.cycle_at.is_some(),
            band_missing: breakdown.band_missing,
            pool: breakdown.pool,
            buyer_discount: ledger.buyer_discount,
            payouts,
            ledger_written: ledger.written,
            unlock,
        })
    }

    /// Appends reversing entries for an order's commissions, once.
    pub async fn reverse_order(&self, order_id: &OrderId) -> Result<AppendOutcome, EngineError> {
        let outcome = self
            .store
            .append_reversal(order_id)
            .await?
            .ok_or_else(|| EngineError::OrderNotFound(order_id.clone()))?;
        if outcome.written {
            info!(%order_id, entries = outcome.entries.len(), "commissions reversed");
        }
        Ok(outcome)
    }

    pub async fn settings(&self) -> Result<Arc<ConfigSnapshot>, EngineError> {
        Ok(self.store.current_config().await?)
    }

    pub async fn update_settings(
        &self,
        settings: Settings,
    ) -> Result<Arc<ConfigSnapshot>, EngineError> {
        settings.validate()?;
        let snapshot = self.store.update_settings(settings).await?;
        info!(
            version = snapshot.version,
            model = ?snapshot.settings.commission_model,
            "referral settings updated"
        );
        Ok(snapshot)
    }

    pub async fn update_tier_table(
        &self,
        tiers: TierTable,
    ) -> Result<Arc<ConfigSnapshot>, EngineError> {
        tiers.validate()?;
        let snapshot = self.store.update_tiers(tiers).await?;
        info!(
            version = snapshot.version,
            bands = snapshot.tiers.bands.len(),
            "referral tier table updated"
        );
        Ok(snapshot)
    }

    pub async fn register_user(
        &self,
        user_id: UserId,
        referrer: Option<ReferrerRef>,
    ) -> Result<UserReferralView, EngineError> {
        let user = self.store.register_user(user_id, referrer).await?;
        info!(user_id, referred_by = ?user.referred_by, "user registered");
        Ok(self.view(user))
    }

    pub async fn user_referral(&self, user_id: UserId) -> Result<UserReferralView, EngineError> {
        self.store
            .referral_user(user_id)
            .await?
            .map(|u| self.view(u))
            .ok_or(EngineError::UserNotFound(user_id))
    }

    pub async fn is_unlocked(&self, user_id: UserId) -> Result<bool, EngineError> {
        Ok(self
            .store
            .referral_user(user_id)
            .await?
            .is_some_and(|u| u.referral_unlocked))
    }

    /// The user's shareable link, or `None` while locked.
    pub async fn referral_link(&self, user_id: UserId) -> Result<Option<String>, EngineError> {
        Ok(self.user_referral(user_id).await?.referral_link)
    }

    pub async fn list_user_referral_data(
        &self,
        page: Page,
    ) -> Result<Listing<UserReferralView>, EngineError> {
        let listing = self.store.list_referral_users(page).await?;
        Ok(Listing {
            items: listing.items.into_iter().map(|u| self.view(u)).collect(),
            total: listing.total,
        })
    }

    pub async fn list_commission_history(
        &self,
        query: &HistoryQuery,
    ) -> Result<Listing<LedgerEntry>, EngineError> {
        Ok(self.store.list_history(query).await?)
    }

    pub async fn list_commission_history_grouped(
        &self,
        query: &HistoryQuery,
    ) -> Result<Listing<HistoryGroup>, EngineError> {
        let listing = self.store.list_history(query).await?;
        Ok(Listing {
            items: group_by_order(listing.items),
            total: listing.total,
        })
    }

    fn view(&self, user: ReferralUser) -> UserReferralView {
        let referral_link = match (&user.referral_code, user.referral_unlocked) {
            (Some(code), true) => Some(referral_link(&self.link_base, code)),
            _ => None,
        };
        UserReferralView {
            user,
            referral_link,
        }
    }
}

fn log_outcome(
    order_id: &OrderId,
    breakdown: &CommissionBreakdown,
    ledger: &AppendOutcome,
    unlock: &PurchaseOutcome,
) {
    if ledger.written {
        info!(
            %order_id,
            lines = ledger.entries.len(),
            buyer_discount = breakdown.buyer_discount,
            pool = breakdown.pool,
            scaled = breakdown.scaled,
            "commission ledger written"
        );
    } else {
        info!(%order_id, "order already ledgered, nothing written");
    }
    if unlock.newly_unlocked {
        info!(
            user_id = unlock.user_id,
            purchase_total = unlock.purchase_total,
            "referral link unlocked"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn engine() -> CommissionEngine<MemoryStore> {
        CommissionEngine::new(MemoryStore::default(), "/r/")
    }

    fn order(id: &str, buyer: UserId, net: i64) -> CompletedOrder {
        CompletedOrder {
            order_id: id.into(),
            buyer_id: buyer,
            amount: OrderAmount::Net(net),
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn corrupted_cycle_still_completes_the_order() {
        let engine = engine();
        // 1 -> 2 -> 3 -> 2
        engine.store().force_referrer(1, Some(2));
        engine.store().force_referrer(2, Some(3));
        engine.store().force_referrer(3, Some(2));

        let report = engine.on_order_completed(order("ORD-C", 1, 10_000)).await.unwrap();
        assert!(report.cycle_detected);
        assert_eq!(report.ancestry_depth, 2);
        assert!(report.ledger_written);
        let paid: Vec<_> = report.payouts.iter().map(|l| l.beneficiary_id).collect();
        assert_eq!(paid, vec![2, 3]);
    }

    #[tokio::test]
    async fn gross_amount_is_converted_with_the_snapshot_fee() {
        let engine = engine();
        let mut completed = order("ORD-G", 1, 0);
        completed.amount = OrderAmount::Gross(10_000);
        let report = engine.on_order_completed(completed).await.unwrap();
        assert_eq!(report.net_amount, 9_750);
    }

    #[tokio::test]
    async fn negative_amount_is_rejected() {
        let engine = engine();
        let err = engine
            .on_order_completed(order("ORD-N", 1, -5))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidAmount(-5)));
    }

    #[tokio::test]
    async fn invalid_tier_table_keeps_the_current_version() {
        let engine = engine();
        let mut tiers = TierTable::default();
        tiers.bands.clear();
        let err = engine.update_tier_table(tiers).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(engine.settings().await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn link_is_hidden_until_unlocked() {
        let engine = engine();
        engine.register_user(5, None).await.unwrap();
        assert_eq!(engine.referral_link(5).await.unwrap(), None);
        assert!(!engine.is_unlocked(5).await.unwrap());

        engine.on_order_completed(order("ORD-U", 5, 6_000)).await.unwrap();
        let link = engine.referral_link(5).await.unwrap().unwrap();
        assert!(link.starts_with("/r/"));
        assert!(engine.is_unlocked(5).await.unwrap());
    }
}
