//! Storage backends for the engine.

mod memory;
mod postgres;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::EngineError;
use crate::ledger::CommissionLedger;
use crate::resolver::ReferralGraph;
use crate::settings::{ConfigSnapshot, Settings, TierTable};
use crate::types::{OrderId, OrderRecord, ReferralUser, ReferrerRef, UserId};
use crate::unlock::UnlockTracker;

/// Versioned settings and tier table. Updates append a new version; readers
/// hold on to the snapshot they fetched.
pub trait ConfigStore {
    fn current_config(&self) -> impl Future<Output = Result<Arc<ConfigSnapshot>>> + Send;

    /// A past or current version, or `None` if it was never written.
    fn config_at(
        &self,
        version: i64,
    ) -> impl Future<Output = Result<Option<Arc<ConfigSnapshot>>>> + Send;

    fn update_settings(
        &self,
        settings: Settings,
    ) -> impl Future<Output = Result<Arc<ConfigSnapshot>>> + Send;

    fn update_tiers(
        &self,
        tiers: TierTable,
    ) -> impl Future<Output = Result<Arc<ConfigSnapshot>>> + Send;
}

/// Completed orders seen by the engine.
pub trait OrderBook {
    /// Records the order if it is new and returns the stored record.
    ///
    /// `first_order` is decided here, under a per-buyer serialization point, by
    /// counting the buyer's other recorded orders. A retried order gets back
    /// the record from its first call, including the configuration version it
    /// was first priced with. Unknown buyers are registered without a referrer.
    fn record_order(
        &self,
        order_id: &OrderId,
        buyer_id: UserId,
        net_amount: i64,
        config_version: i64,
        completed_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<OrderRecord>> + Send;
}

/// User registration with an immutable referrer.
pub trait UserDirectory {
    fn register_user(
        &self,
        user_id: UserId,
        referrer: Option<ReferrerRef>,
    ) -> impl Future<Output = Result<ReferralUser, EngineError>> + Send;
}

/// Everything the engine needs from storage.
pub trait CommissionStore:
    ReferralGraph
    + ConfigStore
    + OrderBook
    + CommissionLedger
    + UnlockTracker
    + UserDirectory
    + Clone
    + Send
    + Sync
    + 'static
{
}

impl<T> CommissionStore for T where
    T: ReferralGraph
        + ConfigStore
        + OrderBook
        + CommissionLedger
        + UnlockTracker
        + UserDirectory
        + Clone
        + Send
        + Sync
        + 'static
{
}
