//! Multi-level referral commissions for a multi-seller marketplace.
//!
//! A completed order is resolved against the buyer's referral chain (up to
//! eight ancestors), priced against a versioned tier table, fitted under the
//! payout pool and written to an append-only ledger exactly once.

mod api;
pub mod calculator;
mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod resolver;
mod responses;
pub mod settings;
pub mod store;
pub mod types;
pub mod unlock;

use anyhow::{Context, Result};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use sqlx::{PgPool, postgres::PgPoolOptions};

pub use api::{AppState, init_router};
pub use config::Config;
pub use engine::{CommissionEngine, IntakeReport, UserReferralView};
pub use error::EngineError;
pub use store::{CommissionStore, MemoryStore, PgStore};

/// Initializes the database pool.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}

/// `percent` of `amount`, rounded down to a whole minor unit.
pub fn percent_of(amount: i64, percent: Decimal) -> i64 {
    (Decimal::from(amount) * percent / Decimal::ONE_HUNDRED)
        .floor()
        .to_i64()
        .unwrap_or(0)
}
