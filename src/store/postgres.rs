//! Postgres store. Every multi-statement operation runs in one transaction;
//! per-order idempotency rests on primary keys with `ON CONFLICT DO NOTHING`
//! and per-user updates lock the user row.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction, types::Json};

use crate::config::Config;
use crate::error::EngineError;
use crate::ledger::{AppendOutcome, CommissionBatch, CommissionLedger, reversal_lines};
use crate::resolver::ReferralGraph;
use crate::settings::{ConfigSnapshot, Settings, TierTable};
use crate::store::{ConfigStore, OrderBook, UserDirectory};
use crate::types::{
    EntryKind, HistoryQuery, LedgerEntry, Listing, OrderId, OrderRecord, Page, PayoutLine,
    ReferralUser, ReferrerRef, UserId,
};
use crate::unlock::{PurchaseOutcome, UnlockState, UnlockTracker};

/// Advisory lock key serializing configuration version writes.
const CONFIG_LOCK_KEY: i64 = 0x5245_4643_4647;

const USER_COLUMNS: &str = "id AS user_id, referred_by, purchase_total, referral_unlocked, \
                            referral_code, unlocked_at, created_at";
const LEDGER_COLUMNS: &str =
    "id, order_id, buyer_id, beneficiary_id, level, amount, kind, config_version, created_at";
const ORDER_COLUMNS: &str =
    "order_id, buyer_id, net_amount, first_order, config_version, completed_at";

#[derive(sqlx::FromRow)]
struct LedgerRow {
    id: i64,
    order_id: String,
    buyer_id: i64,
    beneficiary_id: i64,
    level: i16,
    amount: i64,
    kind: String,
    config_version: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = anyhow::Error;

    fn try_from(row: LedgerRow) -> Result<Self> {
        let kind = EntryKind::parse(&row.kind)
            .ok_or_else(|| anyhow!("unknown ledger entry kind {:?}", row.kind))?;
        Ok(LedgerEntry {
            id: row.id,
            order_id: row.order_id,
            buyer_id: row.buyer_id,
            beneficiary_id: row.beneficiary_id,
            level: u8::try_from(row.level).context("ledger level out of range")?,
            amount: row.amount,
            kind,
            config_version: row.config_version,
            created_at: row.created_at,
        })
    }
}

fn into_entries(rows: Vec<LedgerRow>) -> Result<Vec<LedgerEntry>> {
    rows.into_iter().map(LedgerEntry::try_from).collect()
}

#[derive(sqlx::FromRow)]
struct ConfigRow {
    version: i64,
    settings: Json<Settings>,
    tiers: Json<TierTable>,
    created_at: DateTime<Utc>,
}

impl From<ConfigRow> for ConfigSnapshot {
    fn from(row: ConfigRow) -> Self {
        ConfigSnapshot {
            version: row.version,
            settings: row.settings.0,
            tiers: row.tiers.0,
            created_at: row.created_at,
        }
    }
}

/// Store backed by a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects, applies migrations and writes the first configuration
    /// version if there is none.
    pub async fn connect(config: &Config) -> Result<Self> {
        let url = config
            .database_url
            .as_deref()
            .context("DATABASE_URL is not set")?;
        let pool = crate::init_pool(url, config.database_max_connections).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;
        let store = Self::new(pool);
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        let initial = ConfigSnapshot::initial();
        sqlx::query(
            r#"INSERT INTO referral_config_versions (version, settings, tiers) VALUES ($1, $2, $3)
               ON CONFLICT (version) DO NOTHING"#,
        )
        .bind(initial.version)
        .bind(Json(&initial.settings))
        .bind(Json(&initial.tiers))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn write_config(
        &self,
        next: impl FnOnce(&ConfigSnapshot) -> ConfigSnapshot,
    ) -> Result<Arc<ConfigSnapshot>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CONFIG_LOCK_KEY)
            .execute(tx.as_mut())
            .await?;
        let current = latest_config(&mut tx).await?;
        let snapshot = next(&current);
        let row = sqlx::query_as::<_, ConfigRow>(
            r#"INSERT INTO referral_config_versions (version, settings, tiers) VALUES ($1, $2, $3)
               RETURNING version, settings, tiers, created_at"#,
        )
        .bind(snapshot.version)
        .bind(Json(&snapshot.settings))
        .bind(Json(&snapshot.tiers))
        .fetch_one(tx.as_mut())
        .await?;
        tx.commit().await?;
        Ok(Arc::new(row.into()))
    }
}

async fn latest_config(tx: &mut Transaction<'_, Postgres>) -> Result<ConfigSnapshot> {
    let row = sqlx::query_as::<_, ConfigRow>(
        r#"SELECT version, settings, tiers, created_at FROM referral_config_versions
           ORDER BY version DESC LIMIT 1"#,
    )
    .fetch_optional(tx.as_mut())
    .await?
    .context("no referral configuration stored")?;
    Ok(row.into())
}

async fn ensure_user(tx: &mut Transaction<'_, Postgres>, user_id: UserId) -> Result<()> {
    sqlx::query(r#"INSERT INTO referral_users (id) VALUES ($1) ON CONFLICT (id) DO NOTHING"#)
        .bind(user_id)
        .execute(tx.as_mut())
        .await?;
    Ok(())
}

async fn lock_user(tx: &mut Transaction<'_, Postgres>, user_id: UserId) -> Result<ReferralUser> {
    let user = sqlx::query_as::<_, ReferralUser>(&format!(
        "SELECT {USER_COLUMNS} FROM referral_users WHERE id = $1 FOR UPDATE"
    ))
    .bind(user_id)
    .fetch_one(tx.as_mut())
    .await?;
    Ok(user)
}

async fn entries_for(
    tx: &mut Transaction<'_, Postgres>,
    order_id: &OrderId,
    kind: EntryKind,
) -> Result<Vec<LedgerEntry>> {
    let rows = sqlx::query_as::<_, LedgerRow>(&format!(
        "SELECT {LEDGER_COLUMNS} FROM commission_ledger WHERE order_id = $1 AND kind = $2 \
         ORDER BY level"
    ))
    .bind(order_id)
    .bind(kind.as_str())
    .fetch_all(tx.as_mut())
    .await?;
    into_entries(rows)
}

async fn insert_lines(
    tx: &mut Transaction<'_, Postgres>,
    order_id: &OrderId,
    buyer_id: UserId,
    config_version: i64,
    kind: EntryKind,
    lines: &[PayoutLine],
) -> Result<Vec<LedgerEntry>> {
    let mut entries = Vec::with_capacity(lines.len());
    for line in lines {
        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            "INSERT INTO commission_ledger \
             (order_id, buyer_id, beneficiary_id, level, amount, kind, config_version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {LEDGER_COLUMNS}"
        ))
        .bind(order_id)
        .bind(buyer_id)
        .bind(line.beneficiary_id)
        .bind(i16::from(line.level))
        .bind(line.amount)
        .bind(kind.as_str())
        .bind(config_version)
        .fetch_one(tx.as_mut())
        .await?;
        entries.push(row.try_into()?);
    }
    Ok(entries)
}

impl ReferralGraph for PgStore {
    async fn referrer_of(&self, user_id: UserId) -> Result<Option<UserId>> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as(r#"SELECT referred_by FROM referral_users WHERE id = $1"#)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|r| r.0))
    }
}

impl ConfigStore for PgStore {
    async fn current_config(&self) -> Result<Arc<ConfigSnapshot>> {
        let mut tx = self.pool.begin().await?;
        let snapshot = latest_config(&mut tx).await?;
        tx.commit().await?;
        Ok(Arc::new(snapshot))
    }

    async fn update_settings(&self, settings: Settings) -> Result<Arc<ConfigSnapshot>> {
        self.write_config(|current| current.with_settings(settings))
            .await
    }

    async fn update_tiers(&self, tiers: TierTable) -> Result<Arc<ConfigSnapshot>> {
        self.write_config(|current| current.with_tiers(tiers)).await
    }

    async fn config_at(&self, version: i64) -> Result<Option<Arc<ConfigSnapshot>>> {
        let row = sqlx::query_as::<_, ConfigRow>(
            r#"SELECT version, settings, tiers, created_at FROM referral_config_versions
               WHERE version = $1"#,
        )
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load configuration version")?;
        Ok(row.map(|r| Arc::new(r.into())))
    }
}

impl OrderBook for PgStore {
    async fn record_order(
        &self,
        order_id: &OrderId,
        buyer_id: UserId,
        net_amount: i64,
        config_version: i64,
        completed_at: DateTime<Utc>,
    ) -> Result<OrderRecord> {
        let mut tx = self.pool.begin().await?;
        ensure_user(&mut tx, buyer_id).await?;
        // serializes first-order decisions for this buyer
        lock_user(&mut tx, buyer_id).await?;

        let existing = sqlx::query_as::<_, OrderRecord>(&format!(
            "SELECT {ORDER_COLUMNS} FROM completed_orders WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(tx.as_mut())
        .await?;
        if let Some(record) = existing {
            tx.commit().await?;
            return Ok(record);
        }

        let (prior,): (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM completed_orders WHERE buyer_id = $1"#)
                .bind(buyer_id)
                .fetch_one(tx.as_mut())
                .await?;

        sqlx::query(
            r#"INSERT INTO completed_orders
                   (order_id, buyer_id, net_amount, first_order, config_version, completed_at)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (order_id) DO NOTHING"#,
        )
        .bind(order_id)
        .bind(buyer_id)
        .bind(net_amount)
        .bind(prior == 0)
        .bind(config_version)
        .bind(completed_at)
        .execute(tx.as_mut())
        .await?;

        // re-read so a concurrent insert under another buyer wins consistently
        let record = sqlx::query_as::<_, OrderRecord>(&format!(
            "SELECT {ORDER_COLUMNS} FROM completed_orders WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_one(tx.as_mut())
        .await?;
        tx.commit().await?;
        Ok(record)
    }
}

impl CommissionLedger for PgStore {
    async fn append_if_absent(&self, batch: CommissionBatch) -> Result<AppendOutcome> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(
            r#"INSERT INTO commission_orders (order_id, buyer_id, config_version, buyer_discount)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (order_id) DO NOTHING"#,
        )
        .bind(&batch.order_id)
        .bind(batch.buyer_id)
        .bind(batch.config_version)
        .bind(batch.buyer_discount)
        .execute(tx.as_mut())
        .await?;

        if res.rows_affected() == 0 {
            let (buyer_discount, config_version): (i64, i64) = sqlx::query_as(
                r#"SELECT buyer_discount, config_version FROM commission_orders
                   WHERE order_id = $1"#,
            )
            .bind(&batch.order_id)
            .fetch_one(tx.as_mut())
            .await?;
            let entries = entries_for(&mut tx, &batch.order_id, EntryKind::Commission).await?;
            tx.commit().await?;
            return Ok(AppendOutcome {
                written: false,
                entries,
                buyer_discount,
                config_version,
            });
        }

        let entries = insert_lines(
            &mut tx,
            &batch.order_id,
            batch.buyer_id,
            batch.config_version,
            EntryKind::Commission,
            &batch.lines,
        )
        .await?;
        tx.commit().await?;
        Ok(AppendOutcome {
            written: true,
            entries,
            buyer_discount: batch.buyer_discount,
            config_version: batch.config_version,
        })
    }

    async fn append_reversal(&self, order_id: &OrderId) -> Result<Option<AppendOutcome>> {
        let mut tx = self.pool.begin().await?;
        let claimed: Option<(i64, i64, i64)> = sqlx::query_as(
            r#"UPDATE commission_orders SET reversed_at = NOW()
               WHERE order_id = $1 AND reversed_at IS NULL
               RETURNING buyer_id, config_version, buyer_discount"#,
        )
        .bind(order_id)
        .fetch_optional(tx.as_mut())
        .await?;

        let Some((buyer_id, config_version, buyer_discount)) = claimed else {
            let header: Option<(i64, i64)> = sqlx::query_as(
                r#"SELECT config_version, buyer_discount FROM commission_orders
                   WHERE order_id = $1"#,
            )
            .bind(order_id)
            .fetch_optional(tx.as_mut())
            .await?;
            let Some((config_version, buyer_discount)) = header else {
                tx.commit().await?;
                return Ok(None);
            };
            let entries = entries_for(&mut tx, order_id, EntryKind::Reversal).await?;
            tx.commit().await?;
            return Ok(Some(AppendOutcome {
                written: false,
                entries,
                buyer_discount,
                config_version,
            }));
        };

        let originals = entries_for(&mut tx, order_id, EntryKind::Commission).await?;
        let entries = insert_lines(
            &mut tx,
            order_id,
            buyer_id,
            config_version,
            EntryKind::Reversal,
            &reversal_lines(&originals),
        )
        .await?;
        tx.commit().await?;
        Ok(Some(AppendOutcome {
            written: true,
            entries,
            buyer_discount,
            config_version,
        }))
    }

    async fn list_history(&self, query: &HistoryQuery) -> Result<Listing<LedgerEntry>> {
        // the page and its total must come from one snapshot
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(tx.as_mut())
            .await?;

        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM commission_ledger \
             WHERE ($1::BIGINT IS NULL OR id < $1) \
             ORDER BY id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(query.before)
        .bind(i64::from(query.page.per_page))
        .bind(i64::try_from(query.page.offset()).unwrap_or(i64::MAX))
        .fetch_all(tx.as_mut())
        .await
        .context("Failed to list commission history")?;

        let (total,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM commission_ledger WHERE ($1::BIGINT IS NULL OR id < $1)"#,
        )
        .bind(query.before)
        .fetch_one(tx.as_mut())
        .await?;
        tx.commit().await?;

        Ok(Listing {
            items: into_entries(rows)?,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }
}

impl UnlockTracker for PgStore {
    async fn record_purchase(
        &self,
        user_id: UserId,
        order_id: &OrderId,
        amount: i64,
        threshold: i64,
    ) -> Result<PurchaseOutcome> {
        let mut tx = self.pool.begin().await?;
        ensure_user(&mut tx, user_id).await?;
        let mut user = lock_user(&mut tx, user_id).await?;

        let credit = sqlx::query(
            r#"INSERT INTO purchase_credits (order_id, user_id, amount) VALUES ($1, $2, $3)
               ON CONFLICT (order_id) DO NOTHING"#,
        )
        .bind(order_id)
        .bind(user_id)
        .bind(amount)
        .execute(tx.as_mut())
        .await?;

        if credit.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(PurchaseOutcome {
                user_id,
                purchase_total: user.purchase_total,
                referral_unlocked: user.referral_unlocked,
                newly_unlocked: false,
                credited: false,
            });
        }

        let (next, newly_unlocked) = UnlockState::of(&user).credit(amount, threshold, Utc::now());
        next.apply_to(&mut user);
        sqlx::query(
            r#"UPDATE referral_users
               SET purchase_total = $2, referral_unlocked = $3, referral_code = $4, unlocked_at = $5
               WHERE id = $1"#,
        )
        .bind(user_id)
        .bind(user.purchase_total)
        .bind(user.referral_unlocked)
        .bind(&user.referral_code)
        .bind(user.unlocked_at)
        .execute(tx.as_mut())
        .await?;
        tx.commit().await?;

        Ok(PurchaseOutcome {
            user_id,
            purchase_total: user.purchase_total,
            referral_unlocked: user.referral_unlocked,
            newly_unlocked,
            credited: true,
        })
    }

    async fn referral_user(&self, user_id: UserId) -> Result<Option<ReferralUser>> {
        let user = sqlx::query_as::<_, ReferralUser>(&format!(
            "SELECT {USER_COLUMNS} FROM referral_users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn list_referral_users(&self, page: Page) -> Result<Listing<ReferralUser>> {
        let items = sqlx::query_as::<_, ReferralUser>(&format!(
            "SELECT {USER_COLUMNS} FROM referral_users ORDER BY id LIMIT $1 OFFSET $2"
        ))
        .bind(i64::from(page.per_page))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        let (total,): (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM referral_users"#)
            .fetch_one(&self.pool)
            .await?;
        Ok(Listing {
            items,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }
}

impl UserDirectory for PgStore {
    async fn register_user(
        &self,
        user_id: UserId,
        referrer: Option<ReferrerRef>,
    ) -> Result<ReferralUser, EngineError> {
        let mut tx = self.pool.begin().await.context("Failed to begin")?;
        let referred_by = match referrer {
            None => None,
            Some(ReferrerRef::User(id)) if id == user_id => return Err(EngineError::SelfReferral),
            Some(ReferrerRef::User(id)) => {
                let found: Option<(i64,)> =
                    sqlx::query_as(r#"SELECT id FROM referral_users WHERE id = $1"#)
                        .bind(id)
                        .fetch_optional(tx.as_mut())
                        .await
                        .context("Failed to look up referrer")?;
                found.ok_or(EngineError::UnknownReferrer(id))?;
                Some(id)
            }
            Some(ReferrerRef::Code(code)) => {
                let found: Option<(i64,)> = sqlx::query_as(
                    r#"SELECT id FROM referral_users
                       WHERE referral_code = $1 AND referral_unlocked"#,
                )
                .bind(&code)
                .fetch_optional(tx.as_mut())
                .await
                .context("Failed to look up referral code")?;
                Some(found.ok_or(EngineError::UnknownReferralCode(code))?.0)
            }
        };

        let user = sqlx::query_as::<_, ReferralUser>(&format!(
            "INSERT INTO referral_users (id, referred_by) VALUES ($1, $2) \
             ON CONFLICT (id) DO NOTHING RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(referred_by)
        .fetch_optional(tx.as_mut())
        .await
        .context("Failed to insert user")?
        .ok_or(EngineError::UserExists(user_id))?;
        tx.commit().await.context("Failed to commit")?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::CommissionModel;

    async fn store() -> PgStore {
        let config = Config {
            server_port: 0,
            database_url: std::env::var("DATABASE_URL").ok(),
            database_max_connections: 4,
            referral_link_base: "/r/".into(),
        };
        PgStore::connect(&config).await.unwrap()
    }

    fn unique_id() -> i64 {
        // keeps reruns against the same database from colliding
        i64::from(uuid::Uuid::new_v4().as_fields().0 >> 1)
    }

    #[tokio::test]
    #[ignore] // needs a live database
    async fn ledger_append_is_idempotent() {
        let store = store().await;
        let order_id: OrderId = format!("ORD-{}", unique_id());
        let batch = CommissionBatch {
            order_id: order_id.clone(),
            buyer_id: unique_id(),
            config_version: 1,
            buyer_discount: 0,
            lines: vec![PayoutLine {
                beneficiary_id: unique_id(),
                level: 1,
                amount: 100,
            }],
        };
        let first = store.append_if_absent(batch.clone()).await.unwrap();
        let second = store.append_if_absent(batch).await.unwrap();
        assert!(first.written);
        assert!(!second.written);
        assert_eq!(first.entries, second.entries);
    }

    #[tokio::test]
    #[ignore] // needs a live database
    async fn settings_update_writes_a_new_version() {
        let store = store().await;
        let before = store.current_config().await.unwrap();
        let after = store
            .update_settings(Settings {
                commission_model: CommissionModel::ModelB,
                ..before.settings.clone()
            })
            .await
            .unwrap();
        assert_eq!(after.version, before.version + 1);
        assert_eq!(after.settings.commission_model, CommissionModel::ModelB);
    }

    #[tokio::test]
    #[ignore] // needs a live database
    async fn order_keeps_its_first_config_version() {
        let store = store().await;
        let order_id: OrderId = format!("ORD-{}", unique_id());
        let buyer = unique_id();
        let first = store
            .record_order(&order_id, buyer, 8_000, 1, Utc::now())
            .await
            .unwrap();
        let retry = store
            .record_order(&order_id, buyer, 8_000, 2, Utc::now())
            .await
            .unwrap();
        assert_eq!(first.config_version, 1);
        assert_eq!(retry.config_version, 1);

        let pinned = store.config_at(1).await.unwrap().unwrap();
        assert_eq!(pinned.version, 1);
        assert!(store.config_at(i64::MAX).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // needs a live database
    async fn history_page_and_total_agree() {
        let store = store().await;
        let query = HistoryQuery {
            page: Page::new(Some(1), Some(5)),
            before: None,
        };
        let listing = store.list_history(&query).await.unwrap();
        assert!(listing.items.len() as u64 <= listing.total);
        assert!(listing.items.len() <= 5);
    }

    #[tokio::test]
    #[ignore] // needs a live database
    async fn purchases_unlock_once() {
        let store = store().await;
        let user = unique_id();
        let a = store
            .record_purchase(user, &format!("A-{user}"), 600, 1_000)
            .await
            .unwrap();
        let b = store
            .record_purchase(user, &format!("B-{user}"), 600, 1_000)
            .await
            .unwrap();
        let b_again = store
            .record_purchase(user, &format!("B-{user}"), 600, 1_000)
            .await
            .unwrap();
        assert!(!a.referral_unlocked);
        assert!(b.newly_unlocked);
        assert!(!b_again.credited);
        assert_eq!(b_again.purchase_total, 1_200);
    }
}
