use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a marketplace user.
pub type UserId = i64;

/// Identifier of a completed order, as issued by the checkout system.
pub type OrderId = String;

/// The amount reported for a completed order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderAmount {
    /// Already net of the payment gateway fee.
    Net(i64),
    /// Before the gateway fee; converted with the current fee percent.
    Gross(i64),
}

impl OrderAmount {
    pub fn value(&self) -> i64 {
        match self {
            OrderAmount::Net(v) | OrderAmount::Gross(v) => *v,
        }
    }
}

/// An order-completion event submitted by the checkout system.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletedOrder {
    /// The ID of the order.
    pub order_id: OrderId,
    /// The ID of the user who placed the order.
    pub buyer_id: UserId,
    /// The order amount.
    pub amount: OrderAmount,
    /// When the order completed.
    pub completed_at: DateTime<Utc>,
}

/// A completed order as persisted by the engine.
///
/// `first_order` and `config_version` are captured once, when the order is
/// first recorded, and are never recomputed on retries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub buyer_id: UserId,
    pub net_amount: i64,
    pub first_order: bool,
    /// Configuration version current when the order was first seen.
    pub config_version: i64,
    pub completed_at: DateTime<Utc>,
}

/// One ancestor in a buyer's referral chain. Level 1 is the direct referrer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ancestor {
    pub user_id: UserId,
    pub level: u8,
}

/// A computed commission owed to one ancestor for one order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutLine {
    pub beneficiary_id: UserId,
    pub level: u8,
    pub amount: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Commission,
    Reversal,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Commission => "commission",
            EntryKind::Reversal => "reversal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "commission" => Some(EntryKind::Commission),
            "reversal" => Some(EntryKind::Reversal),
            _ => None,
        }
    }
}

/// An immutable commission ledger row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Monotonic entry id; newer entries have larger ids.
    pub id: i64,
    pub order_id: OrderId,
    pub buyer_id: UserId,
    pub beneficiary_id: UserId,
    pub level: u8,
    /// Negative for reversal entries.
    pub amount: i64,
    pub kind: EntryKind,
    /// Configuration version the amount was computed with.
    pub config_version: i64,
    pub created_at: DateTime<Utc>,
}

/// A user's referral standing, as shown to administrators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReferralUser {
    pub user_id: UserId,
    pub referred_by: Option<UserId>,
    pub purchase_total: i64,
    pub referral_unlocked: bool,
    /// Present only once the user is unlocked.
    pub referral_code: Option<String>,
    pub unlocked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// How a new user names their referrer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferrerRef {
    User(UserId),
    Code(String),
}

/// Offset paging parameters. Pages are 1-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub per_page: u32,
}

impl Page {
    pub const MAX_PER_PAGE: u32 = 100;

    pub fn new(page: Option<u32>, per_page: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            per_page: per_page.unwrap_or(20).clamp(1, Self::MAX_PER_PAGE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.per_page)
    }
}

/// Commission history request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryQuery {
    pub page: Page,
    /// Only entries with an id strictly below this cursor. When set, `page`
    /// offsets are applied after the cursor.
    pub before: Option<i64>,
}

/// A slice of a larger listing plus the total row count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub total: u64,
}
