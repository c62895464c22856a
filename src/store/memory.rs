//! In-process store. Each concern sits behind its own lock and no lock is held
//! across an await or while another is taken.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::Result;
use chrono::{DateTime, Utc};

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

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct UserBook {
    users: HashMap<UserId, ReferralUser>,
    codes: HashMap<String, UserId>,
    credited: HashSet<OrderId>,
}

impl UserBook {
    fn get_or_create(&mut self, user_id: UserId) -> &mut ReferralUser {
        self.users
            .entry(user_id)
            .or_insert_with(|| new_user(user_id, None))
    }
}

#[derive(Default)]
struct Orders {
    by_id: HashMap<OrderId, OrderRecord>,
    per_buyer: HashMap<UserId, u64>,
}

struct BatchHeader {
    buyer_discount: i64,
    config_version: i64,
    entry_ids: Vec<i64>,
}

#[derive(Default)]
struct Ledger {
    next_id: i64,
    entries: Vec<LedgerEntry>,
    batches: HashMap<OrderId, BatchHeader>,
    reversals: HashMap<OrderId, Vec<i64>>,
}

impl Ledger {
    fn push_lines(
        &mut self,
        order_id: &OrderId,
        buyer_id: UserId,
        config_version: i64,
        kind: EntryKind,
        lines: &[PayoutLine],
    ) -> Vec<LedgerEntry> {
        let now = Utc::now();
        let start = self.entries.len();
        for line in lines {
            self.next_id += 1;
            self.entries.push(LedgerEntry {
                id: self.next_id,
                order_id: order_id.clone(),
                buyer_id,
                beneficiary_id: line.beneficiary_id,
                level: line.level,
                amount: line.amount,
                kind,
                config_version,
                created_at: now,
            });
        }
        self.entries[start..].to_vec()
    }

    fn entries_by_id(&self, ids: &[i64]) -> Vec<LedgerEntry> {
        self.entries
            .iter()
            .filter(|e| ids.contains(&e.id))
            .cloned()
            .collect()
    }
}

fn new_user(user_id: UserId, referred_by: Option<UserId>) -> ReferralUser {
    ReferralUser {
        user_id,
        referred_by,
        purchase_total: 0,
        referral_unlocked: false,
        referral_code: None,
        unlocked_at: None,
        created_at: Utc::now(),
    }
}

/// The live snapshot plus every version it replaced.
struct ConfigVersions {
    current: Arc<ConfigSnapshot>,
    past: HashMap<i64, Arc<ConfigSnapshot>>,
}

struct Inner {
    config: RwLock<ConfigVersions>,
    users: Mutex<UserBook>,
    orders: Mutex<Orders>,
    ledger: Mutex<Ledger>,
}

/// Store kept entirely in memory. Cloning shares the same state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(ConfigSnapshot::initial())
    }
}

impl MemoryStore {
    pub fn new(config: ConfigSnapshot) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(ConfigVersions {
                    current: Arc::new(config),
                    past: HashMap::new(),
                }),
                users: Mutex::new(UserBook::default()),
                orders: Mutex::new(Orders::default()),
                ledger: Mutex::new(Ledger::default()),
            }),
        }
    }

    /// Overwrites a user's referrer. Only for seeding corrupt graphs in tests.
    #[cfg(test)]
    pub(crate) fn force_referrer(&self, user_id: UserId, referred_by: Option<UserId>) {
        lock(&self.inner.users).get_or_create(user_id).referred_by = referred_by;
    }

    fn swap_config(
        &self,
        next: impl FnOnce(&ConfigSnapshot) -> ConfigSnapshot,
    ) -> Arc<ConfigSnapshot> {
        let mut guard = self
            .inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let snapshot = Arc::new(next(&guard.current));
        let replaced = std::mem::replace(&mut guard.current, snapshot.clone());
        guard.past.insert(replaced.version, replaced);
        snapshot
    }
}

impl ReferralGraph for MemoryStore {
    async fn referrer_of(&self, user_id: UserId) -> Result<Option<UserId>> {
        Ok(lock(&self.inner.users)
            .users
            .get(&user_id)
            .and_then(|u| u.referred_by))
    }
}

impl ConfigStore for MemoryStore {
    async fn current_config(&self) -> Result<Arc<ConfigSnapshot>> {
        let guard = self
            .inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(guard.current.clone())
    }

    async fn config_at(&self, version: i64) -> Result<Option<Arc<ConfigSnapshot>>> {
        let guard = self
            .inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.current.version == version {
            return Ok(Some(guard.current.clone()));
        }
        Ok(guard.past.get(&version).cloned())
    }

    async fn update_settings(&self, settings: Settings) -> Result<Arc<ConfigSnapshot>> {
        Ok(self.swap_config(|current| current.with_settings(settings)))
    }

    async fn update_tiers(&self, tiers: TierTable) -> Result<Arc<ConfigSnapshot>> {
        Ok(self.swap_config(|current| current.with_tiers(tiers)))
    }
}

impl OrderBook for MemoryStore {
    async fn record_order(
        &self,
        order_id: &OrderId,
        buyer_id: UserId,
        net_amount: i64,
        config_version: i64,
        completed_at: DateTime<Utc>,
    ) -> Result<OrderRecord> {
        let record = {
            let mut orders = lock(&self.inner.orders);
            if let Some(existing) = orders.by_id.get(order_id) {
                return Ok(existing.clone());
            }
            let seen = orders.per_buyer.entry(buyer_id).or_insert(0);
            let record = OrderRecord {
                order_id: order_id.clone(),
                buyer_id,
                net_amount,
                first_order: *seen == 0,
                config_version,
                completed_at,
            };
            *seen += 1;
            orders.by_id.insert(order_id.clone(), record.clone());
            record
        };
        lock(&self.inner.users).get_or_create(buyer_id);
        Ok(record)
    }
}

impl CommissionLedger for MemoryStore {
    async fn append_if_absent(&self, batch: CommissionBatch) -> Result<AppendOutcome> {
        let mut ledger = lock(&self.inner.ledger);
        if let Some(header) = ledger.batches.get(&batch.order_id) {
            return Ok(AppendOutcome {
                written: false,
                entries: ledger.entries_by_id(&header.entry_ids),
                buyer_discount: header.buyer_discount,
                config_version: header.config_version,
            });
        }
        let entries = ledger.push_lines(
            &batch.order_id,
            batch.buyer_id,
            batch.config_version,
            EntryKind::Commission,
            &batch.lines,
        );
        let header = BatchHeader {
            buyer_discount: batch.buyer_discount,
            config_version: batch.config_version,
            entry_ids: entries.iter().map(|e| e.id).collect(),
        };
        ledger.batches.insert(batch.order_id, header);
        Ok(AppendOutcome {
            written: true,
            entries,
            buyer_discount: batch.buyer_discount,
            config_version: batch.config_version,
        })
    }

    async fn append_reversal(&self, order_id: &OrderId) -> Result<Option<AppendOutcome>> {
        let mut ledger = lock(&self.inner.ledger);
        let Some(header) = ledger.batches.get(order_id) else {
            return Ok(None);
        };
        let ids = header.entry_ids.clone();
        let (buyer_discount, config_version) = (header.buyer_discount, header.config_version);
        if let Some(done) = ledger.reversals.get(order_id) {
            return Ok(Some(AppendOutcome {
                written: false,
                entries: ledger.entries_by_id(done),
                buyer_discount,
                config_version,
            }));
        }
        let originals = ledger.entries_by_id(&ids);
        let lines = reversal_lines(&originals);
        let buyer_id = originals.first().map(|e| e.buyer_id).unwrap_or_default();
        let entries = ledger.push_lines(
            order_id,
            buyer_id,
            config_version,
            EntryKind::Reversal,
            &lines,
        );
        let ids = entries.iter().map(|e| e.id).collect();
        ledger.reversals.insert(order_id.clone(), ids);
        Ok(Some(AppendOutcome {
            written: true,
            entries,
            buyer_discount,
            config_version,
        }))
    }

    async fn list_history(&self, query: &HistoryQuery) -> Result<Listing<LedgerEntry>> {
        let ledger = lock(&self.inner.ledger);
        let matching = ledger
            .entries
            .iter()
            .rev()
            .filter(|e| query.before.is_none_or(|before| e.id < before));
        let total = matching.clone().count() as u64;
        let items = matching
            .skip(query.page.offset() as usize)
            .take(query.page.per_page as usize)
            .cloned()
            .collect();
        Ok(Listing { items, total })
    }
}

impl UnlockTracker for MemoryStore {
    async fn record_purchase(
        &self,
        user_id: UserId,
        order_id: &OrderId,
        amount: i64,
        threshold: i64,
    ) -> Result<PurchaseOutcome> {
        let mut book = lock(&self.inner.users);
        if book.credited.contains(order_id) {
            let user = book.get_or_create(user_id);
            return Ok(PurchaseOutcome {
                user_id,
                purchase_total: user.purchase_total,
                referral_unlocked: user.referral_unlocked,
                newly_unlocked: false,
                credited: false,
            });
        }

        let user = book.get_or_create(user_id);
        let (next, newly_unlocked) = UnlockState::of(user).credit(amount, threshold, Utc::now());
        let code = next.referral_code.clone();
        next.apply_to(user);
        let outcome = PurchaseOutcome {
            user_id,
            purchase_total: user.purchase_total,
            referral_unlocked: user.referral_unlocked,
            newly_unlocked,
            credited: true,
        };
        if let (true, Some(code)) = (newly_unlocked, code) {
            book.codes.insert(code, user_id);
        }
        book.credited.insert(order_id.clone());
        Ok(outcome)
    }

    async fn referral_user(&self, user_id: UserId) -> Result<Option<ReferralUser>> {
        Ok(lock(&self.inner.users).users.get(&user_id).cloned())
    }

    async fn list_referral_users(&self, page: Page) -> Result<Listing<ReferralUser>> {
        let book = lock(&self.inner.users);
        let mut users: Vec<&ReferralUser> = book.users.values().collect();
        users.sort_by_key(|u| u.user_id);
        let items = users
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.per_page as usize)
            .cloned()
            .collect();
        Ok(Listing {
            items,
            total: book.users.len() as u64,
        })
    }
}

impl UserDirectory for MemoryStore {
    async fn register_user(
        &self,
        user_id: UserId,
        referrer: Option<ReferrerRef>,
    ) -> Result<ReferralUser, EngineError> {
        let mut book = lock(&self.inner.users);
        if book.users.contains_key(&user_id) {
            return Err(EngineError::UserExists(user_id));
        }
        let referred_by = match referrer {
            None => None,
            Some(ReferrerRef::User(id)) if id == user_id => {
                return Err(EngineError::SelfReferral);
            }
            Some(ReferrerRef::User(id)) => {
                if !book.users.contains_key(&id) {
                    return Err(EngineError::UnknownReferrer(id));
                }
                Some(id)
            }
            Some(ReferrerRef::Code(code)) => match book.codes.get(&code) {
                Some(id) => Some(*id),
                None => return Err(EngineError::UnknownReferralCode(code)),
            },
        };
        let user = new_user(user_id, referred_by);
        book.users.insert(user_id, user.clone());
        Ok(user)
    }
}
