//! The append-only commission ledger.

use std::future::Future;

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;

use crate::types::{HistoryQuery, LedgerEntry, Listing, OrderId, PayoutLine, UserId};

/// Everything persisted for one order's commissions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommissionBatch {
    pub order_id: OrderId,
    pub buyer_id: UserId,
    pub config_version: i64,
    pub buyer_discount: i64,
    pub lines: Vec<PayoutLine>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AppendOutcome {
    /// False when a batch for the order already existed.
    pub written: bool,
    /// The entries persisted for the order, whichever call wrote them.
    pub entries: Vec<LedgerEntry>,
    /// Buyer discount stored with the order's commission batch.
    pub buyer_discount: i64,
    /// Configuration version the stored batch was computed with.
    pub config_version: i64,
}

/// Ledger storage. The order id is the idempotency key: at most one
/// commission batch and at most one reversal batch exist per order, and
/// concurrent appends for the same order have exactly one winner.
pub trait CommissionLedger {
    fn append_if_absent(
        &self,
        batch: CommissionBatch,
    ) -> impl Future<Output = Result<AppendOutcome>> + Send;

    /// Appends negated copies of the order's commission entries. Returns `None`
    /// when the order was never ledgered.
    fn append_reversal(
        &self,
        order_id: &OrderId,
    ) -> impl Future<Output = Result<Option<AppendOutcome>>> + Send;

    /// Entries ordered newest first.
    fn list_history(
        &self,
        query: &HistoryQuery,
    ) -> impl Future<Output = Result<Listing<LedgerEntry>>> + Send;
}

/// Entries of one order created on one day.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistoryGroup {
    pub order_id: OrderId,
    pub buyer_id: UserId,
    pub date: NaiveDate,
    pub total: i64,
    pub entries: Vec<LedgerEntry>,
}

/// Groups a page of entries by order and creation date, keeping the page's
/// newest-first order.
pub fn group_by_order(entries: Vec<LedgerEntry>) -> Vec<HistoryGroup> {
    let mut groups: Vec<HistoryGroup> = Vec::new();
    for entry in entries {
        let date = entry.created_at.date_naive();
        match groups
            .iter_mut()
            .find(|g| g.order_id == entry.order_id && g.date == date)
        {
            Some(group) => {
                group.total += entry.amount;
                group.entries.push(entry);
            }
            None => groups.push(HistoryGroup {
                order_id: entry.order_id.clone(),
                buyer_id: entry.buyer_id,
                date,
                total: entry.amount,
                entries: vec![entry],
            }),
        }
    }
    groups
}

/// Negated copies of commission entries, as reversal lines.
pub fn reversal_lines(entries: &[LedgerEntry]) -> Vec<PayoutLine> {
    entries
        .iter()
        .map(|e| PayoutLine {
            beneficiary_id: e.beneficiary_id,
            level: e.level,
            amount: -e.amount,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryKind;
    use chrono::{TimeZone, Utc};

    fn entry(id: i64, order: &str, day: u32, amount: i64) -> LedgerEntry {
        LedgerEntry {
            id,
            order_id: order.into(),
            buyer_id: 1,
            beneficiary_id: 10 + id,
            level: 1,
            amount,
            kind: EntryKind::Commission,
            config_version: 1,
            created_at: Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn groups_keep_newest_first_order() {
        let groups = group_by_order(vec![
            entry(4, "ORD-2", 2, 50),
            entry(3, "ORD-2", 2, 25),
            entry(2, "ORD-1", 1, 100),
            entry(1, "ORD-1", 1, 40),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].order_id, "ORD-2");
        assert_eq!(groups[0].total, 75);
        assert_eq!(groups[1].total, 140);
        assert_eq!(groups[1].entries.len(), 2);
    }

    #[test]
    fn same_order_on_different_days_is_split() {
        let groups = group_by_order(vec![entry(2, "ORD-1", 5, -100), entry(1, "ORD-1", 1, 100)]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].total, -100);
    }

    #[test]
    fn reversal_negates_amounts() {
        let lines = reversal_lines(&[entry(1, "ORD-1", 1, 100)]);
        assert_eq!(lines[0].amount, -100);
        assert_eq!(lines[0].beneficiary_id, 11);
    }
}
