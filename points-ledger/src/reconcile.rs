//! Balance reconciliation
//!
//! Keeps `Account::points` equal to the sum of the account's ledger entries.
//! [`apply_delta`] is the only code path that can change the cached balance:
//! [`Transaction::add_points`] demands a [`DeltaPermit`], and permits can only
//! be minted here.
//!
//! Every ledger mutation pairs with exactly one `apply_delta` call inside the
//! same transaction:
//!
//! | mutation | delta            |
//! |----------|------------------|
//! | create   | `+amount`        |
//! | update   | `new - old`      |
//! | delete   | `-amount`        |
//!
//! [`consistency_report`] recomputes the sums from scratch. It is an offline
//! check and never runs on the command path.

use crate::{
    storage::{LedgerTotal, Store, Transaction},
    types::AccountId,
    Result,
};

/// Capability required to move a cached balance
#[derive(Debug)]
pub struct DeltaPermit {
    _sealed: (),
}

/// Move `account`'s cached balance by `delta` inside `tx`; returns the new
/// balance.
pub async fn apply_delta(
    tx: &mut dyn Transaction,
    account: &AccountId,
    delta: i64,
) -> Result<i64> {
    let permit = DeltaPermit { _sealed: () };
    let balance = tx.add_points(&permit, account, delta).await?;

    tracing::debug!(account = %account, delta, balance, "Cached balance adjusted");

    Ok(balance)
}

/// Result of a full recomputation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Accounts examined
    pub checked: usize,
    /// Accounts whose cached balance differs from their ledger sum
    pub drifted: Vec<LedgerTotal>,
}

impl ConsistencyReport {
    /// True when no account drifted
    pub fn is_consistent(&self) -> bool {
        self.drifted.is_empty()
    }
}

/// Compare every cached balance with its ledger sum
pub async fn consistency_report(store: &dyn Store) -> Result<ConsistencyReport> {
    let totals = store.ledger_totals().await?;
    let checked = totals.len();
    let drifted: Vec<LedgerTotal> = totals
        .into_iter()
        .filter(|t| t.cached != t.ledger_sum)
        .collect();

    for drift in &drifted {
        tracing::error!(
            account = %drift.account,
            cached = drift.cached,
            ledger_sum = drift.ledger_sum,
            "Cached balance does not match ledger"
        );
    }

    Ok(ConsistencyReport { checked, drifted })
}
