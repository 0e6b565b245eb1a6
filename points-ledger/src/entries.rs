//! Ledger entry rules
//!
//! [`LedgerStore`] validates and clamps amounts before they reach the
//! [`Transaction`]. It never touches a cached balance; callers pair each
//! mutation with [`crate::reconcile::apply_delta`].

use tracing::debug;

use crate::{
    storage::{Store, Transaction},
    types::{AccountId, EntryId, EntryKind, LedgerEntry, NewEntry},
    Error, Result,
};

/// An entry before and after an update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryUpdate {
    /// State before the update
    pub previous: LedgerEntry,
    /// State after the update
    pub current: LedgerEntry,
}

impl EntryUpdate {
    /// Balance change implied by the update
    pub fn delta(&self) -> i64 {
        self.current.amount - self.previous.amount
    }

    /// True when neither amount nor reason changed
    pub fn is_unchanged(&self) -> bool {
        self.previous.amount == self.current.amount && self.previous.reason == self.current.reason
    }
}

/// Entry validation and persistence
#[derive(Debug, Clone, Copy)]
pub struct LedgerStore {
    clamp_bound: i64,
}

impl LedgerStore {
    /// Create a store clamping magnitudes to `clamp_bound`
    pub fn new(clamp_bound: i64) -> Self {
        Self {
            clamp_bound: clamp_bound.max(1),
        }
    }

    /// Largest magnitude an entry may carry
    pub fn clamp_bound(&self) -> i64 {
        self.clamp_bound
    }

    /// Clamp `amount` into `[-bound, bound]`
    pub fn clamp(&self, amount: i64) -> i64 {
        amount.clamp(-self.clamp_bound, self.clamp_bound)
    }

    fn check(amount: i64, reason: &str) -> Result<String> {
        if amount == 0 {
            return Err(Error::validation("amount must not be zero"));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(Error::validation("reason is required"));
        }
        Ok(reason.to_string())
    }

    /// Insert a new entry. The subject must already be locked in `tx`.
    pub async fn create_entry(
        &self,
        tx: &mut dyn Transaction,
        subject: &AccountId,
        author: &AccountId,
        signed_amount: i64,
        reason: &str,
    ) -> Result<LedgerEntry> {
        let reason = Self::check(signed_amount, reason)?;
        let amount = self.clamp(signed_amount);

        let entry = tx
            .insert_entry(&NewEntry {
                subject: subject.clone(),
                author: author.clone(),
                kind: EntryKind::of_amount(amount),
                amount,
                reason,
            })
            .await?;

        debug!(entry_id = entry.id, subject = %subject, amount, "Entry created");
        Ok(entry)
    }

    /// Rewrite amount, kind and reason of `entry_id`. `kind` decides the sign
    /// of the stored amount; the creation timestamp is kept.
    pub async fn update_entry(
        &self,
        tx: &mut dyn Transaction,
        entry_id: EntryId,
        subject: &AccountId,
        kind: EntryKind,
        amount: i64,
        reason: &str,
    ) -> Result<EntryUpdate> {
        let signed = kind.signed(amount);
        let reason = Self::check(signed, reason)?;
        let amount = self.clamp(signed);

        let previous = tx
            .find_entry(entry_id, subject)
            .await?
            .ok_or_else(|| Error::not_found(format!("entry {} for account {}", entry_id, subject)))?;

        let current = LedgerEntry {
            kind: EntryKind::of_amount(amount),
            amount,
            reason,
            ..previous.clone()
        };
        tx.update_entry(&current).await?;

        debug!(entry_id, subject = %subject, old = previous.amount, new = amount, "Entry updated");
        Ok(EntryUpdate { previous, current })
    }

    /// Remove `entry_id` and return it as it was
    pub async fn delete_entry(
        &self,
        tx: &mut dyn Transaction,
        entry_id: EntryId,
        subject: &AccountId,
    ) -> Result<LedgerEntry> {
        let removed = tx
            .find_entry(entry_id, subject)
            .await?
            .ok_or_else(|| Error::not_found(format!("entry {} for account {}", entry_id, subject)))?;

        tx.delete_entry(entry_id).await?;

        debug!(entry_id, subject = %subject, amount = removed.amount, "Entry deleted");
        Ok(removed)
    }

    /// Entries of `subject`, newest first
    pub async fn list_for_subject(
        &self,
        store: &dyn Store,
        subject: &AccountId,
    ) -> Result<Vec<LedgerEntry>> {
        store.entries_for_subject(subject).await
    }
}

impl Default for LedgerStore {
    fn default() -> Self {
        Self::new(100)
    }
}
