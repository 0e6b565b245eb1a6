//! Persistence interface
//!
//! Two seams:
//!
//! - [`Store`]: reads, standalone writes and transaction factory
//! - [`Transaction`]: one atomic unit holding the row lock of every account
//!   it touches. Dropping a transaction without calling
//!   [`Transaction::commit`] rolls it back.
//!
//! # Relations
//!
//! - `accounts(id PK, name, credential_hash, points)`
//! - `ledger_entries(id PK, subject_id FK cascade, author_id FK set null,
//!   created_at, kind, amount, reason)`
//! - `admin_grants(account_id PK FK cascade)`
//! - `audit_log(id PK, actor_id FK set null, created_at, operation, description)`
//!
//! # Backends
//!
//! - [`memory::MemoryStore`]: process-local tables
//! - [`postgres::PgStore`]: Postgres via sqlx

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::{
    config::{Config, StorageBackend},
    reconcile::DeltaPermit,
    types::{
        Account, AccountId, AccountQuery, AccountRow, AuditEntry, EntryId, LedgerEntry,
        NewAuditEntry, NewEntry, Page, PageRequest,
    },
    Result,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Cached balance next to the ledger sum for one account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTotal {
    /// Account
    pub account: AccountId,
    /// `accounts.points`
    pub cached: i64,
    /// Σ `ledger_entries.amount` for the account
    pub ledger_sum: i64,
}

/// One atomic unit of work
#[async_trait]
pub trait Transaction: Send {
    /// Lock the account row for the rest of the transaction and return it.
    /// Concurrent transactions locking the same account wait here.
    async fn lock_account(&mut self, id: &AccountId) -> Result<Option<Account>>;

    /// Entry `entry_id` if it belongs to `subject`
    async fn find_entry(
        &mut self,
        entry_id: EntryId,
        subject: &AccountId,
    ) -> Result<Option<LedgerEntry>>;

    /// Insert an entry; id and timestamp are assigned by the store
    async fn insert_entry(&mut self, entry: &NewEntry) -> Result<LedgerEntry>;

    /// Overwrite kind, amount and reason of an existing entry
    async fn update_entry(&mut self, entry: &LedgerEntry) -> Result<()>;

    /// Physically remove an entry
    async fn delete_entry(&mut self, entry_id: EntryId) -> Result<()>;

    /// Add `delta` to the cached balance and return the new balance.
    /// Only the reconciliation engine can produce a [`DeltaPermit`].
    async fn add_points(
        &mut self,
        permit: &DeltaPermit,
        account: &AccountId,
        delta: i64,
    ) -> Result<i64>;

    /// Whether the account holds the admin grant
    async fn is_admin(&mut self, id: &AccountId) -> Result<bool>;

    /// Grant or revoke the admin grant
    async fn set_admin(&mut self, id: &AccountId, granted: bool) -> Result<()>;

    /// Append an audit row as part of this unit. A failure here leaves the
    /// rest of the transaction intact and committable.
    async fn append_audit(&mut self, entry: &NewAuditEntry) -> Result<()>;

    /// Make every write of this transaction visible at once
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Ledger persistence
#[async_trait]
pub trait Store: Send + Sync {
    /// Start a transaction
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Create an account; `Conflict` if the id is taken
    async fn insert_account(&self, account: &Account) -> Result<()>;

    /// Account by id
    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>>;

    /// Whether the account holds the admin grant
    async fn is_admin(&self, id: &AccountId) -> Result<bool>;

    /// Accounts holding the admin grant, by id
    async fn admins(&self) -> Result<Vec<Account>>;

    /// Entries of one account, newest first
    async fn entries_for_subject(&self, subject: &AccountId) -> Result<Vec<LedgerEntry>>;

    /// Accounts with ledger-aggregated balance and entry count
    async fn list_accounts(&self, query: &AccountQuery) -> Result<Page<AccountRow>>;

    /// Append an audit row outside any ledger transaction
    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<()>;

    /// Audit rows newest first, optionally filtered by a case-insensitive
    /// substring of the description
    async fn search_audit(&self, needle: Option<&str>, page: PageRequest)
        -> Result<Page<AuditEntry>>;

    /// Delete audit rows created before `cutoff`; returns the number removed
    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Every account, by id
    async fn all_accounts(&self) -> Result<Vec<Account>>;

    /// Every ledger entry, by id
    async fn all_entries(&self) -> Result<Vec<LedgerEntry>>;

    /// Every admin grant, by account id
    async fn all_admin_grants(&self) -> Result<Vec<AccountId>>;

    /// Cached balance and full ledger sum for every account
    async fn ledger_totals(&self) -> Result<Vec<LedgerTotal>>;
}

/// Open the backend selected by `config`, applying migrations for Postgres
pub async fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    match config.storage {
        StorageBackend::Postgres => {
            let store = PgStore::connect(&config.database).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
