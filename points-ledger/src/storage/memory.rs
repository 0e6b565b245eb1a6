//! Process-local store
//!
//! Tables live behind one `parking_lot::RwLock`. Each account has its own
//! async mutex standing in for a row lock; a transaction holds the mutex of
//! every account it locked until it commits or is dropped. Writes are
//! buffered in the transaction and applied under a single write lock on
//! commit, so readers never observe half a unit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{LedgerTotal, Store, Transaction};
use crate::{
    reconcile::DeltaPermit,
    types::{
        Account, AccountId, AccountQuery, AccountRow, AuditEntry, AuditId, EntryId, LedgerEntry,
        NewAuditEntry, NewEntry, Page, PageRequest, SortKey,
    },
    Error, Result,
};

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    entries: BTreeMap<EntryId, LedgerEntry>,
    admins: BTreeSet<AccountId>,
    audit: Vec<AuditEntry>,
    next_audit_id: AuditId,
}

impl Tables {
    fn push_audit(&mut self, entry: NewAuditEntry, created_at: DateTime<Utc>) {
        self.next_audit_id += 1;
        self.audit.push(AuditEntry {
            id: self.next_audit_id,
            actor: entry.actor,
            created_at,
            operation: entry.operation,
            description: entry.description,
        });
    }

    fn ledger_sum(&self, account: &AccountId) -> (i64, i64) {
        self.entries
            .values()
            .filter(|e| &e.subject == account)
            .fold((0, 0), |(sum, count), e| (sum + e.amount, count + 1))
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: RwLock<Tables>,
    row_locks: DashMap<AccountId, Arc<Mutex<()>>>,
    entry_seq: AtomicI64,
    #[cfg(test)]
    fail_audit: std::sync::atomic::AtomicBool,
}

impl Inner {
    fn row_lock(&self, id: &AccountId) -> Arc<Mutex<()>> {
        self.row_locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn check_audit_writable(&self) -> Result<()> {
        #[cfg(test)]
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(Error::Storage("audit table unavailable".to_string()));
        }
        Ok(())
    }
}

/// In-memory [`Store`]
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of row locks currently tracked
    #[cfg(test)]
    pub(crate) fn row_lock_count(&self) -> usize {
        self.inner.row_locks.len()
    }

    /// Make every audit append fail, as if the audit table were unreachable
    #[cfg(test)]
    pub(crate) fn fail_audit_writes(&self, fail: bool) {
        self.inner.fail_audit.store(fail, Ordering::SeqCst);
    }
}

#[derive(Debug)]
enum Write {
    PutEntry(LedgerEntry),
    RemoveEntry(EntryId),
    AddPoints(AccountId, i64),
    Admin(AccountId, bool),
    Audit(NewAuditEntry, DateTime<Utc>),
}

struct MemoryTx {
    inner: Arc<Inner>,
    guards: HashMap<AccountId, OwnedMutexGuard<()>>,
    writes: Vec<Write>,
}

impl MemoryTx {
    fn require_locked(&self, id: &AccountId) -> Result<()> {
        if self.guards.contains_key(id) {
            Ok(())
        } else {
            Err(Error::Storage(format!("account {} is not locked by this transaction", id)))
        }
    }

    /// Give up the row lock on `id`, forgetting the mutex once nobody else
    /// holds or awaits it
    fn release(&mut self, id: &AccountId) {
        if let Some(guard) = self.guards.remove(id) {
            drop(guard);
            self.inner
                .row_locks
                .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
        }
    }

    /// Committed entry with this transaction's pending writes laid over it
    fn current_entry(&self, entry_id: EntryId) -> Option<LedgerEntry> {
        let mut current = self.inner.tables.read().entries.get(&entry_id).cloned();
        for write in &self.writes {
            match write {
                Write::PutEntry(e) if e.id == entry_id => current = Some(e.clone()),
                Write::RemoveEntry(id) if *id == entry_id => current = None,
                _ => {}
            }
        }
        current
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn lock_account(&mut self, id: &AccountId) -> Result<Option<Account>> {
        if !self.guards.contains_key(id) {
            let lock = self.inner.row_lock(id);
            let guard = lock.lock_owned().await;
            self.guards.insert(id.clone(), guard);
        }

        let found = self.inner.tables.read().accounts.get(id).cloned();
        let mut account = match found {
            Some(account) => account,
            None => {
                self.release(id);
                return Ok(None);
            }
        };
        for write in &self.writes {
            if let Write::AddPoints(target, delta) = write {
                if target == id {
                    account.points += delta;
                }
            }
        }
        Ok(Some(account))
    }

    async fn find_entry(
        &mut self,
        entry_id: EntryId,
        subject: &AccountId,
    ) -> Result<Option<LedgerEntry>> {
        Ok(self
            .current_entry(entry_id)
            .filter(|entry| &entry.subject == subject))
    }

    async fn insert_entry(&mut self, entry: &NewEntry) -> Result<LedgerEntry> {
        self.require_locked(&entry.subject)?;

        let id = self.inner.entry_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let stored = LedgerEntry {
            id,
            subject: entry.subject.clone(),
            author: Some(entry.author.clone()),
            created_at: Utc::now(),
            kind: entry.kind,
            amount: entry.amount,
            reason: entry.reason.clone(),
        };
        self.writes.push(Write::PutEntry(stored.clone()));
        Ok(stored)
    }

    async fn update_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        self.require_locked(&entry.subject)?;

        let existing = self
            .current_entry(entry.id)
            .ok_or_else(|| Error::not_found(format!("entry {}", entry.id)))?;
        self.writes.push(Write::PutEntry(LedgerEntry {
            created_at: existing.created_at,
            ..entry.clone()
        }));
        Ok(())
    }

    async fn delete_entry(&mut self, entry_id: EntryId) -> Result<()> {
        let existing = self
            .current_entry(entry_id)
            .ok_or_else(|| Error::not_found(format!("entry {}", entry_id)))?;
        self.require_locked(&existing.subject)?;

        self.writes.push(Write::RemoveEntry(entry_id));
        Ok(())
    }

    async fn add_points(
        &mut self,
        _permit: &DeltaPermit,
        account: &AccountId,
        delta: i64,
    ) -> Result<i64> {
        self.require_locked(account)?;

        let current = self
            .lock_account(account)
            .await?
            .ok_or_else(|| Error::not_found(format!("account {}", account)))?;
        let balance = current
            .points
            .checked_add(delta)
            .ok_or_else(|| Error::Storage(format!("balance overflow on account {}", account)))?;

        self.writes.push(Write::AddPoints(account.clone(), delta));
        Ok(balance)
    }

    async fn is_admin(&mut self, id: &AccountId) -> Result<bool> {
        let mut granted = self.inner.tables.read().admins.contains(id);
        for write in &self.writes {
            if let Write::Admin(target, value) = write {
                if target == id {
                    granted = *value;
                }
            }
        }
        Ok(granted)
    }

    async fn set_admin(&mut self, id: &AccountId, granted: bool) -> Result<()> {
        self.require_locked(id)?;
        self.writes.push(Write::Admin(id.clone(), granted));
        Ok(())
    }

    async fn append_audit(&mut self, entry: &NewAuditEntry) -> Result<()> {
        self.inner.check_audit_writable()?;
        self.writes.push(Write::Audit(entry.clone(), Utc::now()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { inner, guards, writes } = *self;

        {
            let mut tables = inner.tables.write();
            for write in writes {
                match write {
                    Write::PutEntry(entry) => {
                        tables.entries.insert(entry.id, entry);
                    }
                    Write::RemoveEntry(id) => {
                        tables.entries.remove(&id);
                    }
                    Write::AddPoints(id, delta) => {
                        if let Some(account) = tables.accounts.get_mut(&id) {
                            account.points += delta;
                        }
                    }
                    Write::Admin(id, true) => {
                        tables.admins.insert(id);
                    }
                    Write::Admin(id, false) => {
                        tables.admins.remove(&id);
                    }
                    Write::Audit(entry, created_at) => tables.push_audit(entry, created_at),
                }
            }
        }

        drop(guards);
        Ok(())
    }
}

fn page_of<T>(rows: Vec<T>, page: PageRequest) -> Page<T> {
    let total = rows.len() as u64;
    let items = rows
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.limit() as usize)
        .collect();
    Page {
        items,
        total,
        page: page.page,
        page_size: page.page_size,
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTx {
            inner: self.inner.clone(),
            guards: HashMap::new(),
            writes: Vec::new(),
        }))
    }

    async fn insert_account(&self, account: &Account) -> Result<()> {
        let mut tables = self.inner.tables.write();
        if tables.accounts.contains_key(&account.id) {
            return Err(Error::Conflict(format!("account {} already exists", account.id)));
        }
        tables.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        Ok(self.inner.tables.read().accounts.get(id).cloned())
    }

    async fn is_admin(&self, id: &AccountId) -> Result<bool> {
        Ok(self.inner.tables.read().admins.contains(id))
    }

    async fn admins(&self) -> Result<Vec<Account>> {
        let tables = self.inner.tables.read();
        Ok(tables
            .admins
            .iter()
            .filter_map(|id| tables.accounts.get(id).cloned())
            .collect())
    }

    async fn entries_for_subject(&self, subject: &AccountId) -> Result<Vec<LedgerEntry>> {
        let tables = self.inner.tables.read();
        let mut entries: Vec<LedgerEntry> = tables
            .entries
            .values()
            .filter(|e| &e.subject == subject)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(entries)
    }

    async fn list_accounts(&self, query: &AccountQuery) -> Result<Page<AccountRow>> {
        let tables = self.inner.tables.read();
        let needle = query.search.as_deref().filter(|s| !s.is_empty());

        let mut rows: Vec<AccountRow> = tables
            .accounts
            .values()
            .filter(|a| {
                needle.map_or(true, |n| contains_ci(a.id.as_str(), n) || contains_ci(&a.name, n))
            })
            .map(|a| {
                let (balance, entry_count) = tables.ledger_sum(&a.id);
                AccountRow {
                    account_id: a.id.clone(),
                    name: a.name.clone(),
                    balance,
                    entry_count,
                }
            })
            .collect();

        rows.sort_by(|a, b| {
            let primary = match query.sort {
                SortKey::AccountAsc => a.account_id.cmp(&b.account_id),
                SortKey::AccountDesc => b.account_id.cmp(&a.account_id),
                SortKey::NameAsc => a.name.cmp(&b.name),
                SortKey::NameDesc => b.name.cmp(&a.name),
                SortKey::PointsAsc => a.balance.cmp(&b.balance),
                SortKey::PointsDesc => b.balance.cmp(&a.balance),
            };
            primary.then_with(|| a.account_id.cmp(&b.account_id))
        });

        Ok(page_of(rows, query.page))
    }

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<()> {
        self.inner.check_audit_writable()?;
        self.inner.tables.write().push_audit(entry.clone(), Utc::now());
        Ok(())
    }

    async fn search_audit(
        &self,
        needle: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<AuditEntry>> {
        let tables = self.inner.tables.read();
        let needle = needle.filter(|s| !s.is_empty());

        let mut rows: Vec<AuditEntry> = tables
            .audit
            .iter()
            .filter(|a| needle.map_or(true, |n| contains_ci(&a.description, n)))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(page_of(rows, page))
    }

    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.inner.tables.write();
        let before = tables.audit.len();
        tables.audit.retain(|a| a.created_at >= cutoff);
        Ok((before - tables.audit.len()) as u64)
    }

    async fn all_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.inner.tables.read().accounts.values().cloned().collect())
    }

    async fn all_entries(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.inner.tables.read().entries.values().cloned().collect())
    }

    async fn all_admin_grants(&self) -> Result<Vec<AccountId>> {
        Ok(self.inner.tables.read().admins.iter().cloned().collect())
    }

    async fn ledger_totals(&self) -> Result<Vec<LedgerTotal>> {
        let tables = self.inner.tables.read();
        Ok(tables
            .accounts
            .values()
            .map(|a| LedgerTotal {
                account: a.id.clone(),
                cached: a.points,
                ledger_sum: tables.ledger_sum(&a.id).0,
            })
            .collect())
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Backdate an audit row, for retention tests
    pub(crate) fn backdate_audit(&self, id: AuditId, created_at: DateTime<Utc>) {
        if let Some(row) = self.inner.tables.write().audit.iter_mut().find(|a| a.id == id) {
            row.created_at = created_at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryKind;
    use std::time::Duration;

    fn account(id: &str, name: &str) -> Account {
        Account {
            id: AccountId::parse(id).unwrap(),
            name: name.to_string(),
            credential_hash: String::new(),
            points: 0,
        }
    }

    fn new_entry(subject: &AccountId, amount: i64) -> NewEntry {
        NewEntry {
            subject: subject.clone(),
            author: subject.clone(),
            kind: EntryKind::of_amount(amount),
            amount,
            reason: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_account_conflicts() {
        let store = MemoryStore::new();
        let acct = account("200000001", "Alice");
        store.insert_account(&acct).await.unwrap();

        let err = store.insert_account(&acct).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = MemoryStore::new();
        let acct = account("200000002", "Bob");
        store.insert_account(&acct).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            tx.lock_account(&acct.id).await.unwrap();
            tx.insert_entry(&new_entry(&acct.id, 10)).await.unwrap();
            tx.append_audit(&NewAuditEntry {
                actor: None,
                operation: "test".to_string(),
                description: "never committed".to_string(),
            })
            .await
            .unwrap();
        }

        assert!(store.entries_for_subject(&acct.id).await.unwrap().is_empty());
        assert_eq!(store.search_audit(None, PageRequest::new(1, 20)).await.unwrap().total, 0);

        // The row lock was released with the transaction.
        let mut tx = store.begin().await.unwrap();
        assert!(tx.lock_account(&acct.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_writes_require_row_lock() {
        let store = MemoryStore::new();
        let acct = account("200000003", "Carol");
        store.insert_account(&acct).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.insert_entry(&new_entry(&acct.id, 10)).await.is_err());
    }

    #[tokio::test]
    async fn test_transaction_sees_own_writes() {
        let store = MemoryStore::new();
        let acct = account("200000004", "Dave");
        store.insert_account(&acct).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.lock_account(&acct.id).await.unwrap();
        let entry = tx.insert_entry(&new_entry(&acct.id, 10)).await.unwrap();

        let found = tx.find_entry(entry.id, &acct.id).await.unwrap();
        assert_eq!(found, Some(entry.clone()));

        let other = AccountId::parse("999999999").unwrap();
        assert!(tx.find_entry(entry.id, &other).await.unwrap().is_none());

        tx.delete_entry(entry.id).await.unwrap();
        assert!(tx.find_entry(entry.id, &acct.id).await.unwrap().is_none());

        tx.set_admin(&acct.id, true).await.unwrap();
        assert!(tx.is_admin(&acct.id).await.unwrap());
        assert!(!store.is_admin(&acct.id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_row_lock_blocks_second_transaction() {
        let store = MemoryStore::new();
        let acct = account("200000005", "Erin");
        store.insert_account(&acct).await.unwrap();

        let mut first = store.begin().await.unwrap();
        first.lock_account(&acct.id).await.unwrap();

        let contender = {
            let store = store.clone();
            let id = acct.id.clone();
            tokio::spawn(async move {
                let mut second = store.begin().await.unwrap();
                second.lock_account(&id).await.unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        first.commit().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("second transaction should acquire the lock")
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_accounts_search_and_sort() {
        let store = MemoryStore::new();
        for (id, name) in [("300000001", "Zed"), ("300000002", "amy"), ("310000003", "Bo")] {
            store.insert_account(&account(id, name)).await.unwrap();
        }

        let page = store
            .list_accounts(&AccountQuery {
                search: Some("AM".to_string()),
                sort: SortKey::AccountAsc,
                page: PageRequest::new(1, 20),
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].name, "amy");

        let page = store
            .list_accounts(&AccountQuery {
                search: Some("3000".to_string()),
                sort: SortKey::AccountDesc,
                page: PageRequest::new(1, 1),
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].account_id.as_str(), "300000002");
    }

    #[tokio::test]
    async fn test_list_accounts_every_sort_key() {
        let store = MemoryStore::new();
        for (id, name, amounts) in [
            ("300000001", "Bo", &[5i64][..]),
            ("300000002", "amy", &[-3][..]),
            ("300000003", "Cy", &[][..]),
            ("300000004", "Bo", &[2, 3][..]),
        ] {
            let acct = account(id, name);
            store.insert_account(&acct).await.unwrap();

            let mut tx = store.begin().await.unwrap();
            tx.lock_account(&acct.id).await.unwrap();
            for amount in amounts {
                tx.insert_entry(&new_entry(&acct.id, *amount)).await.unwrap();
            }
            tx.commit().await.unwrap();
        }

        let order = |sort| {
            let store = store.clone();
            async move {
                store
                    .list_accounts(&AccountQuery {
                        search: None,
                        sort,
                        page: PageRequest::new(1, 20),
                    })
                    .await
                    .unwrap()
                    .items
                    .into_iter()
                    .map(|row| row.account_id.as_str()[6..].to_string())
                    .collect::<Vec<_>>()
            }
        };

        // Ties fall back to ascending account id.
        assert_eq!(order(SortKey::AccountAsc).await, ["001", "002", "003", "004"]);
        assert_eq!(order(SortKey::AccountDesc).await, ["004", "003", "002", "001"]);
        assert_eq!(order(SortKey::NameAsc).await, ["001", "004", "003", "002"]);
        assert_eq!(order(SortKey::NameDesc).await, ["002", "003", "001", "004"]);
        assert_eq!(order(SortKey::PointsAsc).await, ["002", "003", "001", "004"]);
        assert_eq!(order(SortKey::PointsDesc).await, ["001", "004", "003", "002"]);
    }

    #[tokio::test]
    async fn test_missing_account_leaves_no_row_lock() {
        let store = MemoryStore::new();
        let acct = account("200000006", "Finn");
        store.insert_account(&acct).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        for raw in ["999999991", "999999992", "999999993"] {
            let ghost = AccountId::parse(raw).unwrap();
            assert!(tx.lock_account(&ghost).await.unwrap().is_none());
            assert!(tx.insert_entry(&new_entry(&ghost, 1)).await.is_err());
        }
        assert!(tx.lock_account(&acct.id).await.unwrap().is_some());
        assert_eq!(store.row_lock_count(), 1);
        tx.commit().await.unwrap();

        // The lock on the existing account still serializes later transactions.
        let mut tx = store.begin().await.unwrap();
        assert!(tx.lock_account(&acct.id).await.unwrap().is_some());
        assert_eq!(store.row_lock_count(), 1);
    }

    #[tokio::test]
    async fn test_purge_audit_before() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store
                .append_audit(&NewAuditEntry {
                    actor: None,
                    operation: "test".to_string(),
                    description: format!("row {}", i),
                })
                .await
                .unwrap();
        }
        let old = Utc::now() - chrono::Duration::days(10);
        store.backdate_audit(1, old);

        let removed = store
            .purge_audit_before(Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.search_audit(None, PageRequest::new(1, 20)).await.unwrap().total, 2);
    }
}
