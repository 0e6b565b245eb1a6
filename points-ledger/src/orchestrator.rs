//! Admin command orchestration
//!
//! Every ledger command follows the same shape inside one transaction:
//!
//! ```text
//! authorize actor ─▶ parse input ─▶ lock target row
//!        ─▶ LedgerStore mutation ─▶ apply_delta ─▶ audit (best effort) ─▶ commit
//! ```
//!
//! Batch adjustments run that unit once per distinct target. A member that
//! fails for any reason is skipped and the rest still commit.

use chrono_tz::Tz;
use serde::Serialize;
use std::collections::BTreeSet;
use std::num::IntErrorKind;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::{
    audit::{self, operation, AuditLog, RetentionSweep},
    config::{Config, PagingConfig},
    credentials::{self, Registration},
    entries::{EntryUpdate, LedgerStore},
    export::{self, Row, Table},
    metrics::Metrics,
    reconcile::{self, ConsistencyReport},
    storage::Store,
    types::{
        Account, AccountId, AccountQuery, AccountRow, AccountSummary, AdjustOp, AuditEntry,
        EntryId, EntryKind, LedgerEntry, Page, PageRequest, SortKey,
    },
    Error, Result,
};

/// Outcome of an admin toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminToggle {
    /// The target now holds the grant
    Granted,
    /// The target lost the grant
    Revoked,
    /// The target is the root account; nothing changed
    Exempt,
}

/// Parsed and sign-normalized adjustment
#[derive(Debug, Clone)]
struct Adjustment {
    amount: i64,
    reason: String,
}

/// Integer amount. Values past the `i64` range saturate and are clamped
/// later like any other oversized amount.
fn parse_amount(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    match raw.parse::<i64>() {
        Ok(amount) => Ok(amount),
        Err(e) => match e.kind() {
            IntErrorKind::PosOverflow => Ok(i64::MAX),
            IntErrorKind::NegOverflow => Ok(i64::MIN),
            _ => Err(Error::validation(format!("amount must be an integer, got {:?}", raw))),
        },
    }
}

impl Adjustment {
    fn parse(op: &str, raw_amount: &str, reason: &str) -> Result<Self> {
        let op: AdjustOp = op.parse()?;
        let amount = parse_amount(raw_amount)?;
        if amount == 0 {
            return Err(Error::validation("amount must not be zero"));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(Error::validation("reason is required"));
        }
        Ok(Self {
            amount: op.kind().signed(amount),
            reason: reason.to_string(),
        })
    }
}

/// Entry point for every ledger operation
pub struct Orchestrator {
    store: Arc<dyn Store>,
    ledger: LedgerStore,
    audit: AuditLog,
    metrics: Metrics,
    root: AccountId,
    tz: Tz,
    paging: PagingConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("ledger", &self.ledger)
            .field("root", &self.root)
            .field("tz", &self.tz)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build the orchestrator and make sure the root account holds its grant
    pub async fn open(store: Arc<dyn Store>, config: &Config) -> Result<Self> {
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("metrics registry: {}", e)))?;
        let orchestrator = Self {
            ledger: LedgerStore::new(config.ledger.clamp_bound),
            audit: AuditLog::new(store.clone(), metrics.clone(), config.audit.retention_days),
            metrics,
            root: config.ledger.root_account_id()?,
            tz: config.export.timezone()?,
            paging: config.paging.clone(),
            store,
        };

        orchestrator.bootstrap_root().await?;
        Ok(orchestrator)
    }

    /// Metrics of this instance
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The account exempt from admin revocation
    pub fn root_account(&self) -> &AccountId {
        &self.root
    }

    /// Grant admin to the root account if it exists and lacks it. Returns
    /// whether a grant was written.
    async fn bootstrap_root(&self) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        if tx.lock_account(&self.root).await?.is_none() {
            debug!(root = %self.root, "Root account not registered yet");
            return Ok(false);
        }
        if tx.is_admin(&self.root).await? {
            return Ok(false);
        }
        tx.set_admin(&self.root, true).await?;
        tx.commit().await?;

        info!(root = %self.root, "Root admin grant established");
        Ok(true)
    }

    /// Fail with `Authorization` unless `actor` holds the admin grant
    pub async fn require_admin(&self, actor: &AccountId) -> Result<()> {
        if self.store.is_admin(actor).await? {
            Ok(())
        } else {
            Err(Error::Authorization(format!("account {} is not an admin", actor)))
        }
    }

    async fn require_account(&self, id: &AccountId) -> Result<Account> {
        self.store
            .get_account(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("account {}", id)))
    }

    fn page_request(&self, page: u32, page_size: Option<u32>) -> PageRequest {
        let size = page_size
            .unwrap_or(self.paging.default_page_size)
            .clamp(1, self.paging.max_page_size.max(1));
        PageRequest::new(page, size)
    }

    fn observe(&self, started: Instant) {
        self.metrics
            .record_command_duration(started.elapsed().as_secs_f64());
    }

    // ---------------------------------------------------------------------
    // Adjustments
    // ---------------------------------------------------------------------

    /// One transactional unit: entry, balance and audit for one target
    async fn adjust_one(
        &self,
        actor: &AccountId,
        target: &AccountId,
        adjustment: &Adjustment,
        operation: &str,
    ) -> Result<LedgerEntry> {
        let mut tx = self.store.begin().await?;
        let account = tx
            .lock_account(target)
            .await?
            .ok_or_else(|| Error::not_found(format!("account {}", target)))?;

        let entry = self
            .ledger
            .create_entry(tx.as_mut(), target, actor, adjustment.amount, &adjustment.reason)
            .await?;
        let balance = reconcile::apply_delta(tx.as_mut(), target, entry.amount).await?;

        let description = audit::describe_adjustment(actor, &account, &entry);
        self.audit
            .record_in(tx.as_mut(), Some(actor), operation, description)
            .await;

        tx.commit().await?;
        self.metrics.entries_created.inc();

        info!(
            actor = %actor,
            account = %target,
            entry_id = entry.id,
            amount = entry.amount,
            balance,
            "Points adjusted"
        );
        Ok(entry)
    }

    /// Add or remove points on one account. `op` is `add` or `remove` and
    /// decides the sign whatever sign `raw_amount` carries.
    pub async fn adjust_single(
        &self,
        actor: &AccountId,
        target: &AccountId,
        op: &str,
        raw_amount: &str,
        reason: &str,
    ) -> Result<LedgerEntry> {
        let started = Instant::now();
        self.require_admin(actor).await?;

        // An unknown target wins over malformed input
        self.require_account(target).await?;
        let adjustment = Adjustment::parse(op, raw_amount, reason)?;
        let result = self
            .adjust_one(actor, target, &adjustment, operation::ADJUST)
            .await;

        self.observe(started);
        result
    }

    /// Apply the same adjustment to every distinct target. Members that
    /// cannot be adjusted are skipped; the committed entries are returned.
    pub async fn adjust_batch<I, S>(
        &self,
        actor: &AccountId,
        targets: I,
        op: &str,
        raw_amount: &str,
        reason: &str,
    ) -> Result<Vec<LedgerEntry>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let started = Instant::now();
        self.require_admin(actor).await?;

        let targets: BTreeSet<String> = targets
            .into_iter()
            .map(|t| t.as_ref().trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        let adjustment = match Adjustment::parse(op, raw_amount, reason) {
            Ok(adjustment) => adjustment,
            Err(e) => {
                debug!(error = %e, members = targets.len(), "Batch input invalid, skipping every member");
                self.metrics.batch_skipped.inc_by(targets.len() as u64);
                self.observe(started);
                return Ok(Vec::new());
            }
        };

        let mut committed = Vec::with_capacity(targets.len());
        for raw in &targets {
            let outcome = match AccountId::parse(raw) {
                Ok(target) => {
                    self.adjust_one(actor, &target, &adjustment, operation::BATCH_ADJUST)
                        .await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(entry) => committed.push(entry),
                Err(e) => {
                    self.metrics.batch_skipped.inc();
                    debug!(account = %raw, error = %e, "Batch member skipped");
                }
            }
        }

        info!(
            actor = %actor,
            requested = targets.len(),
            committed = committed.len(),
            "Batch adjustment finished"
        );
        self.observe(started);
        Ok(committed)
    }

    // ---------------------------------------------------------------------
    // Entry maintenance
    // ---------------------------------------------------------------------

    /// Rewrite an entry of `target`. `kind` (`add`/`remove` or
    /// `credit`/`debit`) decides the sign; the timestamp is kept.
    pub async fn update_entry(
        &self,
        actor: &AccountId,
        target: &AccountId,
        entry_id: EntryId,
        kind: &str,
        raw_amount: &str,
        reason: &str,
    ) -> Result<EntryUpdate> {
        let started = Instant::now();
        self.require_admin(actor).await?;

        let kind: EntryKind = kind.parse()?;
        let amount = parse_amount(raw_amount)?;

        let mut tx = self.store.begin().await?;
        tx.lock_account(target)
            .await?
            .ok_or_else(|| Error::not_found(format!("account {}", target)))?;

        let update = self
            .ledger
            .update_entry(tx.as_mut(), entry_id, target, kind, amount, reason)
            .await?;
        let balance = reconcile::apply_delta(tx.as_mut(), target, update.delta()).await?;

        self.audit
            .record_in(
                tx.as_mut(),
                Some(actor),
                operation::UPDATE_ENTRY,
                audit::describe_update(&update),
            )
            .await;

        tx.commit().await?;
        self.metrics.entries_updated.inc();
        self.observe(started);

        info!(
            actor = %actor,
            account = %target,
            entry_id,
            old = update.previous.amount,
            new = update.current.amount,
            balance,
            "Entry updated"
        );
        Ok(update)
    }

    /// Remove an entry of `target` and return it as it was
    pub async fn delete_entry(
        &self,
        actor: &AccountId,
        target: &AccountId,
        entry_id: EntryId,
    ) -> Result<LedgerEntry> {
        let started = Instant::now();
        self.require_admin(actor).await?;

        let mut tx = self.store.begin().await?;
        tx.lock_account(target)
            .await?
            .ok_or_else(|| Error::not_found(format!("account {}", target)))?;

        let removed = self.ledger.delete_entry(tx.as_mut(), entry_id, target).await?;
        let balance = reconcile::apply_delta(tx.as_mut(), target, -removed.amount).await?;

        self.audit
            .record_in(
                tx.as_mut(),
                Some(actor),
                operation::DELETE_ENTRY,
                audit::describe_deletion(&removed, self.tz),
            )
            .await;

        tx.commit().await?;
        self.metrics.entries_deleted.inc();
        self.observe(started);

        info!(
            actor = %actor,
            account = %target,
            entry_id,
            amount = removed.amount,
            balance,
            "Entry deleted"
        );
        Ok(removed)
    }

    // ---------------------------------------------------------------------
    // Admin grants
    // ---------------------------------------------------------------------

    /// Flip the admin grant of `target`. The root account is left alone.
    pub async fn toggle_admin(&self, actor: &AccountId, target: &AccountId) -> Result<AdminToggle> {
        self.require_admin(actor).await?;

        let mut tx = self.store.begin().await?;
        tx.lock_account(target)
            .await?
            .ok_or_else(|| Error::not_found(format!("account {}", target)))?;

        if *target == self.root {
            debug!(actor = %actor, "Toggle on root account ignored");
            return Ok(AdminToggle::Exempt);
        }

        let granted = !tx.is_admin(target).await?;
        tx.set_admin(target, granted).await?;
        self.audit
            .record_in(
                tx.as_mut(),
                Some(actor),
                operation::TOGGLE_ADMIN,
                audit::describe_toggle(target, granted),
            )
            .await;
        tx.commit().await?;

        info!(actor = %actor, account = %target, granted, "Admin grant toggled");
        Ok(if granted {
            AdminToggle::Granted
        } else {
            AdminToggle::Revoked
        })
    }

    /// Accounts holding the admin grant
    pub async fn list_admins(&self, actor: &AccountId) -> Result<Vec<AccountSummary>> {
        self.require_admin(actor).await?;
        Ok(self
            .store
            .admins()
            .await?
            .into_iter()
            .map(|a| summary(a, true))
            .collect())
    }

    // ---------------------------------------------------------------------
    // Accounts
    // ---------------------------------------------------------------------

    /// Create an account. The root account gets its grant on the spot.
    pub async fn register(&self, form: &Registration) -> Result<AccountSummary> {
        let valid = form.validate()?;
        let account = Account {
            id: valid.account_id,
            name: valid.name,
            credential_hash: credentials::hash_password(&valid.password)?,
            points: 0,
        };
        self.store.insert_account(&account).await?;

        let is_root = account.id == self.root;
        if is_root {
            self.bootstrap_root().await?;
        }

        self.audit
            .record(
                Some(&account.id),
                operation::REGISTER,
                format!("{} {} registered", account.id, account.name),
            )
            .await;

        info!(account = %account.id, "Account registered");
        Ok(summary(account, is_root))
    }

    /// Check a password. Unknown accounts and wrong passwords fail alike.
    pub async fn authenticate(&self, account_id: &str, password: &str) -> Result<AccountSummary> {
        let rejected = || Error::Authorization("invalid account or password".to_string());

        let id = AccountId::parse(account_id).map_err(|_| rejected())?;
        let account = self.store.get_account(&id).await?.ok_or_else(rejected)?;
        if !credentials::verify_password(password, &account.credential_hash) {
            debug!(account = %id, "Password rejected");
            return Err(rejected());
        }

        let is_admin = self.store.is_admin(&id).await?;
        Ok(summary(account, is_admin))
    }

    /// Name, cached balance and admin flag of one account
    pub async fn get_account_summary(&self, id: &AccountId) -> Result<AccountSummary> {
        let account = self.require_account(id).await?;
        let is_admin = self.store.is_admin(id).await?;
        Ok(summary(account, is_admin))
    }

    /// Entries of one account, newest first
    pub async fn list_entries(&self, id: &AccountId) -> Result<Vec<LedgerEntry>> {
        self.require_account(id).await?;
        self.ledger.list_for_subject(self.store.as_ref(), id).await
    }

    /// Accounts with ledger-aggregated balance and entry count
    pub async fn list_accounts_paged(
        &self,
        search: Option<&str>,
        sort: SortKey,
        page: u32,
        page_size: Option<u32>,
    ) -> Result<Page<AccountRow>> {
        let query = AccountQuery {
            search: search.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string),
            sort,
            page: self.page_request(page, page_size),
        };
        self.store.list_accounts(&query).await
    }

    // ---------------------------------------------------------------------
    // Audit, export and maintenance
    // ---------------------------------------------------------------------

    /// Audit rows newest first, optionally filtered by description
    pub async fn search_audit_log(
        &self,
        query: Option<&str>,
        page: u32,
        page_size: Option<u32>,
    ) -> Result<Page<AuditEntry>> {
        let needle = query.map(str::trim).filter(|s| !s.is_empty());
        self.audit
            .search(needle, self.page_request(page, page_size))
            .await
    }

    /// Every row of `table` as flat column/value pairs
    pub async fn dump_table(&self, table: Table) -> Result<Vec<Row>> {
        export::dump_table(self.store.as_ref(), table, self.tz).await
    }

    /// Admin-only dump that leaves an audit row behind
    pub async fn export_table(&self, actor: &AccountId, table: Table) -> Result<Vec<Row>> {
        self.require_admin(actor).await?;
        let rows = self.dump_table(table).await?;

        self.audit
            .record(
                Some(actor),
                operation::EXPORT,
                format!("{} exported {} ( {} rows )", actor, table, rows.len()),
            )
            .await;

        info!(actor = %actor, table = %table, rows = rows.len(), "Table exported");
        Ok(rows)
    }

    /// Recompute every ledger sum and compare with the cached balances
    pub async fn consistency_report(&self) -> Result<ConsistencyReport> {
        reconcile::consistency_report(self.store.as_ref()).await
    }

    /// Delete audit rows past the retention window
    pub async fn purge_expired_audit(&self) -> Result<u64> {
        self.audit.purge_expired().await
    }

    /// Run the audit retention sweep now and then every `every`
    pub fn spawn_retention_sweep(&self, every: Duration) -> RetentionSweep {
        self.audit.spawn_retention_sweep(every)
    }
}

fn summary(account: Account, is_admin: bool) -> AccountSummary {
    AccountSummary {
        account_id: account.id,
        name: account.name,
        balance: account.points,
        is_admin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;
    use crate::storage::MemoryStore;
    use crate::ErrorKind;

    const ROOT: &str = "113062206";
    const ADMIN: &str = "100000001";
    const ALICE: &str = "200000001";
    const BOB: &str = "200000002";
    const CAROL: &str = "200000003";

    fn id(raw: &str) -> AccountId {
        AccountId::parse(raw).unwrap()
    }

    fn test_config() -> Config {
        Config {
            storage: StorageBackend::Memory,
            ..Config::default()
        }
    }

    async fn seed(store: &MemoryStore, raw: &str, name: &str) {
        store
            .insert_account(&Account {
                id: id(raw),
                name: name.to_string(),
                credential_hash: String::new(),
                points: 0,
            })
            .await
            .unwrap();
    }

    /// Root, one extra admin, and three plain accounts
    async fn setup() -> (MemoryStore, Orchestrator) {
        let store = MemoryStore::new();
        seed(&store, ROOT, "Root").await;
        seed(&store, ADMIN, "Admin").await;
        for (raw, name) in [(ALICE, "Alice"), (BOB, "Bob"), (CAROL, "Carol")] {
            seed(&store, raw, name).await;
        }

        let orchestrator = Orchestrator::open(Arc::new(store.clone()), &test_config())
            .await
            .unwrap();
        let root = id(ROOT);
        orchestrator.toggle_admin(&root, &id(ADMIN)).await.unwrap();
        (store, orchestrator)
    }

    async fn balance(o: &Orchestrator, raw: &str) -> i64 {
        o.get_account_summary(&id(raw)).await.unwrap().balance
    }

    async fn assert_consistent(o: &Orchestrator) {
        let report = o.consistency_report().await.unwrap();
        assert!(report.is_consistent(), "drift: {:?}", report.drifted);
    }

    #[tokio::test]
    async fn test_root_bootstrap_is_idempotent() {
        let (store, o) = setup().await;
        assert!(o.get_account_summary(&id(ROOT)).await.unwrap().is_admin);
        assert!(!o.bootstrap_root().await.unwrap());

        let again = Orchestrator::open(Arc::new(store), &test_config()).await.unwrap();
        assert!(again.get_account_summary(&id(ROOT)).await.unwrap().is_admin);
    }

    #[tokio::test]
    async fn test_adjust_clamps_and_normalizes_sign() {
        let (_, o) = setup().await;
        let admin = id(ADMIN);

        let entry = o.adjust_single(&admin, &id(ALICE), "add", "10000", "r").await.unwrap();
        assert_eq!(entry.amount, 100);
        assert_eq!(entry.kind, EntryKind::Credit);

        let entry = o.adjust_single(&admin, &id(ALICE), "remove", "5", "r").await.unwrap();
        assert_eq!(entry.amount, -5);
        let entry = o.adjust_single(&admin, &id(ALICE), "remove", "-5", "r").await.unwrap();
        assert_eq!(entry.amount, -5);
        let entry = o.adjust_single(&admin, &id(ALICE), "add", "-7", "r").await.unwrap();
        assert_eq!(entry.amount, 7);

        assert_eq!(balance(&o, ALICE).await, 97);
        assert_consistent(&o).await;
    }

    #[tokio::test]
    async fn test_adjust_rejects_bad_input_without_mutation() {
        let (_, o) = setup().await;
        let admin = id(ADMIN);
        let alice = id(ALICE);

        for (op, amount, reason) in [
            ("add", "0", "r"),
            ("add", "ten", "r"),
            ("add", "5", "  "),
            ("gift", "5", "r"),
        ] {
            let err = o.adjust_single(&admin, &alice, op, amount, reason).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{} {} {:?}", op, amount, reason);
        }

        let err = o
            .adjust_single(&admin, &id("999999999"), "add", "5", "r")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = o
            .adjust_single(&admin, &id("999999999"), "add", "ten", "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert!(o.list_entries(&alice).await.unwrap().is_empty());
        assert_eq!(balance(&o, ALICE).await, 0);
    }

    #[test]
    fn test_parse_amount_saturates_out_of_range() {
        assert_eq!(parse_amount(" 42 ").unwrap(), 42);
        assert_eq!(parse_amount("100000000000000000000").unwrap(), i64::MAX);
        assert_eq!(parse_amount("-99999999999999999999").unwrap(), i64::MIN);
        assert!(parse_amount("1e20").is_err());
        assert!(parse_amount("").is_err());
    }

    #[tokio::test]
    async fn test_amounts_beyond_i64_are_clamped() {
        let (_, o) = setup().await;
        let admin = id(ADMIN);

        let entry = o
            .adjust_single(&admin, &id(ALICE), "add", "100000000000000000000", "r")
            .await
            .unwrap();
        assert_eq!(entry.amount, 100);

        let committed = o
            .adjust_batch(&admin, [BOB], "remove", "-99999999999999999999", "r")
            .await
            .unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].amount, -100);

        let update = o
            .update_entry(&admin, &id(ALICE), entry.id, "remove", "100000000000000000000", "r")
            .await
            .unwrap();
        assert_eq!(update.current.amount, -100);

        assert_eq!(balance(&o, ALICE).await, -100);
        assert_eq!(balance(&o, BOB).await, -100);
        assert_consistent(&o).await;
    }

    #[tokio::test]
    async fn test_non_admin_is_rejected() {
        let (_, o) = setup().await;
        let alice = id(ALICE);

        let err = o.adjust_single(&alice, &alice, "add", "5", "r").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        let err = o.adjust_batch(&alice, [BOB], "add", "5", "r").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        let err = o.toggle_admin(&alice, &alice).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        let err = o.export_table(&alice, Table::Accounts).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        let err = o.list_admins(&alice).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn test_batch_skips_missing_members() {
        let (_, o) = setup().await;
        let admin = id(ADMIN);

        let committed = o
            .adjust_batch(&admin, [ALICE, "999999999", CAROL, ALICE, "bogus"], "add", "10", "r")
            .await
            .unwrap();

        assert_eq!(committed.len(), 2);
        assert_eq!(balance(&o, ALICE).await, 10);
        assert_eq!(balance(&o, BOB).await, 0);
        assert_eq!(balance(&o, CAROL).await, 10);
        assert_eq!(o.metrics().batch_skipped.get(), 2);
        assert_consistent(&o).await;

        let page = o.search_audit_log(Some("/admin"), 1, None).await.unwrap();
        assert_eq!(page.total, 0);
        let page = o.search_audit_log(Some("added 10 points"), 1, None).await.unwrap();
        assert_eq!(page.total, 2);
        assert!(page.items.iter().all(|a| a.operation == operation::BATCH_ADJUST));
    }

    #[tokio::test]
    async fn test_batch_with_invalid_input_commits_nothing() {
        let (_, o) = setup().await;
        let admin = id(ADMIN);

        let committed = o.adjust_batch(&admin, [ALICE, BOB], "add", "0", "r").await.unwrap();
        assert!(committed.is_empty());
        let committed = o.adjust_batch(&admin, [ALICE, BOB], "add", "5", "").await.unwrap();
        assert!(committed.is_empty());

        assert_eq!(balance(&o, ALICE).await, 0);
        assert_eq!(o.metrics().batch_skipped.get(), 4);
    }

    #[tokio::test]
    async fn test_update_with_current_values_changes_nothing() {
        let (_, o) = setup().await;
        let admin = id(ADMIN);
        let alice = id(ALICE);

        let entry = o.adjust_single(&admin, &alice, "add", "30", "quiz").await.unwrap();
        let update = o
            .update_entry(&admin, &alice, entry.id, "add", "30", "quiz")
            .await
            .unwrap();

        assert!(update.is_unchanged());
        assert_eq!(update.current.created_at, entry.created_at);
        assert_eq!(balance(&o, ALICE).await, 30);

        let page = o.search_audit_log(Some("no changes"), 1, None).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].operation, operation::UPDATE_ENTRY);
    }

    #[tokio::test]
    async fn test_update_moves_balance_by_difference() {
        let (_, o) = setup().await;
        let admin = id(ADMIN);
        let alice = id(ALICE);

        let entry = o.adjust_single(&admin, &alice, "add", "30", "quiz").await.unwrap();
        o.adjust_single(&admin, &alice, "add", "5", "bonus").await.unwrap();

        let update = o
            .update_entry(&admin, &alice, entry.id, "remove", "12", "penalty")
            .await
            .unwrap();
        assert_eq!(update.current.amount, -12);
        assert_eq!(update.current.kind, EntryKind::Debit);
        assert_eq!(balance(&o, ALICE).await, -7);

        let page = o
            .search_audit_log(Some("amount: 30 -> -12 ; reason: quiz -> penalty"), 1, None)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_consistent(&o).await;
    }

    #[tokio::test]
    async fn test_update_and_delete_of_foreign_entry_fail() {
        let (_, o) = setup().await;
        let admin = id(ADMIN);

        let entry = o.adjust_single(&admin, &id(ALICE), "add", "30", "quiz").await.unwrap();

        let err = o
            .update_entry(&admin, &id(BOB), entry.id, "add", "1", "x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = o.delete_entry(&admin, &id(BOB), entry.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(balance(&o, ALICE).await, 30);
        assert_eq!(balance(&o, BOB).await, 0);
    }

    #[tokio::test]
    async fn test_create_then_delete_restores_balance() {
        let (_, o) = setup().await;
        let admin = id(ADMIN);
        let alice = id(ALICE);

        o.adjust_single(&admin, &alice, "add", "12", "seed").await.unwrap();
        let before = balance(&o, ALICE).await;

        let entry = o.adjust_single(&admin, &alice, "add", "30", "quiz").await.unwrap();
        let removed = o.delete_entry(&admin, &alice, entry.id).await.unwrap();
        assert_eq!(removed, entry);
        assert_eq!(balance(&o, ALICE).await, before);

        let err = o.delete_entry(&admin, &alice, entry.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let page = o.search_audit_log(Some("Deleted entry"), 1, None).await.unwrap();
        assert_eq!(page.total, 1);
        assert!(page.items[0].description.contains("kind = credit ; amount = 30 ; reason = quiz"));
        assert_consistent(&o).await;
    }

    #[tokio::test]
    async fn test_toggle_admin_and_root_exemption() {
        let (_, o) = setup().await;
        let admin = id(ADMIN);
        let bob = id(BOB);

        assert_eq!(o.toggle_admin(&admin, &bob).await.unwrap(), AdminToggle::Granted);
        assert!(o.get_account_summary(&bob).await.unwrap().is_admin);
        assert_eq!(o.toggle_admin(&admin, &bob).await.unwrap(), AdminToggle::Revoked);
        assert!(!o.get_account_summary(&bob).await.unwrap().is_admin);

        for _ in 0..2 {
            assert_eq!(o.toggle_admin(&admin, &id(ROOT)).await.unwrap(), AdminToggle::Exempt);
        }
        assert!(o.get_account_summary(&id(ROOT)).await.unwrap().is_admin);

        let err = o.toggle_admin(&admin, &id("999999999")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let admins = o.list_admins(&admin).await.unwrap();
        let ids: Vec<&str> = admins.iter().map(|a| a.account_id.as_str()).collect();
        assert_eq!(ids, vec![ADMIN, ROOT]);
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_roll_back() {
        let (store, o) = setup().await;
        let admin = id(ADMIN);

        store.fail_audit_writes(true);
        let entry = o.adjust_single(&admin, &id(ALICE), "add", "10", "r").await.unwrap();
        store.fail_audit_writes(false);

        assert_eq!(balance(&o, ALICE).await, 10);
        assert_eq!(o.list_entries(&id(ALICE)).await.unwrap(), vec![entry]);
        assert_eq!(o.metrics().audit_failures.get(), 1);
        assert_consistent(&o).await;
    }

    #[tokio::test]
    async fn test_register_and_authenticate() {
        let store = MemoryStore::new();
        let o = Orchestrator::open(Arc::new(store), &test_config()).await.unwrap();

        let form = Registration {
            account_id: ROOT.to_string(),
            name: "Root".to_string(),
            password: "root_pw".to_string(),
            confirm: "root_pw".to_string(),
        };
        let summary = o.register(&form).await.unwrap();
        assert!(summary.is_admin);

        let err = o.register(&form).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let me = o.authenticate(ROOT, "root_pw").await.unwrap();
        assert_eq!(me.name, "Root");
        assert!(me.is_admin);

        let wrong = o.authenticate(ROOT, "nope").await.unwrap_err();
        let unknown = o.authenticate("999999999", "root_pw").await.unwrap_err();
        assert_eq!(wrong.kind(), ErrorKind::Authorization);
        assert_eq!(wrong.to_string(), unknown.to_string());
    }

    #[tokio::test]
    async fn test_list_accounts_paged_uses_ledger_sums() {
        let (_, o) = setup().await;
        let admin = id(ADMIN);
        o.adjust_single(&admin, &id(BOB), "add", "40", "r").await.unwrap();
        o.adjust_single(&admin, &id(BOB), "remove", "15", "r").await.unwrap();
        o.adjust_single(&admin, &id(CAROL), "add", "60", "r").await.unwrap();

        let page = o
            .list_accounts_paged(None, SortKey::PointsDesc, 1, Some(2))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages(), 3);
        assert_eq!(page.items[0].account_id.as_str(), CAROL);
        assert_eq!(page.items[1].account_id.as_str(), BOB);
        assert_eq!(page.items[1].balance, 25);
        assert_eq!(page.items[1].entry_count, 2);

        let page = o
            .list_accounts_paged(Some(" ali "), SortKey::AccountAsc, 1, None)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.page_size, 20);
    }

    #[tokio::test]
    async fn test_export_is_audited() {
        let (_, o) = setup().await;
        let admin = id(ADMIN);
        o.adjust_single(&admin, &id(ALICE), "add", "3", "r").await.unwrap();

        let rows = o.export_table(&admin, Table::LedgerEntries).await.unwrap();
        assert_eq!(rows.len(), 1);
        let columns: Vec<&str> = rows[0].cells().iter().map(|(c, _)| *c).collect();
        assert_eq!(columns, Table::LedgerEntries.columns());

        let grants = o.dump_table(Table::AdminGrants).await.unwrap();
        assert_eq!(grants.len(), 2);

        let page = o.search_audit_log(Some("exported ledger_entries"), 1, None).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].operation, operation::EXPORT);
    }
}
