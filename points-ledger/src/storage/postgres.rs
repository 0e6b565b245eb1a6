//! Postgres store (sqlx)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Connection, FromRow, Postgres};
use std::time::Duration;
use tracing::info;

use super::{LedgerTotal, Store, Transaction};
use crate::{
    config::DatabaseConfig,
    reconcile::DeltaPermit,
    types::{
        Account, AccountId, AccountQuery, AccountRow, AuditEntry, EntryId, EntryKind, LedgerEntry,
        NewAuditEntry, NewEntry, Page, PageRequest, SortKey,
    },
    Error, Result,
};

const ENTRY_COLUMNS: &str = "id, subject_id, author_id, created_at, kind, amount, reason";

#[derive(FromRow)]
struct AccountRecord {
    id: String,
    name: String,
    credential_hash: String,
    points: i64,
}

#[derive(FromRow)]
struct EntryRecord {
    id: i64,
    subject_id: String,
    author_id: Option<String>,
    created_at: DateTime<Utc>,
    kind: String,
    amount: i64,
    reason: String,
}

#[derive(FromRow)]
struct AuditRecord {
    id: i64,
    actor_id: Option<String>,
    created_at: DateTime<Utc>,
    operation: String,
    description: String,
}

#[derive(FromRow)]
struct AccountRowRecord {
    id: String,
    name: String,
    balance: i64,
    entry_count: i64,
}

#[derive(FromRow)]
struct TotalRecord {
    id: String,
    points: i64,
    ledger_sum: i64,
}

fn stored_id(raw: String) -> Result<AccountId> {
    AccountId::parse(&raw).map_err(|_| Error::Storage(format!("malformed account id {:?} in store", raw)))
}

impl TryFrom<AccountRecord> for Account {
    type Error = Error;

    fn try_from(r: AccountRecord) -> Result<Self> {
        Ok(Account {
            id: stored_id(r.id)?,
            name: r.name,
            credential_hash: r.credential_hash,
            points: r.points,
        })
    }
}

impl TryFrom<EntryRecord> for LedgerEntry {
    type Error = Error;

    fn try_from(r: EntryRecord) -> Result<Self> {
        let kind: EntryKind = r
            .kind
            .parse()
            .map_err(|_| Error::Storage(format!("entry {} has unknown kind {:?}", r.id, r.kind)))?;
        Ok(LedgerEntry {
            id: r.id,
            subject: stored_id(r.subject_id)?,
            author: r.author_id.map(stored_id).transpose()?,
            created_at: r.created_at,
            kind,
            amount: r.amount,
            reason: r.reason,
        })
    }
}

impl TryFrom<AuditRecord> for AuditEntry {
    type Error = Error;

    fn try_from(r: AuditRecord) -> Result<Self> {
        Ok(AuditEntry {
            id: r.id,
            actor: r.actor_id.map(stored_id).transpose()?,
            created_at: r.created_at,
            operation: r.operation,
            description: r.description,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// `%needle%` for ILIKE with the wildcard characters escaped
fn like_pattern(needle: Option<&str>) -> Option<String> {
    needle.filter(|n| !n.is_empty()).map(|n| {
        let escaped = n
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        format!("%{}%", escaped)
    })
}

fn order_clause(sort: SortKey) -> &'static str {
    match sort {
        SortKey::AccountAsc => "a.id ASC",
        SortKey::AccountDesc => "a.id DESC",
        SortKey::NameAsc => "a.name ASC, a.id ASC",
        SortKey::NameDesc => "a.name DESC, a.id ASC",
        SortKey::PointsAsc => "balance ASC, a.id ASC",
        SortKey::PointsDesc => "balance DESC, a.id ASC",
    }
}

/// Postgres-backed [`Store`]
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PgStore {
    /// Connect and verify the connection
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&config.url)
            .await?;

        sqlx::query("SELECT 1").fetch_one(&pool).await?;

        info!("Database connection verified");

        Ok(Self {
            pool,
            lock_timeout_ms: config.lock_timeout_ms,
        })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool, lock_timeout_ms: u64) -> Self {
        Self {
            pool,
            lock_timeout_ms,
        }
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Schema migrations applied");
        Ok(())
    }

    /// Underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

struct PgTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PgTx {
    async fn lock_account(&mut self, id: &AccountId) -> Result<Option<Account>> {
        let row: Option<AccountRecord> = sqlx::query_as(
            "SELECT id, name, credential_hash, points FROM accounts WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Account::try_from).transpose()
    }

    async fn find_entry(
        &mut self,
        entry_id: EntryId,
        subject: &AccountId,
    ) -> Result<Option<LedgerEntry>> {
        let row: Option<EntryRecord> = sqlx::query_as(&format!(
            "SELECT {} FROM ledger_entries WHERE id = $1 AND subject_id = $2",
            ENTRY_COLUMNS
        ))
        .bind(entry_id)
        .bind(subject.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(LedgerEntry::try_from).transpose()
    }

    async fn insert_entry(&mut self, entry: &NewEntry) -> Result<LedgerEntry> {
        let row: EntryRecord = sqlx::query_as(&format!(
            r#"
            INSERT INTO ledger_entries (subject_id, author_id, kind, amount, reason)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        ))
        .bind(entry.subject.as_str())
        .bind(entry.author.as_str())
        .bind(entry.kind.as_str())
        .bind(entry.amount)
        .bind(&entry.reason)
        .fetch_one(&mut *self.tx)
        .await?;

        LedgerEntry::try_from(row)
    }

    async fn update_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        let result = sqlx::query(
            "UPDATE ledger_entries SET kind = $2, amount = $3, reason = $4 WHERE id = $1",
        )
        .bind(entry.id)
        .bind(entry.kind.as_str())
        .bind(entry.amount)
        .bind(&entry.reason)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("entry {}", entry.id)));
        }
        Ok(())
    }

    async fn delete_entry(&mut self, entry_id: EntryId) -> Result<()> {
        let result = sqlx::query("DELETE FROM ledger_entries WHERE id = $1")
            .bind(entry_id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("entry {}", entry_id)));
        }
        Ok(())
    }

    async fn add_points(
        &mut self,
        _permit: &DeltaPermit,
        account: &AccountId,
        delta: i64,
    ) -> Result<i64> {
        let balance: Option<i64> =
            sqlx::query_scalar("UPDATE accounts SET points = points + $2 WHERE id = $1 RETURNING points")
                .bind(account.as_str())
                .bind(delta)
                .fetch_optional(&mut *self.tx)
                .await?;

        balance.ok_or_else(|| Error::not_found(format!("account {}", account)))
    }

    async fn is_admin(&mut self, id: &AccountId) -> Result<bool> {
        let granted: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM admin_grants WHERE account_id = $1)")
                .bind(id.as_str())
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(granted)
    }

    async fn set_admin(&mut self, id: &AccountId, granted: bool) -> Result<()> {
        let sql = if granted {
            "INSERT INTO admin_grants (account_id) VALUES ($1) ON CONFLICT DO NOTHING"
        } else {
            "DELETE FROM admin_grants WHERE account_id = $1"
        };
        sqlx::query(sql)
            .bind(id.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn append_audit(&mut self, entry: &NewAuditEntry) -> Result<()> {
        // Savepoint: a failed insert must not poison the enclosing transaction.
        let mut savepoint = self.tx.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO audit_log (actor_id, operation, description) VALUES ($1, $2, $3)",
        )
        .bind(entry.actor.as_ref().map(AccountId::as_str))
        .bind(&entry.operation)
        .bind(&entry.description)
        .execute(&mut *savepoint)
        .await;

        match inserted {
            Ok(_) => {
                savepoint.commit().await?;
                Ok(())
            }
            Err(e) => {
                savepoint.rollback().await?;
                Err(e.into())
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout_ms))
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn insert_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            "INSERT INTO accounts (id, name, credential_hash, points) VALUES ($1, $2, $3, $4)",
        )
        .bind(account.id.as_str())
        .bind(&account.name)
        .bind(&account.credential_hash)
        .bind(account.points)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        let row: Option<AccountRecord> =
            sqlx::query_as("SELECT id, name, credential_hash, points FROM accounts WHERE id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(Account::try_from).transpose()
    }

    async fn is_admin(&self, id: &AccountId) -> Result<bool> {
        let granted: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM admin_grants WHERE account_id = $1)")
                .bind(id.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(granted)
    }

    async fn admins(&self) -> Result<Vec<Account>> {
        let rows: Vec<AccountRecord> = sqlx::query_as(
            r#"
            SELECT a.id, a.name, a.credential_hash, a.points
            FROM accounts a
            JOIN admin_grants g ON g.account_id = a.id
            ORDER BY a.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn entries_for_subject(&self, subject: &AccountId) -> Result<Vec<LedgerEntry>> {
        let rows: Vec<EntryRecord> = sqlx::query_as(&format!(
            "SELECT {} FROM ledger_entries WHERE subject_id = $1 ORDER BY created_at DESC, id DESC",
            ENTRY_COLUMNS
        ))
        .bind(subject.as_str())
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn list_accounts(&self, query: &AccountQuery) -> Result<Page<AccountRow>> {
        let pattern = like_pattern(query.search.as_deref());

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM accounts a WHERE ($1::TEXT IS NULL OR a.id ILIKE $1 OR a.name ILIKE $1)",
        )
        .bind(pattern.as_deref())
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<AccountRowRecord> = sqlx::query_as(&format!(
            r#"
            SELECT a.id, a.name,
                   COALESCE(SUM(e.amount), 0)::BIGINT AS balance,
                   COUNT(e.id) AS entry_count
            FROM accounts a
            LEFT JOIN ledger_entries e ON e.subject_id = a.id
            WHERE ($1::TEXT IS NULL OR a.id ILIKE $1 OR a.name ILIKE $1)
            GROUP BY a.id, a.name
            ORDER BY {}
            LIMIT $2 OFFSET $3
            "#,
            order_clause(query.sort)
        ))
        .bind(pattern.as_deref())
        .bind(query.page.limit() as i64)
        .bind(query.page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(|r| {
                Ok(AccountRow {
                    account_id: stored_id(r.id)?,
                    name: r.name,
                    balance: r.balance,
                    entry_count: r.entry_count,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
            page: query.page.page,
            page_size: query.page.page_size,
        })
    }

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<()> {
        sqlx::query("INSERT INTO audit_log (actor_id, operation, description) VALUES ($1, $2, $3)")
            .bind(entry.actor.as_ref().map(AccountId::as_str))
            .bind(&entry.operation)
            .bind(&entry.description)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn search_audit(
        &self,
        needle: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<AuditEntry>> {
        let pattern = like_pattern(needle);

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM audit_log WHERE ($1::TEXT IS NULL OR description ILIKE $1)",
        )
        .bind(pattern.as_deref())
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<AuditRecord> = sqlx::query_as(
            r#"
            SELECT id, actor_id, created_at, operation, description
            FROM audit_log
            WHERE ($1::TEXT IS NULL OR description ILIKE $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(pattern.as_deref())
        .bind(page.limit() as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: convert_all(rows)?,
            total: total.max(0) as u64,
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_log WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn all_accounts(&self) -> Result<Vec<Account>> {
        let rows: Vec<AccountRecord> =
            sqlx::query_as("SELECT id, name, credential_hash, points FROM accounts ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        convert_all(rows)
    }

    async fn all_entries(&self) -> Result<Vec<LedgerEntry>> {
        let rows: Vec<EntryRecord> = sqlx::query_as(&format!(
            "SELECT {} FROM ledger_entries ORDER BY id",
            ENTRY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn all_admin_grants(&self) -> Result<Vec<AccountId>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT account_id FROM admin_grants ORDER BY account_id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(stored_id).collect()
    }

    async fn ledger_totals(&self) -> Result<Vec<LedgerTotal>> {
        let rows: Vec<TotalRecord> = sqlx::query_as(
            r#"
            SELECT a.id, a.points, COALESCE(SUM(e.amount), 0)::BIGINT AS ledger_sum
            FROM accounts a
            LEFT JOIN ledger_entries e ON e.subject_id = a.id
            GROUP BY a.id, a.points
            ORDER BY a.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(LedgerTotal {
                    account: stored_id(r.id)?,
                    cached: r.points,
                    ledger_sum: r.ledger_sum,
                })
            })
            .collect()
    }
}
