//! Core types for the points ledger
//!
//! Amounts are plain `i64` points. The sign of an entry's amount is the
//! source of truth; [`EntryKind`] is a redundant label derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Length of an account identifier
pub const ACCOUNT_ID_LEN: usize = 9;

/// Account identifier: exactly nine ASCII digits
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    /// Parse and validate an account id. Surrounding whitespace is ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        let id = raw.trim();
        if id.len() != ACCOUNT_ID_LEN || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::validation(format!(
                "account id must be {} digits, got {:?}",
                ACCOUNT_ID_LEN, id
            )));
        }
        Ok(Self(id.to_string()))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AccountId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AccountId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<AccountId> for String {
    fn from(id: AccountId) -> Self {
        id.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user account with its cached balance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Account identifier
    pub id: AccountId,
    /// Display name
    pub name: String,
    /// Argon2 PHC string
    pub credential_hash: String,
    /// Cached balance; equals the sum of the account's ledger entries
    pub points: i64,
}

/// Ledger entry identifier
pub type EntryId = i64;

/// Audit log entry identifier
pub type AuditId = i64;

/// Direction of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Points added
    Credit,
    /// Points removed
    Debit,
}

impl EntryKind {
    /// Stored label
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Credit => "credit",
            EntryKind::Debit => "debit",
        }
    }

    /// Kind implied by the sign of a (non-zero) amount
    pub fn of_amount(amount: i64) -> Self {
        if amount < 0 {
            EntryKind::Debit
        } else {
            EntryKind::Credit
        }
    }

    /// Force the sign of `magnitude` to match this kind, whatever sign the
    /// caller passed.
    pub fn signed(&self, magnitude: i64) -> i64 {
        let abs = magnitude.saturating_abs();
        match self {
            EntryKind::Credit => abs,
            EntryKind::Debit => -abs,
        }
    }
}

impl FromStr for EntryKind {
    type Err = Error;

    /// Accepts the stored labels and the admin form operations
    /// (`add` / `remove`).
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "credit" | "add" => Ok(EntryKind::Credit),
            "debit" | "remove" => Ok(EntryKind::Debit),
            other => Err(Error::validation(format!("unknown entry kind {:?}", other))),
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adjustment operation requested by an admin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustOp {
    /// Add points
    Add,
    /// Remove points
    Remove,
}

impl AdjustOp {
    /// Entry kind produced by this operation
    pub fn kind(&self) -> EntryKind {
        match self {
            AdjustOp::Add => EntryKind::Credit,
            AdjustOp::Remove => EntryKind::Debit,
        }
    }
}

impl FromStr for AdjustOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "add" => Ok(AdjustOp::Add),
            "remove" => Ok(AdjustOp::Remove),
            other => Err(Error::validation(format!("unknown operation {:?}", other))),
        }
    }
}

/// A signed point adjustment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry id
    pub id: EntryId,
    /// Account whose balance this entry moves
    pub subject: AccountId,
    /// Admin who created the entry; `None` once that account is gone
    pub author: Option<AccountId>,
    /// Server-assigned creation time, never changed by updates
    pub created_at: DateTime<Utc>,
    /// Redundant label for the sign of `amount`
    pub kind: EntryKind,
    /// Non-zero signed amount
    pub amount: i64,
    /// Why the adjustment was made
    pub reason: String,
}

/// Entry about to be inserted; the store assigns id and timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    /// Subject account
    pub subject: AccountId,
    /// Authoring admin
    pub author: AccountId,
    /// Kind, consistent with `amount`
    pub kind: EntryKind,
    /// Clamped, non-zero amount
    pub amount: i64,
    /// Non-empty reason
    pub reason: String,
}

/// One row of the administrative audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Audit id
    pub id: AuditId,
    /// Acting account, if known
    pub actor: Option<AccountId>,
    /// Time of the action
    pub created_at: DateTime<Utc>,
    /// Originating operation
    pub operation: String,
    /// Human readable description
    pub description: String,
}

/// Audit row about to be appended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditEntry {
    /// Acting account, if known
    pub actor: Option<AccountId>,
    /// Originating operation
    pub operation: String,
    /// Human readable description
    pub description: String,
}

/// Read model for a single account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    /// Account id
    pub account_id: AccountId,
    /// Display name
    pub name: String,
    /// Cached balance
    pub balance: i64,
    /// Holds the admin grant
    pub is_admin: bool,
}

/// Row of the paged account listing; balance and count are aggregated from
/// the ledger, not read from the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRow {
    /// Account id
    pub account_id: AccountId,
    /// Display name
    pub name: String,
    /// Sum of the account's entries
    pub balance: i64,
    /// Number of entries
    pub entry_count: i64,
}

/// Sort order for the account listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Account id ascending
    #[default]
    AccountAsc,
    /// Account id descending
    AccountDesc,
    /// Name ascending
    NameAsc,
    /// Name descending
    NameDesc,
    /// Balance ascending
    PointsAsc,
    /// Balance descending
    PointsDesc,
}

impl FromStr for SortKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "account_asc" => Ok(SortKey::AccountAsc),
            "account_desc" => Ok(SortKey::AccountDesc),
            "name_asc" => Ok(SortKey::NameAsc),
            "name_desc" => Ok(SortKey::NameDesc),
            "points_asc" => Ok(SortKey::PointsAsc),
            "points_desc" => Ok(SortKey::PointsDesc),
            other => Err(Error::validation(format!("unknown sort key {:?}", other))),
        }
    }
}

/// Pagination request. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number
    pub page: u32,
    /// Rows per page
    pub page_size: u32,
}

impl PageRequest {
    /// Build a request, coercing page 0 to 1 and page size 0 to 1
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
        }
    }

    /// Rows to skip
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }

    /// Rows to take
    pub fn limit(&self) -> u64 {
        u64::from(self.page_size)
    }
}

/// One page of results plus the total row count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Rows on this page
    pub items: Vec<T>,
    /// Rows across all pages
    pub total: u64,
    /// 1-based page number
    pub page: u32,
    /// Requested page size
    pub page_size: u32,
}

impl<T> Page<T> {
    /// Number of pages needed for `total` rows
    pub fn total_pages(&self) -> u64 {
        self.total.div_ceil(u64::from(self.page_size.max(1)))
    }
}

/// Query for the paged account listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountQuery {
    /// Case-insensitive substring matched against id and name
    pub search: Option<String>,
    /// Sort order
    pub sort: SortKey,
    /// Page
    pub page: PageRequest,
}
