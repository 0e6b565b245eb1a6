use points_ledger::{AccountId, EntryKind, LedgerEntry};
use serde::{Deserialize, Serialize};

/// Amount as sent by a form (string) or a JSON client (number). Numbers
/// outside `i64` still reach the ledger, which clamps them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AmountInput {
    Number(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
}

impl AmountInput {
    pub fn as_raw(&self) -> String {
        match self {
            AmountInput::Number(n) => n.to_string(),
            AmountInput::Unsigned(n) => n.to_string(),
            // `as` saturates at the i64 bounds
            AmountInput::Float(f) if f.is_finite() && f.fract() == 0.0 => (*f as i64).to_string(),
            AmountInput::Float(f) => f.to_string(),
            AmountInput::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub account_id: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct AdjustRequest {
    pub account_id: AccountId,
    pub op: String,
    pub amount: AmountInput,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct BatchAdjustRequest {
    pub accounts: Vec<String>,
    pub op: String,
    pub amount: AmountInput,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct BatchAdjustResponse {
    pub requested: usize,
    pub committed: Vec<LedgerEntry>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateEntryRequest {
    pub account_id: AccountId,
    pub entry_id: i64,
    pub kind: String,
    pub amount: AmountInput,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct UpdateEntryResponse {
    pub entry: LedgerEntry,
    pub previous_amount: i64,
    pub previous_kind: EntryKind,
    pub changed: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeleteEntryRequest {
    pub account_id: AccountId,
    pub entry_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ToggleAdminRequest {
    pub account_id: AccountId,
}

#[derive(Debug, Default, Deserialize)]
pub struct AccountListQuery {
    pub search: Option<String>,
    pub sort: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub q: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}
