//! Flat table dumps
//!
//! Rows come back as ordered column/value pairs holding only primitives.
//! Formatting them as CSV, spreadsheets or SQL is left to the caller.

use chrono_tz::Tz;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::{audit::DISPLAY_TIME_FORMAT, storage::Store, Error, Result};

/// Tables that can be dumped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// `accounts`
    Accounts,
    /// `ledger_entries`
    LedgerEntries,
    /// `admin_grants`
    AdminGrants,
}

impl Table {
    /// Every dumpable table
    pub const ALL: [Table; 3] = [Table::Accounts, Table::LedgerEntries, Table::AdminGrants];

    /// Relation name
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Accounts => "accounts",
            Table::LedgerEntries => "ledger_entries",
            Table::AdminGrants => "admin_grants",
        }
    }

    /// Column names in output order
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Table::Accounts => &["id", "name", "credential_hash", "points"],
            Table::LedgerEntries => &[
                "id",
                "subject_id",
                "author_id",
                "created_at",
                "kind",
                "amount",
                "reason",
            ],
            Table::AdminGrants => &["account_id"],
        }
    }
}

impl FromStr for Table {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "accounts" => Ok(Table::Accounts),
            "ledger_entries" | "ledgerEntries" => Ok(Table::LedgerEntries),
            "admin_grants" | "adminGrants" => Ok(Table::AdminGrants),
            other => Err(Error::validation(format!("unknown table {:?}", other))),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A primitive column value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    /// Integer
    Int(i64),
    /// Text
    Text(String),
    /// SQL NULL
    Null,
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Cell::Int(v)
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Cell::Text(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::Text(v.to_string())
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(v: Option<T>) -> Self {
        v.map_or(Cell::Null, Into::into)
    }
}

/// One row; serializes as a JSON object with columns in table order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row(Vec<(&'static str, Cell)>);

impl Row {
    fn with(mut self, column: &'static str, value: impl Into<Cell>) -> Self {
        self.0.push((column, value.into()));
        self
    }

    /// Value of `column`
    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.0.iter().find(|(c, _)| *c == column).map(|(_, v)| v)
    }

    /// Column/value pairs in order
    pub fn cells(&self) -> &[(&'static str, Cell)] {
        &self.0
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (column, value) in &self.0 {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// Every row of `table`; timestamps rendered in `tz`
pub async fn dump_table(store: &dyn Store, table: Table, tz: Tz) -> Result<Vec<Row>> {
    let rows = match table {
        Table::Accounts => store
            .all_accounts()
            .await?
            .into_iter()
            .map(|a| {
                Row::default()
                    .with("id", a.id.as_str())
                    .with("name", a.name)
                    .with("credential_hash", a.credential_hash)
                    .with("points", a.points)
            })
            .collect(),
        Table::LedgerEntries => store
            .all_entries()
            .await?
            .into_iter()
            .map(|e| {
                Row::default()
                    .with("id", e.id)
                    .with("subject_id", e.subject.as_str())
                    .with("author_id", e.author.as_ref().map(|a| a.as_str()))
                    .with(
                        "created_at",
                        e.created_at.with_timezone(&tz).format(DISPLAY_TIME_FORMAT).to_string(),
                    )
                    .with("kind", e.kind.as_str())
                    .with("amount", e.amount)
                    .with("reason", e.reason)
            })
            .collect(),
        Table::AdminGrants => store
            .all_admin_grants()
            .await?
            .into_iter()
            .map(|id| Row::default().with("account_id", String::from(id)))
            .collect(),
    };
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_parse() {
        assert_eq!("accounts".parse::<Table>().unwrap(), Table::Accounts);
        assert_eq!("ledgerEntries".parse::<Table>().unwrap(), Table::LedgerEntries);
        assert_eq!("admin_grants".parse::<Table>().unwrap(), Table::AdminGrants);
        assert!("audit_log".parse::<Table>().is_err());
    }

    #[test]
    fn test_row_serializes_in_column_order() {
        let row = Row::default()
            .with("id", 3i64)
            .with("author_id", Option::<&str>::None)
            .with("reason", "quiz");
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"id":3,"author_id":null,"reason":"quiz"}"#);
        assert_eq!(row.get("reason"), Some(&Cell::Text("quiz".to_string())));
    }
}
