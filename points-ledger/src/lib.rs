//! Points Ledger Core
//!
//! Per-account point balances backed by a ledger of signed adjustments, with
//! an audit trail of every administrative action.
//!
//! # Architecture
//!
//! - **Ledger store**: validates, clamps and persists entries
//! - **Reconciliation**: the only path that moves a cached balance
//! - **Audit log**: best-effort trail written in the same transaction
//! - **Orchestrator**: authorizes and runs each command as one unit
//!
//! # Invariants
//!
//! - Balance consistency: `points == Σ amount` for every account after every
//!   committed command
//! - Entries carry a non-zero amount within the clamp bound and a reason
//! - The root account never loses its admin grant
//! - Concurrent commands on one account serialize on its row lock

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod audit;
pub mod config;
pub mod credentials;
pub mod entries;
pub mod error;
pub mod export;
pub mod metrics;
pub mod orchestrator;
pub mod reconcile;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use credentials::Registration;
pub use error::{Error, ErrorKind, Result};
pub use export::{Cell, Row, Table};
pub use orchestrator::{AdminToggle, Orchestrator};
pub use storage::{MemoryStore, PgStore, Store};
pub use types::{
    Account, AccountId, AccountRow, AccountSummary, AuditEntry, EntryKind, LedgerEntry, Page,
    SortKey,
};
