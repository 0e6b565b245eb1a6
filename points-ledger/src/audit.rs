//! Administrative audit trail
//!
//! Audit appends are best effort. A failed append is logged and counted and
//! the caller carries on; it never undoes the ledger mutation it describes.
//! When the write belongs to a ledger command it goes through the command's
//! own transaction, so a committed audit row always describes a committed
//! mutation.
//!
//! Rows older than the retention window are removed by [`RetentionSweep`].

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::{
    entries::EntryUpdate,
    metrics::Metrics,
    storage::{Store, Transaction},
    types::{Account, AccountId, AuditEntry, LedgerEntry, NewAuditEntry, Page, PageRequest},
    Result,
};

/// Operation names recorded with each audit row
pub mod operation {
    /// Single-target adjustment
    pub const ADJUST: &str = "/admin/adjust";
    /// Batch adjustment member
    pub const BATCH_ADJUST: &str = "/admin/batch_adjust";
    /// Entry update
    pub const UPDATE_ENTRY: &str = "/admin/record/update";
    /// Entry deletion
    pub const DELETE_ENTRY: &str = "/admin/record/delete";
    /// Admin grant toggle
    pub const TOGGLE_ADMIN: &str = "/admin/toggle_admin";
    /// Account registration
    pub const REGISTER: &str = "/register";
    /// Table export
    pub const EXPORT: &str = "/export";
}

/// Format used for timestamps inside descriptions
pub const DISPLAY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// "{actor} added 10 points to {target} {name} for the reason [ r ]"
pub fn describe_adjustment(actor: &AccountId, target: &Account, entry: &LedgerEntry) -> String {
    let (verb, preposition) = if entry.amount > 0 {
        ("added", "to")
    } else {
        ("removed", "from")
    };
    format!(
        "{} {} {} points {} {} {} for the reason [ {} ]",
        actor,
        verb,
        entry.amount.unsigned_abs(),
        preposition,
        target.id,
        target.name,
        entry.reason
    )
}

/// Lists only the fields that changed, or says "no changes"
pub fn describe_update(update: &EntryUpdate) -> String {
    let prev = &update.previous;
    let curr = &update.current;
    let mut text = format!("Updated entry {} for {} ( ", curr.id, curr.subject);

    if update.is_unchanged() {
        text.push_str("no changes ");
    }
    if prev.amount != curr.amount {
        text.push_str(&format!("amount: {} -> {} ; ", prev.amount, curr.amount));
    }
    if prev.reason != curr.reason {
        text.push_str(&format!("reason: {} -> {} ; ", prev.reason, curr.reason));
    }
    text.push(')');
    text
}

/// Full state of a removed entry
pub fn describe_deletion(entry: &LedgerEntry, tz: Tz) -> String {
    format!(
        "Deleted entry {} for {} with ( time = {} ; kind = {} ; amount = {} ; reason = {} )",
        entry.id,
        entry.subject,
        entry.created_at.with_timezone(&tz).format(DISPLAY_TIME_FORMAT),
        entry.kind,
        entry.amount,
        entry.reason
    )
}

/// Grant or revocation of the admin flag
pub fn describe_toggle(target: &AccountId, granted: bool) -> String {
    if granted {
        format!("{} was granted admin", target)
    } else {
        format!("{} was removed from admin", target)
    }
}

/// Audit trail writer and reader
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn Store>,
    metrics: Metrics,
    retention: chrono::Duration,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Create an audit log keeping rows for `retention_days`
    pub fn new(store: Arc<dyn Store>, metrics: Metrics, retention_days: i64) -> Self {
        Self {
            store,
            metrics,
            retention: chrono::Duration::days(retention_days),
        }
    }

    fn note_failure(&self, operation: &str, err: &crate::Error) {
        self.metrics.audit_failures.inc();
        warn!(operation, error = %err, "Audit write failed");
    }

    /// Append inside a ledger transaction. Returns whether the row was
    /// written.
    pub async fn record_in(
        &self,
        tx: &mut dyn Transaction,
        actor: Option<&AccountId>,
        operation: &str,
        description: String,
    ) -> bool {
        let entry = NewAuditEntry {
            actor: actor.cloned(),
            operation: operation.to_string(),
            description,
        };
        match tx.append_audit(&entry).await {
            Ok(()) => true,
            Err(e) => {
                self.note_failure(operation, &e);
                false
            }
        }
    }

    /// Append outside any ledger transaction. Returns whether the row was
    /// written.
    pub async fn record(
        &self,
        actor: Option<&AccountId>,
        operation: &str,
        description: String,
    ) -> bool {
        let entry = NewAuditEntry {
            actor: actor.cloned(),
            operation: operation.to_string(),
            description,
        };
        match self.store.append_audit(&entry).await {
            Ok(()) => true,
            Err(e) => {
                self.note_failure(operation, &e);
                false
            }
        }
    }

    /// Rows newest first, filtered by a case-insensitive description substring
    pub async fn search(&self, needle: Option<&str>, page: PageRequest) -> Result<Page<AuditEntry>> {
        self.store.search_audit(needle, page).await
    }

    /// Oldest timestamp still inside the retention window
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.retention
    }

    /// Delete rows older than the retention window
    pub async fn purge_expired(&self) -> Result<u64> {
        let cutoff = self.cutoff(Utc::now());
        let removed = self.store.purge_audit_before(cutoff).await?;
        self.metrics.audit_purged.inc_by(removed);
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Expired audit rows purged");
        }
        Ok(removed)
    }

    /// Purge now and then every `every` until the returned handle is shut
    /// down or dropped.
    pub fn spawn_retention_sweep(&self, every: Duration) -> RetentionSweep {
        let log = self.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = log.purge_expired().await {
                            error!(error = %e, "Audit retention sweep failed");
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        RetentionSweep {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running retention sweep
#[derive(Debug)]
pub struct RetentionSweep {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RetentionSweep {
    /// Stop the sweep and wait for it to finish
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            error!(error = %e, "Audit retention sweep task failed");
        }
    }
}
