//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify:
//! - Balance consistency: cached points == Σ amount after any command sequence
//! - Clamping: no stored amount exceeds the bound
//! - Sign normalization: the operation alone decides the sign

use points_ledger::{
    config::StorageBackend, Account, AccountId, Config, MemoryStore, Orchestrator, Store,
};
use proptest::prelude::*;
use std::sync::Arc;

const ADMIN: &str = "113062206";
const ACCOUNTS: [&str; 3] = ["300000001", "300000002", "300000003"];

#[derive(Debug, Clone)]
enum Command {
    Adjust {
        target: usize,
        add: bool,
        amount: i64,
        reason: &'static str,
    },
    Update {
        pick: usize,
        add: bool,
        amount: i64,
        reason: &'static str,
    },
    Delete {
        pick: usize,
    },
}

/// Strategy for generating raw amounts, clamped or not
fn amount_strategy() -> impl Strategy<Value = i64> {
    prop_oneof![-150i64..150, Just(0), Just(10_000), Just(-10_000)]
}

/// Strategy for generating reasons, sometimes blank
fn reason_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("quiz"), Just("bonus"), Just("late"), Just("  ")]
}

/// Strategy for generating admin commands
fn command_strategy() -> impl Strategy<Value = Command> {
    prop_oneof![
        3 => (0..ACCOUNTS.len(), any::<bool>(), amount_strategy(), reason_strategy())
            .prop_map(|(target, add, amount, reason)| Command::Adjust { target, add, amount, reason }),
        1 => (any::<usize>(), any::<bool>(), amount_strategy(), reason_strategy())
            .prop_map(|(pick, add, amount, reason)| Command::Update { pick, add, amount, reason }),
        1 => any::<usize>().prop_map(|pick| Command::Delete { pick }),
    ]
}

fn id(raw: &str) -> AccountId {
    AccountId::parse(raw).unwrap()
}

/// Create an orchestrator over a fresh in-memory store
async fn create_test_ledger() -> Orchestrator {
    let store = MemoryStore::new();
    for raw in std::iter::once(ADMIN).chain(ACCOUNTS) {
        store
            .insert_account(&Account {
                id: id(raw),
                name: format!("user-{}", raw),
                credential_hash: String::new(),
                points: 0,
            })
            .await
            .unwrap();
    }

    let config = Config {
        storage: StorageBackend::Memory,
        ..Config::default()
    };
    Orchestrator::open(Arc::new(store), &config).await.unwrap()
}

fn op(add: bool) -> &'static str {
    if add {
        "add"
    } else {
        "remove"
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: cached balance equals the ledger sum after every command
    #[test]
    fn prop_balance_matches_ledger(commands in prop::collection::vec(command_strategy(), 1..30)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger().await;
            let admin = id(ADMIN);

            for command in commands {
                // Errors are expected for blank reasons, zero amounts and
                // missing entries; the invariant must hold either way.
                match command {
                    Command::Adjust { target, add, amount, reason } => {
                        let _ = ledger
                            .adjust_single(&admin, &id(ACCOUNTS[target]), op(add), &amount.to_string(), reason)
                            .await;
                    }
                    Command::Update { pick, add, amount, reason } => {
                        let target = id(ACCOUNTS[pick % ACCOUNTS.len()]);
                        let entries = ledger.list_entries(&target).await.unwrap();
                        if let Some(entry) = entries.get(pick % entries.len().max(1)) {
                            let _ = ledger
                                .update_entry(&admin, &target, entry.id, op(add), &amount.to_string(), reason)
                                .await;
                        }
                    }
                    Command::Delete { pick } => {
                        let target = id(ACCOUNTS[pick % ACCOUNTS.len()]);
                        let entries = ledger.list_entries(&target).await.unwrap();
                        if let Some(entry) = entries.get(pick % entries.len().max(1)) {
                            ledger.delete_entry(&admin, &target, entry.id).await.unwrap();
                        }
                    }
                }

                let report = ledger.consistency_report().await.unwrap();
                prop_assert!(report.is_consistent(), "drifted: {:?}", report.drifted);
            }

            for raw in ACCOUNTS {
                let target = id(raw);
                let entries = ledger.list_entries(&target).await.unwrap();
                let sum: i64 = entries.iter().map(|e| e.amount).sum();
                let summary = ledger.get_account_summary(&target).await.unwrap();
                prop_assert_eq!(summary.balance, sum);
                for entry in &entries {
                    prop_assert!(entry.amount != 0);
                    prop_assert!(entry.amount.abs() <= 100);
                    prop_assert!(!entry.reason.trim().is_empty());
                }
            }
            Ok(())
        })?;
    }

    /// Property: the operation decides the sign, the clamp bounds the magnitude
    #[test]
    fn prop_sign_and_clamp(add in any::<bool>(), amount in prop_oneof![-100_000i64..-1, 1i64..100_000]) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger().await;
            let entry = ledger
                .adjust_single(&id(ADMIN), &id(ACCOUNTS[0]), op(add), &amount.to_string(), "r")
                .await
                .unwrap();

            let expected = amount.abs().min(100);
            prop_assert_eq!(entry.amount, if add { expected } else { -expected });
            Ok(())
        })?;
    }
}
