//! End-to-end scenarios on the in-memory adapter.

use std::sync::Arc;

use serde_json::Value;
use summa_ledger::accounts::CreateAccountArgs;
use summa_ledger::orchestrator::{JournalLeg, OperationOptions, PartyRef};
use summa_ledger::storage::memory::MemoryAdapter;
use summa_ledger::storage::Table;
use summa_ledger::{Ledger, LedgerConfig, LockMode};
use summa_ledger::common::account::{AccountType, NormalBalance};
use summa_ledger::common::event::AggregateType;
use summa_ledger::common::transaction::{EntrySide, TransactionStatus};

async fn ledger_with(lock_mode: LockMode) -> (Ledger, MemoryAdapter) {
    let adapter = MemoryAdapter::new();
    let mut config = LedgerConfig::default();
    config.advanced.hmac_secret = Some("scenario-secret".into());
    config.advanced.lock_mode = lock_mode;
    let ledger = Ledger::new(Arc::new(adapter.clone()), config)
        .await
        .unwrap();
    (ledger, adapter)
}

async fn ledger() -> (Ledger, MemoryAdapter) {
    ledger_with(LockMode::Wait).await
}

async fn create(ledger: &Ledger, holder: &str) {
    ledger
        .create_account(CreateAccountArgs::new(holder))
        .await
        .unwrap();
}

fn opts() -> OperationOptions {
    OperationOptions::default()
}

/// Σ(user balances) + Σ(system balances) + Σ(pending hot amounts) must be
/// zero across the whole ledger.
fn assert_global_zero(adapter: &MemoryAdapter) {
    let users: i64 = adapter
        .committed_rows(Table::Account)
        .iter()
        .filter_map(|r| r.get("balance").and_then(Value::as_i64))
        .sum();
    let systems: i64 = adapter
        .committed_rows(Table::SystemAccount)
        .iter()
        .filter_map(|r| r.get("balance").and_then(Value::as_i64))
        .sum();
    let hot: i64 = adapter
        .committed_rows(Table::HotAccountEntry)
        .iter()
        .map(|r| {
            let amount = r.get("amount").and_then(Value::as_i64).unwrap_or(0);
            match r.get("entrySide").and_then(Value::as_str) {
                Some("CREDIT") => amount,
                _ => -amount,
            }
        })
        .sum();
    assert_eq!(users + systems + hot, 0, "global double-entry sum broken");
}

/// For every transaction: Σ(credit amounts) = Σ(debit amounts) over its
/// entries. Hot entries live outside the entry table until flushed, so
/// transactions with a hot leg are skipped here.
fn assert_transactions_balance(adapter: &MemoryAdapter) {
    use std::collections::HashMap;
    let mut per_txn: HashMap<String, (i64, i64, bool)> = HashMap::new();
    for row in adapter.committed_rows(Table::Entry) {
        let txn = row
            .get("transactionId")
            .and_then(Value::as_str)
            .unwrap()
            .to_string();
        let amount = row.get("amount").and_then(Value::as_i64).unwrap();
        let fx = row.get("fxRateMicros").is_some();
        let slot = per_txn.entry(txn).or_insert((0, 0, false));
        match row.get("entrySide").and_then(Value::as_str) {
            Some("CREDIT") => slot.0 += amount,
            _ => slot.1 += amount,
        }
        slot.2 |= fx;
    }
    let hot_txns: std::collections::HashSet<String> = adapter
        .committed_rows(Table::HotAccountEntry)
        .iter()
        .filter_map(|r| r.get("transactionId").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    for (txn, (credits, debits, fx)) in per_txn {
        if fx || hot_txns.contains(&txn) {
            continue;
        }
        assert_eq!(credits, debits, "transaction {txn} entries do not balance");
    }
}

#[tokio::test]
async fn fund_and_transfer_with_chained_entries() {
    let (ledger, adapter) = ledger().await;
    create(&ledger, "alice").await;
    create(&ledger, "bob").await;

    let funded = ledger
        .credit("alice", 100_000, "fund-1", opts())
        .await
        .unwrap();
    assert_eq!(ledger.get_balance("alice").await.unwrap().balance, 100_000);
    assert_eq!(ledger.get_balance("bob").await.unwrap().balance, 0);

    let transferred = ledger
        .transfer("alice", "bob", 40_000, "t-1", opts())
        .await
        .unwrap();
    assert_eq!(ledger.get_balance("alice").await.unwrap().balance, 60_000);
    assert_eq!(ledger.get_balance("bob").await.unwrap().balance, 40_000);
    assert_global_zero(&adapter);
    assert_transactions_balance(&adapter);

    // alice's entry chain: funding credit then transfer debit, linked
    let alice = ledger.get_account("alice").await.unwrap();
    let bob = ledger.get_account("bob").await.unwrap();
    let alice_id = alice.id.to_string();
    let bob_id = bob.id.to_string();
    let mut alice_entries: Vec<_> = adapter
        .committed_rows(Table::Entry)
        .into_iter()
        .filter(|r| r.get("accountId").and_then(Value::as_str) == Some(alice_id.as_str()))
        .collect();
    alice_entries.sort_by_key(|r| r.get("accountVersion").and_then(Value::as_u64));
    assert_eq!(alice_entries.len(), 2);
    assert!(alice_entries[0].get("prevHash").is_none());
    assert_eq!(
        alice_entries[1].get("prevHash").and_then(Value::as_str),
        alice_entries[0].get("hash").and_then(Value::as_str)
    );
    let bob_entries = adapter
        .committed_rows(Table::Entry)
        .into_iter()
        .filter(|r| r.get("accountId").and_then(Value::as_str) == Some(bob_id.as_str()))
        .count();
    assert_eq!(bob_entries, 1);

    // one transaction:posted event per correlation
    for outcome in [&funded, &transferred] {
        let events = ledger
            .events_for_correlation(outcome.transaction.correlation_id)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_str(), "transaction:posted");
        let report = ledger
            .verify_chain(AggregateType::Transaction, outcome.transaction.id)
            .await
            .unwrap();
        assert!(report.valid);
    }
}

#[tokio::test]
async fn hold_partial_commit_releases_the_rest() {
    let (ledger, adapter) = ledger().await;
    create(&ledger, "xavier").await;
    ledger
        .credit("xavier", 50_000, "fund-2", opts())
        .await
        .unwrap();

    ledger
        .create_hold("xavier", 20_000, "h-1", 60, &[], opts())
        .await
        .unwrap();
    let balance = ledger.get_balance("xavier").await.unwrap();
    assert_eq!(balance.balance, 50_000);
    assert_eq!(balance.available, 30_000);

    let committed = ledger
        .commit_hold("h-1", Some(12_500), opts())
        .await
        .unwrap();
    assert_eq!(committed.committed_amount, Some(12_500));
    assert_eq!(committed.hold.status, TransactionStatus::Posted);
    let balance = ledger.get_balance("xavier").await.unwrap();
    assert_eq!(balance.balance, 37_500);
    assert_eq!(balance.available, 37_500);
    assert_global_zero(&adapter);

    // a second commit must fail
    let err = ledger
        .commit_hold("h-1", Some(1_000), opts())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

#[tokio::test]
async fn multi_destination_hold_commits_exactly() {
    let (ledger, adapter) = ledger().await;
    create(&ledger, "payer").await;
    create(&ledger, "shop").await;
    ledger
        .credit("payer", 50_000, "fund-3", opts())
        .await
        .unwrap();

    ledger
        .create_hold(
            "payer",
            50_000,
            "h-2",
            60,
            &[("shop".to_string(), 47_500), ("@Fees".to_string(), 2_500)],
            opts(),
        )
        .await
        .unwrap();
    ledger.commit_hold("h-2", None, opts()).await.unwrap();

    assert_eq!(ledger.get_balance("payer").await.unwrap().balance, 0);
    assert_eq!(ledger.get_balance("shop").await.unwrap().balance, 47_500);
    let fees = ledger.get_system_account("fees").await.unwrap();
    assert_eq!(fees.balance, 2_500);
    assert_global_zero(&adapter);
    assert_transactions_balance(&adapter);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn hundred_concurrent_debits_drain_to_exactly_zero_pessimistic() {
    let (ledger, adapter) = ledger().await;
    create(&ledger, "drain").await;
    ledger
        .credit("drain", 10_000, "fund-4", opts())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..100 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .debit("drain", 100, &format!("drain-{i}"), OperationOptions::default())
                .await
        }));
    }
    let mut posted = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.entries.iter().all(|e| e.balance_after >= 0));
        posted += 1;
    }
    assert_eq!(posted, 100);
    assert_eq!(ledger.get_balance("drain").await.unwrap().balance, 0);

    // 101 posted transactions: the funding credit plus 100 debits
    let records = adapter.committed_rows(Table::TransactionRecord);
    assert_eq!(records.len(), 101);
    assert_global_zero(&adapter);
    assert_transactions_balance(&adapter);

    // entry chain on the drained account has strictly increasing versions
    let account = ledger.get_account("drain").await.unwrap();
    let account_id = account.id.to_string();
    let mut versions: Vec<u64> = adapter
        .committed_rows(Table::Entry)
        .into_iter()
        .filter(|r| r.get("accountId").and_then(Value::as_str) == Some(account_id.as_str()))
        .filter_map(|r| r.get("accountVersion").and_then(Value::as_u64))
        .collect();
    versions.sort_unstable();
    let unique: std::collections::HashSet<u64> = versions.iter().copied().collect();
    assert_eq!(unique.len(), versions.len(), "duplicate account versions");
    assert_eq!(versions.len(), 101);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn hundred_concurrent_debits_drain_to_exactly_zero_optimistic() {
    let adapter = MemoryAdapter::new();
    let mut config = LedgerConfig::default();
    config.advanced.hmac_secret = Some("scenario-secret".into());
    config.advanced.lock_mode = LockMode::Optimistic;
    // worst case a task observes every other commit as a conflict once
    config.advanced.optimistic_retry_count = 128;
    config.advanced.retry_backoff_base_ms = 1;
    config.advanced.retry_backoff_max_ms = 4;
    let ledger = Ledger::new(Arc::new(adapter.clone()), config)
        .await
        .unwrap();
    create(&ledger, "drain").await;
    ledger
        .credit("drain", 10_000, "fund-5", opts())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..100 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .debit("drain", 100, &format!("drain-{i}"), OperationOptions::default())
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(ledger.get_balance("drain").await.unwrap().balance, 0);
    assert_global_zero(&adapter);
    assert_transactions_balance(&adapter);
}

#[tokio::test]
async fn tampering_breaks_the_chain_at_the_mutated_version() {
    let (ledger, adapter) = ledger().await;
    let account = ledger
        .create_account(CreateAccountArgs::new("audited"))
        .await
        .unwrap();
    // grow the account aggregate's stream: created, frozen, unfrozen
    ledger
        .freeze_account("audited", Some("review".into()))
        .await
        .unwrap();
    ledger.unfreeze_account("audited").await.unwrap();

    let events = ledger
        .events_for_aggregate(AggregateType::Account, account.id)
        .await
        .unwrap();
    assert_eq!(events.len(), 3);
    let victim = &events[1];
    assert_eq!(victim.aggregate_version, 2);

    adapter.tamper_with(Table::LedgerEvent, &victim.id.to_string(), |row| {
        row.insert(
            "eventData".into(),
            serde_json::json!({ "holderId": "mallory" }),
        );
    });

    let report = ledger
        .verify_chain(AggregateType::Account, account.id)
        .await
        .unwrap();
    assert!(!report.valid);
    assert_eq!(report.broken_at_version, Some(2));

    // an untampered sibling still verifies
    let (clean_ledger, _) = ledger().await;
    let clean = clean_ledger
        .create_account(CreateAccountArgs::new("clean"))
        .await
        .unwrap();
    let report = clean_ledger
        .verify_chain(AggregateType::Account, clean.id)
        .await
        .unwrap();
    assert!(report.valid);
    assert_eq!(report.checked, 1);
}

#[tokio::test]
async fn duplicate_reference_race_posts_exactly_once() {
    let (ledger, _) = ledger().await;
    create(&ledger, "dup").await;

    let (a, b) = tokio::join!(
        {
            let ledger = ledger.clone();
            async move { ledger.credit("dup", 100, "r-1", OperationOptions::default()).await }
        },
        {
            let ledger = ledger.clone();
            async move { ledger.credit("dup", 100, "r-1", OperationOptions::default()).await }
        }
    );
    let outcomes = [a, b];
    let ok = outcomes.iter().filter(|r| r.is_ok()).count();
    let dup = outcomes
        .iter()
        .filter(|r| matches!(r, Err(e) if e.code() == "DUPLICATE"))
        .count();
    assert_eq!(ok, 1);
    assert_eq!(dup, 1);
    assert_eq!(ledger.get_balance("dup").await.unwrap().balance, 100);
}

#[tokio::test]
async fn idempotent_replay_returns_stored_result_without_side_effects() {
    let (ledger, adapter) = ledger().await;
    create(&ledger, "idem").await;

    let key_opts = OperationOptions {
        idempotency_key: Some("key-1".into()),
        ..Default::default()
    };
    let first = ledger
        .credit("idem", 5_000, "idem-1", key_opts.clone())
        .await
        .unwrap();

    let counts = |adapter: &MemoryAdapter| {
        (
            adapter.committed_count(Table::Entry),
            adapter.committed_count(Table::TransactionRecord),
            adapter.committed_count(Table::LedgerEvent),
            adapter.committed_count(Table::Outbox),
        )
    };
    let before = counts(&adapter);

    let replay = ledger
        .credit("idem", 5_000, "idem-1", key_opts.clone())
        .await
        .unwrap();
    assert_eq!(replay.transaction.id, first.transaction.id);
    assert_eq!(replay.event.hash, first.event.hash);
    assert_eq!(counts(&adapter), before, "replay produced new rows");
    assert_eq!(ledger.get_balance("idem").await.unwrap().balance, 5_000);

    // the same key with a different reference is a conflict
    let err = ledger
        .credit("idem", 5_000, "idem-2", key_opts)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

#[tokio::test]
async fn refund_restores_the_original_balance() {
    let (ledger, adapter) = ledger().await;
    create(&ledger, "shopper").await;
    ledger
        .credit("shopper", 30_000, "c-1", opts())
        .await
        .unwrap();
    assert_transactions_balance(&adapter);

    ledger.refund("c-1", 30_000, "rf-1", opts()).await.unwrap();
    assert_eq!(ledger.get_balance("shopper").await.unwrap().balance, 0);
    assert_global_zero(&adapter);
    assert_transactions_balance(&adapter);

    // over-refunding is rejected
    let err = ledger
        .refund("c-1", 1, "rf-2", opts())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

#[tokio::test]
async fn partial_refunds_accumulate_up_to_the_original() {
    let (ledger, _) = ledger().await;
    create(&ledger, "partial").await;
    ledger
        .credit("partial", 10_000, "c-2", opts())
        .await
        .unwrap();

    ledger.refund("c-2", 4_000, "rf-3", opts()).await.unwrap();
    ledger.refund("c-2", 6_000, "rf-4", opts()).await.unwrap();
    assert_eq!(ledger.get_balance("partial").await.unwrap().balance, 0);

    let err = ledger.refund("c-2", 1, "rf-5", opts()).await.unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

#[tokio::test]
async fn boundary_amounts_are_rejected() {
    let (ledger, _) = ledger().await;
    create(&ledger, "edge").await;

    let err = ledger.credit("edge", 0, "z-1", opts()).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGUMENT");

    let err = ledger
        .credit("edge", 100_000_000_001, "z-2", opts())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGUMENT");
    assert_eq!(ledger.get_balance("edge").await.unwrap().balance, 0);
}

#[tokio::test]
async fn self_transfer_is_rejected_and_changes_nothing() {
    let (ledger, adapter) = ledger().await;
    create(&ledger, "selfie").await;
    ledger
        .credit("selfie", 1_000, "fund-6", opts())
        .await
        .unwrap();

    let err = ledger
        .transfer("selfie", "selfie", 500, "t-self", opts())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGUMENT");
    assert_eq!(ledger.get_balance("selfie").await.unwrap().balance, 1_000);
    assert_global_zero(&adapter);
}

#[tokio::test]
async fn frozen_accounts_reject_debits_and_holds_but_take_credits() {
    let (ledger, _) = ledger().await;
    create(&ledger, "cold").await;
    ledger.credit("cold", 2_000, "fund-7", opts()).await.unwrap();
    ledger
        .freeze_account("cold", Some("fraud review".into()))
        .await
        .unwrap();

    let err = ledger.debit("cold", 100, "d-1", opts()).await.unwrap_err();
    assert_eq!(err.code(), "ACCOUNT_FROZEN");
    let err = ledger
        .create_hold("cold", 100, "h-cold", 10, &[], opts())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ACCOUNT_FROZEN");
    ledger.credit("cold", 100, "c-3", opts()).await.unwrap();
    assert_eq!(ledger.get_balance("cold").await.unwrap().balance, 2_100);

    ledger.unfreeze_account("cold").await.unwrap();
    ledger.debit("cold", 2_100, "d-2", opts()).await.unwrap();
    assert_eq!(ledger.get_balance("cold").await.unwrap().balance, 0);
}

#[tokio::test]
async fn closed_accounts_reject_everything_and_closing_needs_zero_balance() {
    let (ledger, _) = ledger().await;
    create(&ledger, "done").await;
    ledger.credit("done", 500, "fund-8", opts()).await.unwrap();

    let err = ledger.close_account("done").await.unwrap_err();
    assert_eq!(err.code(), "CONFLICT");

    ledger.debit("done", 500, "d-3", opts()).await.unwrap();
    ledger.close_account("done").await.unwrap();

    let err = ledger.credit("done", 100, "c-4", opts()).await.unwrap_err();
    assert_eq!(err.code(), "ACCOUNT_CLOSED");
}

#[tokio::test]
async fn expiry_sweep_releases_overdue_holds() {
    let (ledger, adapter) = ledger().await;
    create(&ledger, "expiring").await;
    ledger
        .credit("expiring", 5_000, "fund-9", opts())
        .await
        .unwrap();
    let hold = ledger
        .create_hold("expiring", 3_000, "h-exp", 1, &[], opts())
        .await
        .unwrap();
    assert_eq!(ledger.get_balance("expiring").await.unwrap().available, 2_000);

    // push the deadline into the past
    adapter.tamper_with(Table::TransactionRecord, &hold.hold.id.to_string(), |row| {
        row.insert("holdExpiresAt".into(), serde_json::json!(1));
    });

    let expired = ledger.expire_holds().await.unwrap();
    assert_eq!(expired, 1);
    let balance = ledger.get_balance("expiring").await.unwrap();
    assert_eq!(balance.balance, 5_000);
    assert_eq!(balance.available, 5_000);

    let events = ledger
        .events_for_aggregate(AggregateType::Hold, hold.hold.id)
        .await
        .unwrap();
    assert_eq!(events.last().unwrap().event_type.as_str(), "hold:expired");

    // committing the expired hold fails
    let err = ledger.commit_hold("h-exp", None, opts()).await.unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

#[tokio::test]
async fn voided_holds_release_funds_and_refuse_commit() {
    let (ledger, _) = ledger().await;
    create(&ledger, "voider").await;
    ledger
        .credit("voider", 4_000, "fund-10", opts())
        .await
        .unwrap();
    ledger
        .create_hold("voider", 1_500, "h-void", 30, &[], opts())
        .await
        .unwrap();
    ledger.void_hold("h-void", opts()).await.unwrap();

    let balance = ledger.get_balance("voider").await.unwrap();
    assert_eq!(balance.available, 4_000);

    let err = ledger.void_hold("h-void", opts()).await.unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
    let err = ledger.commit_hold("h-void", None, opts()).await.unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

#[tokio::test]
async fn hold_with_insufficient_available_funds_is_rejected() {
    let (ledger, _) = ledger().await;
    create(&ledger, "thin").await;
    ledger.credit("thin", 1_000, "fund-11", opts()).await.unwrap();
    ledger
        .create_hold("thin", 800, "h-a", 30, &[], opts())
        .await
        .unwrap();

    let err = ledger
        .create_hold("thin", 300, "h-b", 30, &[], opts())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
}

#[tokio::test]
async fn journal_posts_balanced_multi_leg_entries() {
    let (ledger, adapter) = ledger().await;
    create(&ledger, "j-a").await;
    create(&ledger, "j-b").await;
    ledger.credit("j-a", 1_000, "fund-12", opts()).await.unwrap();

    let legs = vec![
        JournalLeg {
            party: PartyRef::Holder("j-a".into()),
            side: EntrySide::Debit,
            amount: 500,
        },
        JournalLeg {
            party: PartyRef::Holder("j-b".into()),
            side: EntrySide::Credit,
            amount: 300,
        },
        JournalLeg {
            party: PartyRef::System("@Fees".into()),
            side: EntrySide::Credit,
            amount: 200,
        },
    ];
    ledger.journal(&legs, "j-1", opts()).await.unwrap();

    assert_eq!(ledger.get_balance("j-a").await.unwrap().balance, 500);
    assert_eq!(ledger.get_balance("j-b").await.unwrap().balance, 300);
    assert_eq!(ledger.get_system_account("fees").await.unwrap().balance, 200);
    assert_global_zero(&adapter);
    assert_transactions_balance(&adapter);

    // unbalanced legs never reach storage
    let bad = vec![
        JournalLeg {
            party: PartyRef::Holder("j-a".into()),
            side: EntrySide::Debit,
            amount: 100,
        },
        JournalLeg {
            party: PartyRef::Holder("j-b".into()),
            side: EntrySide::Credit,
            amount: 99,
        },
    ];
    let err = ledger.journal(&bad, "j-2", opts()).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGUMENT");
}

#[tokio::test]
async fn multi_transfer_splits_one_debit_across_destinations() {
    let (ledger, adapter) = ledger().await;
    create(&ledger, "m-src").await;
    create(&ledger, "m-a").await;
    create(&ledger, "m-b").await;
    ledger
        .credit("m-src", 1_000, "fund-13", opts())
        .await
        .unwrap();

    ledger
        .multi_transfer(
            "m-src",
            &[("m-a".to_string(), 300), ("m-b".to_string(), 700)],
            "mt-1",
            opts(),
        )
        .await
        .unwrap();
    assert_eq!(ledger.get_balance("m-src").await.unwrap().balance, 0);
    assert_eq!(ledger.get_balance("m-a").await.unwrap().balance, 300);
    assert_eq!(ledger.get_balance("m-b").await.unwrap().balance, 700);
    assert_global_zero(&adapter);
    assert_transactions_balance(&adapter);
}

#[tokio::test]
async fn cross_currency_transfer_uses_the_scaled_rate() {
    let (ledger, _) = ledger().await;
    create(&ledger, "usd-holder").await;
    let mut args = CreateAccountArgs::new("eur-holder");
    args.currency = Some("EUR".into());
    ledger.create_account(args).await.unwrap();
    ledger
        .credit("usd-holder", 10_000, "fund-14", opts())
        .await
        .unwrap();

    // 1 USD = 0.9137 EUR
    let fx_opts = OperationOptions {
        fx_rate_micros: Some(913_700),
        ..Default::default()
    };
    let outcome = ledger
        .transfer("usd-holder", "eur-holder", 10_000, "fx-1", fx_opts)
        .await
        .unwrap();
    assert_eq!(outcome.destination_amount, Some(9_137));
    assert_eq!(ledger.get_balance("eur-holder").await.unwrap().balance, 9_137);

    // without a rate the transfer is rejected
    let err = ledger
        .transfer("usd-holder", "eur-holder", 100, "fx-2", opts())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGUMENT");
}

#[tokio::test]
async fn hot_accounts_defer_balance_materialization_until_flush() {
    let (ledger, adapter) = ledger().await;
    create(&ledger, "hot-user").await;
    ledger
        .set_system_account_hot("world", true)
        .await
        .unwrap();

    ledger
        .credit("hot-user", 1_000, "fund-15", opts())
        .await
        .unwrap();
    // the world side sits in the hot-entry ledger, not the balance
    let world = ledger.get_system_account("world").await.unwrap();
    assert_eq!(world.balance, 0);
    assert_eq!(adapter.committed_count(Table::HotAccountEntry), 1);
    assert_global_zero(&adapter);

    let flushed = ledger.flush_hot_accounts().await.unwrap();
    assert_eq!(flushed, 1);
    let world = ledger.get_system_account("world").await.unwrap();
    assert_eq!(world.balance, -1_000);
    assert_eq!(adapter.committed_count(Table::HotAccountEntry), 0);
    assert_global_zero(&adapter);
}

#[tokio::test]
async fn outbox_rows_commit_with_the_state_change() {
    let (ledger, _) = ledger().await;
    create(&ledger, "observer").await;
    ledger
        .credit("observer", 1_000, "fund-16", opts())
        .await
        .unwrap();

    let pending = ledger.fetch_outbox(10).await.unwrap();
    // account.created + transaction.posted at least
    assert!(pending.len() >= 2);
    let ids: Vec<_> = pending.iter().map(|e| e.id).collect();
    let marked = ledger.mark_outbox_processed(&ids).await.unwrap();
    assert_eq!(marked as usize, ids.len());
    assert!(ledger.fetch_outbox(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn snapshot_verification_extends_from_the_stored_prefix() {
    let (ledger, _) = ledger().await;
    let account = ledger
        .create_account(CreateAccountArgs::new("snap"))
        .await
        .unwrap();
    ledger
        .freeze_account("snap", Some("pause".into()))
        .await
        .unwrap();

    let report = ledger
        .snapshot_chain(AggregateType::Account, account.id)
        .await
        .unwrap();
    assert!(report.valid);
    assert_eq!(report.checked, 2);

    ledger.unfreeze_account("snap").await.unwrap();
    let report = ledger
        .verify_chain_from_snapshot(AggregateType::Account, account.id)
        .await
        .unwrap();
    assert!(report.valid);
    // only the suffix past the snapshot is checked
    assert_eq!(report.checked, 1);
}

#[tokio::test]
async fn checkpoints_commit_to_the_event_sequence() {
    let (ledger, _) = ledger().await;
    create(&ledger, "cp-user").await;
    ledger
        .credit("cp-user", 1_000, "fund-17", opts())
        .await
        .unwrap();

    let first = ledger.checkpoint().await.unwrap();
    assert!(first.is_some());
    // no new events, no new checkpoint
    assert!(ledger.checkpoint().await.unwrap().is_none());

    ledger.debit("cp-user", 500, "d-4", opts()).await.unwrap();
    assert!(ledger.checkpoint().await.unwrap().is_some());

    let report = ledger.verify_checkpoints().await.unwrap();
    assert!(report.valid);
}

#[tokio::test]
async fn adjust_moves_signed_amounts_through_the_adjustment_account() {
    let (ledger, adapter) = ledger().await;
    create(&ledger, "adj").await;

    ledger.adjust("adj", 2_500, "a-1", opts()).await.unwrap();
    assert_eq!(ledger.get_balance("adj").await.unwrap().balance, 2_500);
    ledger.adjust("adj", -500, "a-2", opts()).await.unwrap();
    assert_eq!(ledger.get_balance("adj").await.unwrap().balance, 2_000);
    let adjustment = ledger.get_system_account("adjustment").await.unwrap();
    assert_eq!(adjustment.balance, -2_000);
    assert_global_zero(&adapter);
}

#[tokio::test]
async fn debit_normal_accounts_carry_the_inverse_sign_invariant() {
    let (ledger, adapter) = ledger().await;
    let mut cash = CreateAccountArgs::new("cash");
    cash.normal_balance = NormalBalance::Debit;
    cash.account_type = Some(AccountType::Asset);
    ledger.create_account(cash).await.unwrap();
    let mut expenses = CreateAccountArgs::new("expenses");
    expenses.normal_balance = NormalBalance::Debit;
    expenses.account_type = Some(AccountType::Expense);
    ledger.create_account(expenses).await.unwrap();

    // fund the asset account: a debit raises a debit-normal balance
    let fund = vec![
        JournalLeg {
            party: PartyRef::Holder("cash".into()),
            side: EntrySide::Debit,
            amount: 10_000,
        },
        JournalLeg {
            party: PartyRef::System("@World".into()),
            side: EntrySide::Credit,
            amount: 10_000,
        },
    ];
    ledger.journal(&fund, "dn-1", opts()).await.unwrap();
    let cash_acc = ledger.get_account("cash").await.unwrap();
    assert_eq!(cash_acc.balance, 10_000);
    assert_eq!(
        cash_acc.balance,
        cash_acc.debit_balance - cash_acc.credit_balance
    );

    // book an expense: debit the expense up, credit the asset down
    let expense = vec![
        JournalLeg {
            party: PartyRef::Holder("expenses".into()),
            side: EntrySide::Debit,
            amount: 2_500,
        },
        JournalLeg {
            party: PartyRef::Holder("cash".into()),
            side: EntrySide::Credit,
            amount: 2_500,
        },
    ];
    ledger.journal(&expense, "dn-2", opts()).await.unwrap();
    let cash_acc = ledger.get_account("cash").await.unwrap();
    let expenses_acc = ledger.get_account("expenses").await.unwrap();
    assert_eq!(cash_acc.balance, 7_500);
    assert_eq!(
        cash_acc.balance,
        cash_acc.debit_balance - cash_acc.credit_balance
    );
    assert_eq!(expenses_acc.balance, 2_500);
    assert_eq!(
        expenses_acc.balance,
        expenses_acc.debit_balance - expenses_acc.credit_balance
    );
    assert_transactions_balance(&adapter);

    // the reducing side of a debit-normal account is the credit, so a
    // credit past the balance is rejected
    let overdraw = vec![
        JournalLeg {
            party: PartyRef::Holder("expenses".into()),
            side: EntrySide::Debit,
            amount: 8_000,
        },
        JournalLeg {
            party: PartyRef::Holder("cash".into()),
            side: EntrySide::Credit,
            amount: 8_000,
        },
    ];
    let err = ledger.journal(&overdraw, "dn-3", opts()).await.unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
    assert_eq!(ledger.get_balance("cash").await.unwrap().balance, 7_500);
}

#[tokio::test]
async fn correction_reverses_the_whole_posting() {
    let (ledger, adapter) = ledger().await;
    create(&ledger, "fixme").await;
    create(&ledger, "other").await;
    ledger
        .credit("fixme", 8_000, "fund-18", opts())
        .await
        .unwrap();
    ledger
        .transfer("fixme", "other", 3_000, "t-wrong", opts())
        .await
        .unwrap();

    ledger.correct("t-wrong", "fix-1", opts()).await.unwrap();
    assert_eq!(ledger.get_balance("fixme").await.unwrap().balance, 8_000);
    assert_eq!(ledger.get_balance("other").await.unwrap().balance, 0);
    assert_global_zero(&adapter);
    assert_transactions_balance(&adapter);
}
