//! Authorization-hold lifecycle.
//!
//! A hold is a transaction record in `inflight` status reserving funds
//! against an account's available balance. It resolves by commit (possibly
//! partial), void, or the expiry sweep. The reservation lives in the
//! account's `pending_debit`; balances only move on commit. Cross-currency
//! holds lock their exchange rate at create time and commit with the stored
//! rate.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use summa_common::error::LedgerError;
use summa_common::event::{AggregateType, EventType, LedgerEvent};
use summa_common::time::MILLIS_PER_MINUTE;
use summa_common::transaction::{
    Entry, EntrySide, HoldDestination, TransactionRecord, TransactionStatus, TransactionType,
    FX_RATE_SCALE, MAX_DESTINATIONS,
};
use uuid::Uuid;

use crate::config::SYSTEM_WORLD;
use crate::ledger::Core;
use crate::mutator::BalanceChange;
use crate::orchestrator::{
    load_idempotent, map_storage_conflicts, resolve_party, save_idempotent, validate_amount,
    validate_reference, OperationOptions, PartyRef, ResolvedParty,
};
use crate::outbox;
use crate::plugin::HoldIntent;
use crate::runner::{RunOptions, TxContext};
use crate::storage::{from_row, to_row, Filter, Query, RowLock, Sort, Table};

pub const OUTBOX_TOPIC_HOLD: &str = "hold.lifecycle";

/// Result of a hold lifecycle operation. Serialized for idempotent replay.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldOutcome {
    pub hold: TransactionRecord,
    pub event: LedgerEvent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<Entry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed_amount: Option<u64>,
}

pub(crate) async fn create(
    core: &Core,
    source: &str,
    amount: u64,
    reference: &str,
    expires_in_minutes: u64,
    destinations: &[(String, u64)],
    opts: &OperationOptions,
) -> Result<HoldOutcome, LedgerError> {
    validate_amount(core, amount)?;
    validate_reference(reference)?;
    if expires_in_minutes == 0 {
        return Err(LedgerError::InvalidArgument(
            "hold expiry must be at least one minute".into(),
        ));
    }
    if destinations.len() > MAX_DESTINATIONS {
        return Err(LedgerError::InvalidArgument(format!(
            "at most {MAX_DESTINATIONS} hold destinations"
        )));
    }
    if !destinations.is_empty() {
        let total: u64 = destinations.iter().map(|(_, a)| a).sum();
        if total != amount {
            return Err(LedgerError::InvalidArgument(format!(
                "hold destinations sum to {total}, expected {amount}"
            )));
        }
        if destinations.iter().any(|(_, a)| *a == 0) {
            return Err(LedgerError::InvalidArgument(
                "hold destination amounts must be positive".into(),
            ));
        }
    }

    let run_opts = RunOptions {
        correlation_id: opts.correlation_id,
        retry_budget: None,
    };
    let result = core
        .runner
        .run(run_opts, |ctx| {
            Box::pin(create_body(
                core,
                ctx,
                source,
                amount,
                reference,
                expires_in_minutes,
                destinations,
                opts,
            ))
        })
        .await;
    map_storage_conflicts(result, reference)
}

async fn create_body(
    core: &Core,
    ctx: &mut TxContext,
    source: &str,
    amount: u64,
    reference: &str,
    expires_in_minutes: u64,
    destinations: &[(String, u64)],
    opts: &OperationOptions,
) -> Result<HoldOutcome, LedgerError> {
    if let Some(key) = &opts.idempotency_key {
        if let Some(stored) = load_idempotent(core, ctx, key, reference).await? {
            return deserialize_outcome(stored);
        }
    }

    let intent = HoldIntent {
        operation: "create",
        hold_id: None,
        reference: Some(reference.to_string()),
        amount: Some(amount),
    };
    core.plugins.before_hold(&intent).await?;

    let existing = ctx
        .storage()
        .find_one(
            Table::TransactionRecord,
            &Filter::new()
                .eq("ledgerId", core.config.ledger.as_str())
                .eq("reference", reference),
            RowLock::None,
        )
        .await?;
    if existing.is_some() {
        return Err(LedgerError::Duplicate {
            reference: reference.to_string(),
        });
    }

    let account = match resolve_party(core, ctx, &PartyRef::Holder(source.to_string())).await? {
        ResolvedParty::User(account) => *account,
        ResolvedParty::System(_) => {
            return Err(LedgerError::InvalidArgument(
                "holds reserve user account funds, not system accounts".into(),
            ))
        }
    };

    let hold = TransactionRecord {
        id: Uuid::new_v4(),
        ledger_id: core.config.ledger.clone(),
        transaction_type: TransactionType::Debit,
        reference: reference.to_string(),
        amount,
        currency: account.currency.clone(),
        description: opts.description.clone(),
        source_account_id: Some(account.id),
        destination_account_id: None,
        correlation_id: ctx.correlation_id,
        metadata: opts.metadata.clone().unwrap_or(Value::Null),
        status: TransactionStatus::Inflight,
        is_hold: true,
        hold_expires_at: Some(ctx.now + expires_in_minutes * MILLIS_PER_MINUTE),
        hold_destinations: if destinations.is_empty() {
            None
        } else {
            Some(
                destinations
                    .iter()
                    .map(|(d, a)| HoldDestination {
                        destination: d.clone(),
                        amount: *a,
                    })
                    .collect(),
            )
        },
        // rate captured now; commit reuses it even if the market moved
        fx_rate_micros: opts.fx_rate_micros,
        destination_currency: None,
        created_at: ctx.now,
        updated_at: ctx.now,
        posted_at: None,
    };
    let stored = ctx
        .storage()
        .insert(Table::TransactionRecord, to_row(&hold)?)
        .await?;
    let hold: TransactionRecord = from_row(stored)?;

    // reserve available funds without moving the balance
    core.mutator
        .apply_user(
            ctx,
            account.id,
            &BalanceChange::pending(hold.id, amount as i64, &account.currency),
            None,
        )
        .await?;

    let event = core
        .events
        .append(
            ctx,
            AggregateType::Hold,
            hold.id,
            EventType::HoldCreated,
            json!({
                "holdId": hold.id.to_string(),
                "accountId": account.id.to_string(),
                "amount": amount,
                "currency": account.currency,
                "expiresAt": hold.hold_expires_at,
                "reference": reference,
            }),
        )
        .await?;
    outbox::write(
        ctx,
        &core.config.ledger,
        OUTBOX_TOPIC_HOLD,
        serde_json::to_value(&event)
            .map_err(|e| LedgerError::Internal(format!("outbox payload: {e}")))?,
    )
    .await?;

    let outcome = HoldOutcome {
        hold,
        event,
        entries: Vec::new(),
        committed_amount: None,
    };
    if let Some(key) = &opts.idempotency_key {
        save_idempotent(core, ctx, key, reference, serialize_outcome(&outcome)?).await?;
    }
    let after = HoldIntent {
        operation: "create",
        hold_id: Some(outcome.hold.id),
        reference: Some(reference.to_string()),
        amount: Some(amount),
    };
    core.plugins.queue_after_hold(ctx, &after);
    Ok(outcome)
}

/// Commit a hold, possibly partially. Releases the full reservation, debits
/// only the committed amount, and credits the destinations pro-rata with a
/// deterministic remainder allocation.
pub(crate) async fn commit(
    core: &Core,
    reference: &str,
    committed_amount: Option<u64>,
    opts: &OperationOptions,
) -> Result<HoldOutcome, LedgerError> {
    validate_reference(reference)?;
    let run_opts = RunOptions {
        correlation_id: opts.correlation_id,
        retry_budget: None,
    };
    let result = core
        .runner
        .run(run_opts, |ctx| {
            Box::pin(commit_body(core, ctx, reference, committed_amount, opts))
        })
        .await;
    map_storage_conflicts(result, reference)
}

async fn commit_body(
    core: &Core,
    ctx: &mut TxContext,
    reference: &str,
    committed_amount: Option<u64>,
    opts: &OperationOptions,
) -> Result<HoldOutcome, LedgerError> {
    let idem_ref = format!("{reference}#commit");
    if let Some(key) = &opts.idempotency_key {
        if let Some(stored) = load_idempotent(core, ctx, key, &idem_ref).await? {
            return deserialize_outcome(stored);
        }
    }

    let hold = load_hold(core, ctx, reference).await?;
    if hold.status != TransactionStatus::Inflight {
        return Err(LedgerError::Conflict(format!(
            "hold {reference} is {}, not inflight",
            hold.status
        )));
    }
    if let Some(expires_at) = hold.hold_expires_at {
        if expires_at < ctx.now {
            return Err(LedgerError::HoldExpired {
                hold_id: reference.to_string(),
                expired_at: expires_at,
            });
        }
    }
    let committed = committed_amount.unwrap_or(hold.amount);
    if committed == 0 || committed > hold.amount {
        return Err(LedgerError::InvalidArgument(format!(
            "committed amount {committed} must be within (0, {}]",
            hold.amount
        )));
    }

    let intent = HoldIntent {
        operation: "commit",
        hold_id: Some(hold.id),
        reference: Some(reference.to_string()),
        amount: Some(committed),
    };
    core.plugins.before_hold(&intent).await?;

    let source_id = hold.source_account_id.ok_or_else(|| {
        LedgerError::Internal(format!("hold {reference} has no source account"))
    })?;

    // one mutation on the source: release the whole reservation, debit the
    // committed amount
    let mut source_change =
        BalanceChange::entry(hold.id, EntrySide::Debit, committed, &hold.currency);
    source_change.pending_debit_delta = -(hold.amount as i64);
    let source_outcome = core
        .mutator
        .apply_user(ctx, source_id, &source_change, None)
        .await?;
    let mut entries = Vec::new();
    if let Some(entry) = source_outcome.entry {
        write_velocity_for_hold(core, ctx, source_id, hold.id, EntrySide::Debit, committed).await?;
        entries.push(entry);
    }

    // destination split: floor quotients first, remainder added in order
    let world = core.config.system_identifier(SYSTEM_WORLD)?;
    let splits = allocate(committed, &hold, world);
    for (destination, alloc) in splits {
        if alloc == 0 {
            continue;
        }
        let party = resolve_party(core, ctx, &PartyRef::parse(&destination)).await?;
        let (credit_amount, fx, original) = convert_for_destination(&hold, &party, alloc)?;
        let mut change = BalanceChange::entry(hold.id, EntrySide::Credit, credit_amount, {
            match &party {
                ResolvedParty::User(a) => &a.currency,
                ResolvedParty::System(s) => &s.currency,
            }
        });
        change.fx_rate_micros = fx;
        change.original_amount = original;
        change.original_currency = original.map(|_| hold.currency.clone());
        let outcome = match &party {
            ResolvedParty::User(account) => {
                let out = core
                    .mutator
                    .apply_user(ctx, account.id, &change, None)
                    .await?;
                write_velocity_for_hold(core, ctx, account.id, hold.id, EntrySide::Credit, credit_amount)
                    .await?;
                out
            }
            ResolvedParty::System(system) => core.mutator.apply_system(ctx, system, &change).await?,
        };
        if let Some(entry) = outcome.entry {
            entries.push(entry);
        }
    }

    let mut metadata = as_object(hold.metadata.clone());
    metadata.insert("committedAmount".into(), Value::from(committed));
    let now = ctx.now;
    let affected = ctx
        .storage()
        .update(
            Table::TransactionRecord,
            &Filter::new()
                .eq("id", hold.id.to_string())
                .eq("status", "inflight"),
            [
                ("status".to_string(), Value::from("posted")),
                ("postedAt".to_string(), Value::from(now)),
                ("updatedAt".to_string(), Value::from(now)),
                ("metadata".to_string(), Value::Object(metadata)),
            ]
            .into_iter()
            .collect(),
        )
        .await?;
    if affected == 0 {
        return Err(LedgerError::Conflict(format!(
            "hold {reference} was resolved concurrently"
        )));
    }

    let event = core
        .events
        .append(
            ctx,
            AggregateType::Hold,
            hold.id,
            EventType::HoldCommitted,
            json!({
                "holdId": hold.id.to_string(),
                "committedAmount": committed,
                "originalAmount": hold.amount,
            }),
        )
        .await?;
    outbox::write(
        ctx,
        &core.config.ledger,
        OUTBOX_TOPIC_HOLD,
        serde_json::to_value(&event)
            .map_err(|e| LedgerError::Internal(format!("outbox payload: {e}")))?,
    )
    .await?;

    let mut hold = hold;
    hold.status = TransactionStatus::Posted;
    hold.posted_at = Some(ctx.now);
    let outcome = HoldOutcome {
        hold,
        event,
        entries,
        committed_amount: Some(committed),
    };
    if let Some(key) = &opts.idempotency_key {
        save_idempotent(core, ctx, key, &idem_ref, serialize_outcome(&outcome)?).await?;
    }
    core.plugins.queue_after_hold(ctx, &intent);
    Ok(outcome)
}

pub(crate) async fn void(
    core: &Core,
    reference: &str,
    opts: &OperationOptions,
) -> Result<HoldOutcome, LedgerError> {
    validate_reference(reference)?;
    let run_opts = RunOptions {
        correlation_id: opts.correlation_id,
        retry_budget: None,
    };
    let result = core
        .runner
        .run(run_opts, |ctx| {
            Box::pin(release_body(
                core,
                ctx,
                reference,
                TransactionStatus::Voided,
                opts,
            ))
        })
        .await;
    map_storage_conflicts(result, reference)
}

async fn release_body(
    core: &Core,
    ctx: &mut TxContext,
    reference: &str,
    to_status: TransactionStatus,
    opts: &OperationOptions,
) -> Result<HoldOutcome, LedgerError> {
    let idem_ref = format!("{reference}#void");
    if let Some(key) = &opts.idempotency_key {
        if let Some(stored) = load_idempotent(core, ctx, key, &idem_ref).await? {
            return deserialize_outcome(stored);
        }
    }

    let hold = load_hold(core, ctx, reference).await?;
    if hold.status != TransactionStatus::Inflight {
        return Err(LedgerError::Conflict(format!(
            "hold {reference} is {}, not inflight",
            hold.status
        )));
    }
    let intent = HoldIntent {
        operation: "void",
        hold_id: Some(hold.id),
        reference: Some(reference.to_string()),
        amount: Some(hold.amount),
    };
    core.plugins.before_hold(&intent).await?;

    let outcome = release_hold(core, ctx, hold, to_status).await?;
    if let Some(key) = &opts.idempotency_key {
        save_idempotent(core, ctx, key, &idem_ref, serialize_outcome(&outcome)?).await?;
    }
    core.plugins.queue_after_hold(ctx, &intent);
    Ok(outcome)
}

/// Release one inflight hold's reservation and move it to a terminal state.
async fn release_hold(
    core: &Core,
    ctx: &mut TxContext,
    hold: TransactionRecord,
    to_status: TransactionStatus,
) -> Result<HoldOutcome, LedgerError> {
    let source_id = hold.source_account_id.ok_or_else(|| {
        LedgerError::Internal(format!("hold {} has no source account", hold.reference))
    })?;
    core.mutator
        .apply_user(
            ctx,
            source_id,
            &BalanceChange::pending(hold.id, -(hold.amount as i64), &hold.currency),
            None,
        )
        .await?;

    let (status_str, event_type) = match to_status {
        TransactionStatus::Voided => ("voided", EventType::HoldVoided),
        TransactionStatus::Expired => ("expired", EventType::HoldExpired),
        _ => {
            return Err(LedgerError::Internal(format!(
                "{to_status} is not a hold release state"
            )))
        }
    };
    let now = ctx.now;
    let affected = ctx
        .storage()
        .update(
            Table::TransactionRecord,
            &Filter::new()
                .eq("id", hold.id.to_string())
                .eq("status", "inflight"),
            [
                ("status".to_string(), Value::from(status_str)),
                ("updatedAt".to_string(), Value::from(now)),
            ]
            .into_iter()
            .collect(),
        )
        .await?;
    if affected == 0 {
        return Err(LedgerError::Conflict(format!(
            "hold {} was resolved concurrently",
            hold.reference
        )));
    }

    let event = core
        .events
        .append(
            ctx,
            AggregateType::Hold,
            hold.id,
            event_type,
            json!({
                "holdId": hold.id.to_string(),
                "amount": hold.amount,
                "currency": hold.currency,
            }),
        )
        .await?;
    outbox::write(
        ctx,
        &core.config.ledger,
        OUTBOX_TOPIC_HOLD,
        serde_json::to_value(&event)
            .map_err(|e| LedgerError::Internal(format!("outbox payload: {e}")))?,
    )
    .await?;

    let mut hold = hold;
    hold.status = to_status;
    Ok(HoldOutcome {
        hold,
        event,
        entries: Vec::new(),
        committed_amount: None,
    })
}

/// Sweep expired inflight holds, releasing each like a void. Contended rows
/// are skipped and picked up by the next tick.
pub(crate) async fn expire_all(core: &Core, limit: usize) -> Result<u64, LedgerError> {
    core.runner
        .run(RunOptions::default(), |ctx| {
            Box::pin(expire_body(core, ctx, limit))
        })
        .await
}

pub(crate) async fn expire_body(
    core: &Core,
    ctx: &mut TxContext,
    limit: usize,
) -> Result<u64, LedgerError> {
    let now = ctx.now;
    let rows = ctx
        .storage()
        .find_many(
            Table::TransactionRecord,
            &Query {
                filter: Filter::new()
                    .eq("ledgerId", core.config.ledger.as_str())
                    .eq("isHold", true)
                    .eq("status", "inflight")
                    .lt("holdExpiresAt", now),
                sort: Some(Sort::asc("holdExpiresAt")),
                limit: Some(limit),
                lock: RowLock::ForUpdateSkipLocked,
                ..Default::default()
            },
        )
        .await?;
    if rows.is_empty() {
        return Ok(0);
    }
    debug!("expiring {} holds", rows.len());

    let mut expired = 0;
    for row in rows {
        let hold: TransactionRecord = from_row(row)?;
        let intent = HoldIntent {
            operation: "expire",
            hold_id: Some(hold.id),
            reference: Some(hold.reference.clone()),
            amount: Some(hold.amount),
        };
        release_hold(core, ctx, hold, TransactionStatus::Expired).await?;
        core.plugins.queue_after_hold(ctx, &intent);
        expired += 1;
    }
    Ok(expired)
}

// ===== helpers =====

async fn load_hold(
    core: &Core,
    ctx: &mut TxContext,
    reference: &str,
) -> Result<TransactionRecord, LedgerError> {
    let row = ctx
        .storage()
        .find_one(
            Table::TransactionRecord,
            &Filter::new()
                .eq("ledgerId", core.config.ledger.as_str())
                .eq("reference", reference),
            RowLock::ForUpdate,
        )
        .await?;
    let hold: TransactionRecord = match row {
        Some(row) => from_row(row)?,
        None => {
            return Err(LedgerError::NotFound {
                entity: "hold",
                id: reference.to_string(),
            })
        }
    };
    if !hold.is_hold {
        return Err(LedgerError::Conflict(format!(
            "transaction {reference} is not a hold"
        )));
    }
    Ok(hold)
}

/// Split the committed amount over the hold's destinations: floor-division
/// quotients first, then the remainder distributed one unit at a time in
/// destination order, so the parts sum to the committed amount exactly.
fn allocate(committed: u64, hold: &TransactionRecord, world: &str) -> Vec<(String, u64)> {
    let destinations: Vec<HoldDestination> = match &hold.hold_destinations {
        Some(d) => d.clone(),
        None => {
            // destination-less holds capture to the world account
            return vec![(world.to_string(), committed)];
        }
    };
    let mut parts: Vec<(String, u64)> = destinations
        .iter()
        .map(|d| {
            let quotient =
                (committed as u128 * d.amount as u128 / hold.amount as u128) as u64;
            (d.destination.clone(), quotient)
        })
        .collect();
    let allocated: u64 = parts.iter().map(|(_, a)| a).sum();
    let mut remainder = committed - allocated;
    for part in parts.iter_mut() {
        if remainder == 0 {
            break;
        }
        part.1 += 1;
        remainder -= 1;
    }
    parts
}

fn convert_for_destination(
    hold: &TransactionRecord,
    party: &ResolvedParty,
    alloc: u64,
) -> Result<(u64, Option<u64>, Option<u64>), LedgerError> {
    let dest_currency = match party {
        ResolvedParty::User(a) => a.currency.as_str(),
        ResolvedParty::System(s) => s.currency.as_str(),
    };
    if dest_currency == hold.currency {
        return Ok((alloc, None, None));
    }
    let rate = hold.fx_rate_micros.ok_or_else(|| {
        LedgerError::InvalidArgument(format!(
            "hold {} has no locked exchange rate for a {dest_currency} destination",
            hold.reference
        ))
    })?;
    let converted = (alloc as u128 * rate as u128 / FX_RATE_SCALE as u128) as u64;
    Ok((converted, Some(rate), Some(alloc)))
}

async fn write_velocity_for_hold(
    core: &Core,
    ctx: &mut TxContext,
    account_id: Uuid,
    transaction_id: Uuid,
    side: EntrySide,
    amount: u64,
) -> Result<(), LedgerError> {
    let row: crate::storage::Row = [
        ("id".to_string(), Value::from(Uuid::new_v4().to_string())),
        (
            "ledgerId".to_string(),
            Value::from(core.config.ledger.clone()),
        ),
        ("accountId".to_string(), Value::from(account_id.to_string())),
        (
            "transactionId".to_string(),
            Value::from(transaction_id.to_string()),
        ),
        ("amount".to_string(), Value::from(amount)),
        (
            "entrySide".to_string(),
            serde_json::to_value(side).unwrap_or(Value::Null),
        ),
        ("createdAt".to_string(), Value::from(ctx.now)),
    ]
    .into_iter()
    .collect();
    ctx.storage()
        .insert(Table::AccountTransactionLog, row)
        .await?;
    Ok(())
}

fn as_object(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

fn serialize_outcome(outcome: &HoldOutcome) -> Result<Value, LedgerError> {
    serde_json::to_value(outcome)
        .map_err(|e| LedgerError::Internal(format!("hold idempotency response: {e}")))
}

fn deserialize_outcome(value: Value) -> Result<HoldOutcome, LedgerError> {
    serde_json::from_value(value)
        .map_err(|e| LedgerError::Internal(format!("stored hold response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hold_with(destinations: Option<Vec<HoldDestination>>, amount: u64) -> TransactionRecord {
        TransactionRecord {
            id: Uuid::nil(),
            ledger_id: "default".into(),
            transaction_type: TransactionType::Debit,
            reference: "h-1".into(),
            amount,
            currency: "USD".into(),
            description: None,
            source_account_id: Some(Uuid::nil()),
            destination_account_id: None,
            correlation_id: Uuid::nil(),
            metadata: Value::Null,
            status: TransactionStatus::Inflight,
            is_hold: true,
            hold_expires_at: Some(1),
            hold_destinations: destinations,
            fx_rate_micros: None,
            destination_currency: None,
            created_at: 0,
            updated_at: 0,
            posted_at: None,
        }
    }

    fn dests(parts: &[(&str, u64)]) -> Option<Vec<HoldDestination>> {
        Some(
            parts
                .iter()
                .map(|(d, a)| HoldDestination {
                    destination: d.to_string(),
                    amount: *a,
                })
                .collect(),
        )
    }

    #[test]
    fn full_commit_allocates_exact_destination_amounts() {
        let hold = hold_with(dests(&[("shop", 47_500), ("@Fees", 2_500)]), 50_000);
        let parts = allocate(50_000, &hold, "@World");
        assert_eq!(parts, vec![("shop".into(), 47_500), ("@Fees".into(), 2_500)]);
    }

    #[test]
    fn partial_commit_distributes_remainder_in_order() {
        // 100 over three equal thirds: floors give 33+33+33, remainder 1
        // lands on the first destination
        let hold = hold_with(dests(&[("a", 100), ("b", 100), ("c", 100)]), 300);
        let parts = allocate(100, &hold, "@World");
        assert_eq!(
            parts,
            vec![("a".into(), 34), ("b".into(), 33), ("c".into(), 33)]
        );
        let total: u64 = parts.iter().map(|(_, a)| a).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn partial_commit_is_proportional() {
        let hold = hold_with(dests(&[("s", 47_500), ("f", 2_500)]), 50_000);
        let parts = allocate(12_500, &hold, "@World");
        let total: u64 = parts.iter().map(|(_, a)| a).sum();
        assert_eq!(total, 12_500);
        // 12_500 * 47_500 / 50_000 = 11_875 exactly
        assert_eq!(parts[0].1, 11_875);
        assert_eq!(parts[1].1, 625);
    }

    #[test]
    fn destination_less_holds_capture_to_world() {
        let hold = hold_with(None, 20_000);
        assert_eq!(allocate(12_500, &hold, "@World"), vec![("@World".into(), 12_500)]);
    }
}
