//! Transaction orchestration.
//!
//! Every operation runs the same pipeline inside one runner invocation:
//! validate, idempotency short-circuit, before-hooks, account resolution
//! (locking in ascending account-id order), balance mutation through the
//! mutator, event append, outbox / velocity / idempotency writes, and
//! after-hooks queued as after-commit callbacks. On SQL-capable backends
//! the common two-leg credit/debit path collapses the writes into a single
//! chained-CTE statement.

use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use summa_common::account::Account;
use summa_common::error::{LedgerError, StorageError};
use summa_common::event::{AggregateType, EventType, LedgerEvent};
use summa_common::time::TimestampMillis;
use summa_common::transaction::{
    Entry, EntrySide, TransactionRecord, TransactionStatus, TransactionType, FX_RATE_SCALE,
    MAX_JOURNAL_LEGS,
};
use uuid::Uuid;

use crate::config::{LockMode, SYSTEM_ADJUSTMENT, SYSTEM_WORLD};
use crate::cte::{build_two_leg_posting, LegValues, TwoLegPosting};
use crate::ledger::Core;
use crate::mutator::BalanceChange;
use crate::outbox;
use crate::plugin::TransactionIntent;
use crate::runner::{RunOptions, TxContext};
use crate::storage::{
    from_row, to_row, Filter, Row, RowLock, Table, IDX_ENTRY_ACCOUNT_VERSION,
    IDX_EVENT_AGGREGATE_VERSION, IDX_IDEMPOTENCY_KEY, IDX_TXN_REFERENCE,
};

pub const OUTBOX_TOPIC_TRANSACTION: &str = "transaction.posted";

/// Caller-supplied per-operation options.
#[derive(Clone, Debug, Default)]
pub struct OperationOptions {
    /// Makes a repeated call return the stored result without side effects.
    pub idempotency_key: Option<String>,
    /// Reuse a correlation id instead of minting one.
    pub correlation_id: Option<Uuid>,
    pub description: Option<String>,
    pub metadata: Option<Value>,
    /// Exchange rate scaled by 10^6, for cross-currency transfers and holds.
    pub fx_rate_micros: Option<u64>,
}

/// The stored, serializable result of a posting. Idempotent replays return
/// this exact value.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOutcome {
    pub transaction: TransactionRecord,
    pub entries: Vec<Entry>,
    pub event: LedgerEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_amount: Option<u64>,
}

/// Addresses one side of a posting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartyRef {
    /// User account by holder id.
    Holder(String),
    /// System account by `@`-prefixed identifier.
    System(String),
    /// Either table, by primary key (used by refunds and corrections).
    AccountId(Uuid),
}

impl PartyRef {
    /// `@`-prefixed names address system accounts, anything else a holder.
    pub fn parse(s: &str) -> Self {
        if s.starts_with('@') {
            PartyRef::System(s.to_string())
        } else {
            PartyRef::Holder(s.to_string())
        }
    }

    fn display(&self) -> String {
        match self {
            PartyRef::Holder(h) => h.clone(),
            PartyRef::System(s) => s.clone(),
            PartyRef::AccountId(id) => id.to_string(),
        }
    }
}

/// One leg of a journal posting.
#[derive(Clone, Debug)]
pub struct JournalLeg {
    pub party: PartyRef,
    pub side: EntrySide,
    pub amount: u64,
}

#[derive(Clone, Debug)]
pub(crate) struct PostingRequest {
    pub txn_type: TransactionType,
    pub reference: String,
    pub amount: u64,
    pub currency: String,
    pub source: Option<PartyRef>,
    pub destination: Option<PartyRef>,
    /// Multi-transfer split; amounts sum to `amount`.
    pub destinations: Vec<(PartyRef, u64)>,
    pub journal_legs: Vec<JournalLeg>,
    pub fx_rate_micros: Option<u64>,
    pub description: Option<String>,
    pub metadata: Value,
    pub idempotency_key: Option<String>,
    /// Links a refund or correction back to the command it reverses.
    pub original_transaction_id: Option<Uuid>,
}

impl PostingRequest {
    fn new(txn_type: TransactionType, reference: &str, amount: u64, currency: String) -> Self {
        Self {
            txn_type,
            reference: reference.to_string(),
            amount,
            currency,
            source: None,
            destination: None,
            destinations: Vec::new(),
            journal_legs: Vec::new(),
            fx_rate_micros: None,
            description: None,
            metadata: Value::Null,
            idempotency_key: None,
            original_transaction_id: None,
        }
    }

    fn with_options(mut self, opts: &OperationOptions) -> Self {
        self.idempotency_key = opts.idempotency_key.clone();
        self.description = opts.description.clone();
        self.metadata = opts.metadata.clone().unwrap_or(Value::Null);
        self.fx_rate_micros = opts.fx_rate_micros;
        self
    }
}

pub(crate) enum ResolvedParty {
    User(Box<Account>),
    System(Box<summa_common::account::SystemAccount>),
}

impl ResolvedParty {
    pub(crate) fn account_id(&self) -> Uuid {
        match self {
            ResolvedParty::User(a) => a.id,
            ResolvedParty::System(s) => s.id,
        }
    }

    fn currency(&self) -> &str {
        match self {
            ResolvedParty::User(a) => &a.currency,
            ResolvedParty::System(s) => &s.currency,
        }
    }

    fn is_user(&self) -> bool {
        matches!(self, ResolvedParty::User(_))
    }
}

struct Leg {
    party: ResolvedParty,
    side: EntrySide,
    amount: u64,
    currency: String,
    fx_rate_micros: Option<u64>,
    original_amount: Option<u64>,
    original_currency: Option<String>,
}

// ===== public operations =====

pub(crate) async fn credit(
    core: &Core,
    holder: &str,
    amount: u64,
    reference: &str,
    opts: &OperationOptions,
) -> Result<TransactionOutcome, LedgerError> {
    validate_posting(core, amount, reference)?;
    let mut req = PostingRequest::new(
        TransactionType::Credit,
        reference,
        amount,
        core.config.currency.clone(),
    )
    .with_options(opts);
    req.source = Some(PartyRef::System(
        core.config.system_identifier(SYSTEM_WORLD)?.to_string(),
    ));
    req.destination = Some(PartyRef::Holder(holder.to_string()));
    run_posting(core, req, opts).await
}

pub(crate) async fn debit(
    core: &Core,
    holder: &str,
    amount: u64,
    reference: &str,
    opts: &OperationOptions,
) -> Result<TransactionOutcome, LedgerError> {
    validate_posting(core, amount, reference)?;
    let mut req = PostingRequest::new(
        TransactionType::Debit,
        reference,
        amount,
        core.config.currency.clone(),
    )
    .with_options(opts);
    req.source = Some(PartyRef::Holder(holder.to_string()));
    req.destination = Some(PartyRef::System(
        core.config.system_identifier(SYSTEM_WORLD)?.to_string(),
    ));
    run_posting(core, req, opts).await
}

pub(crate) async fn transfer(
    core: &Core,
    source: &str,
    destination: &str,
    amount: u64,
    reference: &str,
    opts: &OperationOptions,
) -> Result<TransactionOutcome, LedgerError> {
    validate_posting(core, amount, reference)?;
    let mut req = PostingRequest::new(
        TransactionType::Transfer,
        reference,
        amount,
        core.config.currency.clone(),
    )
    .with_options(opts);
    req.source = Some(PartyRef::Holder(source.to_string()));
    req.destination = Some(PartyRef::parse(destination));
    run_posting(core, req, opts).await
}

pub(crate) async fn multi_transfer(
    core: &Core,
    source: &str,
    destinations: &[(String, u64)],
    reference: &str,
    opts: &OperationOptions,
) -> Result<TransactionOutcome, LedgerError> {
    let amount: u64 = destinations.iter().map(|(_, a)| a).sum();
    validate_posting(core, amount, reference)?;
    if destinations.is_empty() {
        return Err(LedgerError::InvalidArgument(
            "multi transfer needs at least one destination".into(),
        ));
    }
    if destinations.len() > summa_common::transaction::MAX_DESTINATIONS {
        return Err(LedgerError::InvalidArgument(format!(
            "at most {} destinations per transfer",
            summa_common::transaction::MAX_DESTINATIONS
        )));
    }
    if destinations.iter().any(|(_, a)| *a == 0) {
        return Err(LedgerError::InvalidArgument(
            "destination amounts must be positive".into(),
        ));
    }
    let mut req = PostingRequest::new(
        TransactionType::Transfer,
        reference,
        amount,
        core.config.currency.clone(),
    )
    .with_options(opts);
    req.source = Some(PartyRef::Holder(source.to_string()));
    req.destinations = destinations
        .iter()
        .map(|(d, a)| (PartyRef::parse(d), *a))
        .collect();
    run_posting(core, req, opts).await
}

/// Reverse part or all of a posted transaction. The cumulative refunded
/// amount is tracked on the original's metadata and capped at its amount.
pub(crate) async fn refund(
    core: &Core,
    original_reference: &str,
    amount: u64,
    reference: &str,
    opts: &OperationOptions,
) -> Result<TransactionOutcome, LedgerError> {
    validate_posting(core, amount, reference)?;
    reverse(core, original_reference, Some(amount), reference, TransactionType::Refund, opts).await
}

/// Full reversal of a posted transaction.
pub(crate) async fn correct(
    core: &Core,
    original_reference: &str,
    reference: &str,
    opts: &OperationOptions,
) -> Result<TransactionOutcome, LedgerError> {
    validate_reference(reference)?;
    reverse(core, original_reference, None, reference, TransactionType::Correction, opts).await
}

/// Signed adjustment against the system adjustment account.
pub(crate) async fn adjust(
    core: &Core,
    holder: &str,
    delta: i64,
    reference: &str,
    opts: &OperationOptions,
) -> Result<TransactionOutcome, LedgerError> {
    if delta == 0 {
        return Err(LedgerError::InvalidArgument(
            "adjustment delta must be non-zero".into(),
        ));
    }
    let amount = delta.unsigned_abs();
    validate_posting(core, amount, reference)?;
    let adjustment = PartyRef::System(core.config.system_identifier(SYSTEM_ADJUSTMENT)?.to_string());
    let mut req = PostingRequest::new(
        TransactionType::Adjustment,
        reference,
        amount,
        core.config.currency.clone(),
    )
    .with_options(opts);
    if delta > 0 {
        req.source = Some(adjustment);
        req.destination = Some(PartyRef::Holder(holder.to_string()));
    } else {
        req.source = Some(PartyRef::Holder(holder.to_string()));
        req.destination = Some(adjustment);
    }
    run_posting(core, req, opts).await
}

/// Raw N-leg posting. Credits and debits must balance.
pub(crate) async fn journal(
    core: &Core,
    legs: &[JournalLeg],
    reference: &str,
    opts: &OperationOptions,
) -> Result<TransactionOutcome, LedgerError> {
    validate_reference(reference)?;
    if legs.is_empty() || legs.len() > MAX_JOURNAL_LEGS {
        return Err(LedgerError::InvalidArgument(format!(
            "journal must have between 1 and {MAX_JOURNAL_LEGS} legs"
        )));
    }
    let credits: u64 = legs
        .iter()
        .filter(|l| l.side == EntrySide::Credit)
        .map(|l| l.amount)
        .sum();
    let debits: u64 = legs
        .iter()
        .filter(|l| l.side == EntrySide::Debit)
        .map(|l| l.amount)
        .sum();
    if credits != debits {
        return Err(LedgerError::InvalidArgument(format!(
            "journal legs do not balance: credits {credits}, debits {debits}"
        )));
    }
    if legs.iter().any(|l| l.amount == 0) {
        return Err(LedgerError::InvalidArgument(
            "journal leg amounts must be positive".into(),
        ));
    }
    validate_amount(core, credits)?;
    let mut req = PostingRequest::new(
        TransactionType::Journal,
        reference,
        credits,
        core.config.currency.clone(),
    )
    .with_options(opts);
    req.journal_legs = legs.to_vec();
    run_posting(core, req, opts).await
}

// ===== pipeline =====

async fn run_posting(
    core: &Core,
    req: PostingRequest,
    opts: &OperationOptions,
) -> Result<TransactionOutcome, LedgerError> {
    let run_opts = RunOptions {
        correlation_id: opts.correlation_id,
        retry_budget: None,
    };
    let result = core
        .runner
        .run(run_opts, |ctx| Box::pin(post(core, ctx, &req)))
        .await;
    map_storage_conflicts(result, &req.reference)
}

/// Translate commit-time unique violations into the domain outcome the
/// caller expects.
pub(crate) fn map_storage_conflicts<T>(
    result: Result<T, LedgerError>,
    reference: &str,
) -> Result<T, LedgerError> {
    match result {
        Err(LedgerError::Storage(StorageError::UniqueViolation { index })) => {
            if index == IDX_TXN_REFERENCE {
                Err(LedgerError::Duplicate {
                    reference: reference.to_string(),
                })
            } else if index == IDX_IDEMPOTENCY_KEY {
                Err(LedgerError::Conflict(
                    "idempotency key written concurrently".into(),
                ))
            } else if index == IDX_ENTRY_ACCOUNT_VERSION || index == IDX_EVENT_AGGREGATE_VERSION {
                Err(LedgerError::OptimisticLockConflict {
                    entity: "account",
                    id: reference.to_string(),
                })
            } else {
                Err(LedgerError::Storage(StorageError::UniqueViolation { index }))
            }
        }
        other => other,
    }
}

async fn post(
    core: &Core,
    ctx: &mut TxContext,
    req: &PostingRequest,
) -> Result<TransactionOutcome, LedgerError> {
    // 1. idempotent replay short-circuits before anything else
    if let Some(stored) = check_idempotency(core, ctx, req).await? {
        return Ok(stored);
    }

    // 2. before-hooks may veto
    let intent = TransactionIntent {
        transaction_type: req.txn_type,
        reference: req.reference.clone(),
        amount: req.amount,
        currency: req.currency.clone(),
        source: req.source.as_ref().map(|p| p.display()),
        destination: req.destination.as_ref().map(|p| p.display()),
        metadata: req.metadata.clone(),
    };
    core.plugins.before_transaction(&intent).await?;

    // 3. duplicate reference pre-check; the unique index is the backstop
    let existing = ctx
        .storage()
        .find_one(
            Table::TransactionRecord,
            &Filter::new()
                .eq("ledgerId", core.config.ledger.as_str())
                .eq("reference", req.reference.as_str()),
            RowLock::None,
        )
        .await?;
    if existing.is_some() {
        return Err(LedgerError::Duplicate {
            reference: req.reference.clone(),
        });
    }

    // 4. resolve accounts and build legs
    let legs = build_legs(core, ctx, req).await?;

    // 5-7. writes: one statement on SQL backends, logical ops elsewhere
    let outcome = match try_single_statement(core, ctx, req, &legs).await? {
        Some(outcome) => outcome,
        None => post_logical(core, ctx, req, &legs).await?,
    };

    // 8. after-hooks never block the write path
    core.plugins.queue_after_transaction(ctx, &outcome);
    Ok(outcome)
}

/// The portable write path: mutator per leg, then event, outbox, velocity
/// and idempotency rows.
async fn post_logical(
    core: &Core,
    ctx: &mut TxContext,
    req: &PostingRequest,
    legs: &[Leg],
) -> Result<TransactionOutcome, LedgerError> {
    let destination_amount = legs
        .iter()
        .find(|l| l.original_amount.is_some())
        .map(|l| l.amount);
    let transaction = insert_transaction(core, ctx, req, legs).await?;

    // every writer takes row locks in this order: user accounts ascending
    // id, then system accounts ascending id
    let mut order: Vec<usize> = (0..legs.len()).collect();
    order.sort_by_key(|&i| (!legs[i].party.is_user(), legs[i].party.account_id()));

    let pessimistic = core.config.advanced.lock_mode.is_pessimistic();
    let lock = match core.config.advanced.lock_mode {
        LockMode::Wait => RowLock::ForUpdate,
        LockMode::Nowait => RowLock::ForUpdateNoWait,
        LockMode::Optimistic => RowLock::None,
    };

    let mut entries = Vec::with_capacity(legs.len());
    for i in order {
        let leg = &legs[i];
        let mut change = BalanceChange::entry(
            transaction.id,
            leg.side,
            leg.amount,
            &leg.currency,
        );
        change.fx_rate_micros = leg.fx_rate_micros;
        change.original_amount = leg.original_amount;
        change.original_currency = leg.original_currency.clone();

        let outcome = match &leg.party {
            ResolvedParty::User(account) => {
                // pessimistic mode re-reads under lock; optimistic trusts
                // the resolution read plus the version predicate
                let snapshot = if pessimistic {
                    core.mutator.load_user(ctx, account.id, lock).await?
                } else {
                    (**account).clone()
                };
                core.mutator
                    .apply_user(ctx, account.id, &change, Some(snapshot))
                    .await?
            }
            ResolvedParty::System(system) => {
                let system = if pessimistic {
                    load_system_by_id(core, ctx, system.id, lock).await?
                } else {
                    (**system).clone()
                };
                core.mutator.apply_system(ctx, &system, &change).await?
            }
        };
        if let Some(entry) = outcome.entry {
            entries.push(entry);
        }
        if leg.party.is_user() {
            write_velocity(core, ctx, leg.party.account_id(), transaction.id, leg.side, leg.amount)
                .await?;
        }
    }

    let event_data = event_payload(req, &transaction, destination_amount);
    let event = core
        .events
        .append(
            ctx,
            AggregateType::Transaction,
            transaction.id,
            EventType::TransactionPosted,
            event_data,
        )
        .await?;

    outbox::write(
        ctx,
        &core.config.ledger,
        OUTBOX_TOPIC_TRANSACTION,
        serde_json::to_value(&event)
            .map_err(|e| LedgerError::Internal(format!("outbox payload: {e}")))?,
    )
    .await?;

    let outcome = TransactionOutcome {
        transaction,
        entries,
        event,
        destination_amount,
    };
    store_idempotency(core, ctx, req, &outcome).await?;
    Ok(outcome)
}

/// Single-statement fast path for the plain two-leg credit/debit shape on
/// SQL-capable backends. Returns `None` when the shape or backend does not
/// fit and the logical path should run.
async fn try_single_statement(
    core: &Core,
    ctx: &mut TxContext,
    req: &PostingRequest,
    legs: &[Leg],
) -> Result<Option<TransactionOutcome>, LedgerError> {
    if !core.adapter.capabilities().raw_sql
        || legs.len() != 2
        || req.fx_rate_micros.is_some()
        || !matches!(req.txn_type, TransactionType::Credit | TransactionType::Debit)
        || core.config.advanced.lock_mode.is_pessimistic()
    {
        return Ok(None);
    }
    let hot = legs.iter().any(|l| match &l.party {
        ResolvedParty::System(s) => s.hot,
        _ => false,
    });
    if hot {
        return Ok(None);
    }

    let now = ctx.now;
    let transaction = transaction_record(core, req, legs, ctx.correlation_id, now);
    let mut leg_values = Vec::with_capacity(2);
    let mut entries = Vec::with_capacity(2);
    let mut user_leg: Option<(Uuid, EntrySide, u64)> = None;

    for leg in legs {
        let (values, entry) = match &leg.party {
            ResolvedParty::User(account) => {
                user_leg = Some((account.id, leg.side, leg.amount));
                let values = core.mutator.compute_user(account, leg.side, leg.amount)?;
                let entry = core
                    .mutator
                    .build_entry(ctx, account.id, false, transaction.id, leg.side, leg.amount, &req.currency, &values)
                    .await?;
                (values, entry)
            }
            ResolvedParty::System(system) => {
                let values = core.mutator.compute_system(system, leg.side, leg.amount);
                let entry = core
                    .mutator
                    .build_entry(ctx, system.id, true, transaction.id, leg.side, leg.amount, &req.currency, &values)
                    .await?;
                (values, entry)
            }
        };
        leg_values.push(LegValues {
            entry_id: entry.id.to_string(),
            account_id: entry.account_id.to_string(),
            system_account: entry.system_account,
            entry_side: match leg.side {
                EntrySide::Debit => "DEBIT",
                EntrySide::Credit => "CREDIT",
            },
            amount: leg.amount,
            balance_before: values.balance_before,
            balance_after: values.balance_after,
            credit_balance: values.credit_balance,
            debit_balance: values.debit_balance,
            pending_debit: values.pending_debit,
            new_version: values.new_version,
            expected_version: values.new_version - 1,
            hash: entry.hash.clone(),
            prev_hash: entry.prev_hash.clone(),
            checksum: values.checksum.clone(),
        });
        entries.push(entry);
    }

    let (velocity_account, _, _) =
        user_leg.ok_or_else(|| LedgerError::Internal("two-leg posting without a user leg".into()))?;
    let event_data = event_payload(req, &transaction, None);
    let event_hash = core
        .events
        .hasher()
        .chain_hash(None, &summa_common::canonical::canonical_string(&event_data));
    let event = LedgerEvent {
        id: Uuid::new_v4(),
        ledger_id: core.config.ledger.clone(),
        sequence_number: 0,
        aggregate_type: AggregateType::Transaction,
        aggregate_id: transaction.id,
        aggregate_version: 1,
        event_type: EventType::TransactionPosted,
        event_data: event_data.clone(),
        correlation_id: ctx.correlation_id,
        hash: event_hash.clone(),
        prev_hash: None,
        created_at: now,
    };

    let first_is_debit = leg_values[0].entry_side == "DEBIT";
    let mut leg_iter = leg_values.into_iter();
    let (debit_leg, credit_leg) = match (leg_iter.next(), leg_iter.next()) {
        (Some(first), Some(second)) if first_is_debit => (first, second),
        (Some(first), Some(second)) => (second, first),
        _ => return Err(LedgerError::Internal("two-leg posting lost a leg".into())),
    };

    let outcome = TransactionOutcome {
        transaction: transaction.clone(),
        entries,
        event: event.clone(),
        destination_amount: None,
    };
    let idempotency = req.idempotency_key.as_ref().map(|key| {
        (
            Uuid::new_v4().to_string(),
            key.clone(),
            serde_json::to_value(&outcome).unwrap_or(Value::Null),
            now + core.config.advanced.idempotency_ttl_ms,
        )
    });

    let posting = TwoLegPosting {
        ledger_id: core.config.ledger.clone(),
        transaction_id: transaction.id.to_string(),
        transaction_type: transaction.transaction_type.to_string(),
        reference: req.reference.clone(),
        amount: req.amount,
        currency: req.currency.clone(),
        correlation_id: ctx.correlation_id.to_string(),
        metadata: req.metadata.clone(),
        debit: debit_leg,
        credit: credit_leg,
        event_id: event.id.to_string(),
        event_type: event.event_type.as_str().to_string(),
        event_data,
        event_hash,
        outbox_id: Uuid::new_v4().to_string(),
        outbox_topic: OUTBOX_TOPIC_TRANSACTION.to_string(),
        velocity_id: Uuid::new_v4().to_string(),
        velocity_account_id: velocity_account.to_string(),
        idempotency,
        now,
    };
    let plan = build_two_leg_posting(&posting);
    trace!("single-statement posting for {}", req.reference);
    let rows = ctx.storage().raw(&plan.sql, plan.params).await?;
    let updated = rows
        .first()
        .and_then(|r| r.get("updated_accounts"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if updated != 2 {
        return Err(LedgerError::OptimisticLockConflict {
            entity: "account",
            id: req.reference.clone(),
        });
    }
    Ok(Some(outcome))
}

async fn build_legs(
    core: &Core,
    ctx: &mut TxContext,
    req: &PostingRequest,
) -> Result<Vec<Leg>, LedgerError> {
    let mut legs = Vec::new();

    if !req.journal_legs.is_empty() {
        for leg in &req.journal_legs {
            let party = resolve_party(core, ctx, &leg.party).await?;
            check_currency(&party, &req.currency)?;
            legs.push(Leg {
                party,
                side: leg.side,
                amount: leg.amount,
                currency: req.currency.clone(),
                fx_rate_micros: None,
                original_amount: None,
                original_currency: None,
            });
        }
        return Ok(legs);
    }

    if !req.destinations.is_empty() {
        let source = resolve_required(core, ctx, req.source.as_ref(), "source").await?;
        check_currency(&source, &req.currency)?;
        let source_id = source.account_id();
        legs.push(Leg {
            party: source,
            side: EntrySide::Debit,
            amount: req.amount,
            currency: req.currency.clone(),
            fx_rate_micros: None,
            original_amount: None,
            original_currency: None,
        });
        for (party_ref, amount) in &req.destinations {
            let party = resolve_party(core, ctx, party_ref).await?;
            if party.account_id() == source_id {
                return Err(LedgerError::InvalidArgument(
                    "source and destination accounts are identical".into(),
                ));
            }
            check_currency(&party, &req.currency)?;
            legs.push(Leg {
                party,
                side: EntrySide::Credit,
                amount: *amount,
                currency: req.currency.clone(),
                fx_rate_micros: None,
                original_amount: None,
                original_currency: None,
            });
        }
        return Ok(legs);
    }

    let source = resolve_required(core, ctx, req.source.as_ref(), "source").await?;
    let destination = resolve_required(core, ctx, req.destination.as_ref(), "destination").await?;
    if source.account_id() == destination.account_id() {
        return Err(LedgerError::InvalidArgument(
            "source and destination accounts are identical".into(),
        ));
    }

    // cross-currency needs a rate; same-currency forbids a mismatched one
    let dest_currency = destination.currency().to_string();
    let (credit_amount, fx) = if dest_currency != req.currency {
        let rate = req.fx_rate_micros.ok_or_else(|| {
            LedgerError::InvalidArgument(format!(
                "destination currency {dest_currency} differs from {}; an exchange rate is required",
                req.currency
            ))
        })?;
        if rate == 0 {
            return Err(LedgerError::InvalidArgument("exchange rate must be positive".into()));
        }
        let converted = (req.amount as u128 * rate as u128 / FX_RATE_SCALE as u128) as u64;
        if converted == 0 {
            return Err(LedgerError::InvalidArgument(
                "converted amount rounds to zero".into(),
            ));
        }
        (converted, Some(rate))
    } else {
        (req.amount, None)
    };

    check_currency(&source, &req.currency)?;
    legs.push(Leg {
        party: source,
        side: EntrySide::Debit,
        amount: req.amount,
        currency: req.currency.clone(),
        fx_rate_micros: fx,
        original_amount: None,
        original_currency: None,
    });
    legs.push(Leg {
        party: destination,
        side: EntrySide::Credit,
        amount: credit_amount,
        currency: dest_currency,
        fx_rate_micros: fx,
        original_amount: fx.map(|_| req.amount),
        original_currency: fx.map(|_| req.currency.clone()),
    });
    Ok(legs)
}

async fn reverse(
    core: &Core,
    original_reference: &str,
    amount: Option<u64>,
    reference: &str,
    txn_type: TransactionType,
    opts: &OperationOptions,
) -> Result<TransactionOutcome, LedgerError> {
    let run_opts = RunOptions {
        correlation_id: opts.correlation_id,
        retry_budget: None,
    };
    let result = core
        .runner
        .run(run_opts, |ctx| {
            Box::pin(reverse_body(
                core,
                ctx,
                original_reference,
                amount,
                reference,
                txn_type,
                opts,
            ))
        })
        .await;
    map_storage_conflicts(result, reference)
}

async fn reverse_body(
    core: &Core,
    ctx: &mut TxContext,
    original_reference: &str,
    amount: Option<u64>,
    reference: &str,
    txn_type: TransactionType,
    opts: &OperationOptions,
) -> Result<TransactionOutcome, LedgerError> {
    // lock the original so concurrent reversals serialize on its row
    let row = ctx
        .storage()
        .find_one(
            Table::TransactionRecord,
            &Filter::new()
                .eq("ledgerId", core.config.ledger.as_str())
                .eq("reference", original_reference),
            RowLock::ForUpdate,
        )
        .await?;
    let original: TransactionRecord = match row {
        Some(row) => from_row(row)?,
        None => {
            return Err(LedgerError::NotFound {
                entity: "transaction",
                id: original_reference.to_string(),
            })
        }
    };
    if original.status != TransactionStatus::Posted || original.is_hold {
        return Err(LedgerError::Conflict(format!(
            "transaction {original_reference} is not a posted transaction"
        )));
    }

    let already_refunded = original
        .metadata
        .get("refundedAmount")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let amount = amount.unwrap_or(original.amount - already_refunded.min(original.amount));
    if amount == 0 {
        return Err(LedgerError::InvalidArgument("nothing left to reverse".into()));
    }
    if already_refunded + amount > original.amount {
        return Err(LedgerError::Conflict(format!(
            "refund of {amount} exceeds remaining {} on {original_reference}",
            original.amount - already_refunded
        )));
    }

    let (source_id, destination_id) = match (original.destination_account_id, original.source_account_id)
    {
        (Some(d), Some(s)) => (d, s),
        _ => {
            return Err(LedgerError::Conflict(format!(
                "transaction {original_reference} has no reversible account pair"
            )))
        }
    };

    let mut req = PostingRequest::new(txn_type, reference, amount, original.currency.clone())
        .with_options(opts);
    req.source = Some(PartyRef::AccountId(source_id));
    req.destination = Some(PartyRef::AccountId(destination_id));
    req.original_transaction_id = Some(original.id);
    let mut metadata = match req.metadata {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    metadata.insert(
        "originalTransactionId".into(),
        Value::from(original.id.to_string()),
    );
    metadata.insert(
        "originalCorrelationId".into(),
        Value::from(original.correlation_id.to_string()),
    );
    req.metadata = Value::Object(metadata);

    let outcome = post(core, ctx, &req).await?;

    // track the cumulative reversal on the original
    let mut original_meta = match original.metadata.clone() {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    original_meta.insert(
        "refundedAmount".into(),
        Value::from(already_refunded + amount),
    );
    let now = ctx.now;
    ctx.storage()
        .update(
            Table::TransactionRecord,
            &Filter::new().eq("id", original.id.to_string()),
            [
                ("metadata".to_string(), Value::Object(original_meta)),
                ("updatedAt".to_string(), Value::from(now)),
            ]
            .into_iter()
            .collect(),
        )
        .await?;
    Ok(outcome)
}

// ===== shared pieces =====

pub(crate) fn validate_amount(core: &Core, amount: u64) -> Result<(), LedgerError> {
    if amount == 0 {
        return Err(LedgerError::InvalidArgument(
            "amount must be a positive integer of minor units".into(),
        ));
    }
    if amount > core.config.advanced.max_transaction_amount {
        return Err(LedgerError::InvalidArgument(format!(
            "amount {amount} exceeds the maximum of {}",
            core.config.advanced.max_transaction_amount
        )));
    }
    Ok(())
}

pub(crate) fn validate_reference(reference: &str) -> Result<(), LedgerError> {
    if reference.is_empty() || reference.len() > 255 {
        return Err(LedgerError::InvalidArgument(
            "reference must be between 1 and 255 characters".into(),
        ));
    }
    Ok(())
}

fn validate_posting(core: &Core, amount: u64, reference: &str) -> Result<(), LedgerError> {
    validate_amount(core, amount)?;
    validate_reference(reference)
}

fn check_currency(party: &ResolvedParty, currency: &str) -> Result<(), LedgerError> {
    if let ResolvedParty::User(account) = party {
        if account.currency != currency {
            return Err(LedgerError::InvalidArgument(format!(
                "account {} is denominated in {}, not {currency}",
                account.holder_id, account.currency
            )));
        }
    }
    Ok(())
}

async fn resolve_required(
    core: &Core,
    ctx: &mut TxContext,
    party: Option<&PartyRef>,
    role: &'static str,
) -> Result<ResolvedParty, LedgerError> {
    match party {
        Some(party) => resolve_party(core, ctx, party).await,
        None => Err(LedgerError::Internal(format!("posting without a {role}"))),
    }
}

pub(crate) async fn resolve_party(
    core: &Core,
    ctx: &mut TxContext,
    party: &PartyRef,
) -> Result<ResolvedParty, LedgerError> {
    match party {
        PartyRef::Holder(holder) => {
            let row = ctx
                .storage()
                .find_one(
                    Table::Account,
                    &Filter::new()
                        .eq("ledgerId", core.config.ledger.as_str())
                        .eq("holderId", holder.as_str()),
                    RowLock::None,
                )
                .await?;
            match row {
                Some(row) => Ok(ResolvedParty::User(Box::new(read_account(core, row)?))),
                None => Err(LedgerError::NotFound {
                    entity: "account",
                    id: holder.clone(),
                }),
            }
        }
        PartyRef::System(identifier) => {
            let row = ctx
                .storage()
                .find_one(
                    Table::SystemAccount,
                    &Filter::new()
                        .eq("ledgerId", core.config.ledger.as_str())
                        .eq("identifier", identifier.as_str()),
                    RowLock::None,
                )
                .await?;
            match row {
                Some(row) => Ok(ResolvedParty::System(Box::new(from_row(row)?))),
                None => Err(LedgerError::NotFound {
                    entity: "system account",
                    id: identifier.clone(),
                }),
            }
        }
        PartyRef::AccountId(id) => {
            let row = ctx
                .storage()
                .find_one(
                    Table::Account,
                    &Filter::new()
                        .eq("ledgerId", core.config.ledger.as_str())
                        .eq("id", id.to_string()),
                    RowLock::None,
                )
                .await?;
            if let Some(row) = row {
                return Ok(ResolvedParty::User(Box::new(read_account(core, row)?)));
            }
            let row = ctx
                .storage()
                .find_one(
                    Table::SystemAccount,
                    &Filter::new()
                        .eq("ledgerId", core.config.ledger.as_str())
                        .eq("id", id.to_string()),
                    RowLock::None,
                )
                .await?;
            match row {
                Some(row) => Ok(ResolvedParty::System(Box::new(from_row(row)?))),
                None => Err(LedgerError::NotFound {
                    entity: "account",
                    id: id.to_string(),
                }),
            }
        }
    }
}

/// Deserialize an account row, verifying its balance checksum when enabled.
pub(crate) fn read_account(core: &Core, row: Row) -> Result<Account, LedgerError> {
    let account: Account = from_row(row)?;
    if core.config.advanced.verify_hash_on_read {
        let expected = core.hasher.balance_checksum(
            account.balance,
            account.credit_balance,
            account.debit_balance,
            account.pending_debit,
            account.pending_credit,
            account.version,
        );
        if expected != account.checksum {
            return Err(LedgerError::ChainIntegrityViolation {
                aggregate_type: "account".into(),
                aggregate_id: account.id.to_string(),
                broken_at_version: account.version,
            });
        }
    }
    Ok(account)
}

fn transaction_record(
    core: &Core,
    req: &PostingRequest,
    legs: &[Leg],
    correlation_id: Uuid,
    now: TimestampMillis,
) -> TransactionRecord {
    // journal postings have no single reversible account pair
    let (source_account_id, destination_account_id) = if req.txn_type == TransactionType::Journal {
        (None, None)
    } else {
        (
            legs.iter()
                .find(|l| l.side == EntrySide::Debit)
                .map(|l| l.party.account_id()),
            legs.iter()
                .find(|l| l.side == EntrySide::Credit)
                .map(|l| l.party.account_id()),
        )
    };
    let destination_currency = legs
        .iter()
        .find(|l| l.currency != req.currency)
        .map(|l| l.currency.clone());
    TransactionRecord {
        id: Uuid::new_v4(),
        ledger_id: core.config.ledger.clone(),
        transaction_type: req.txn_type,
        reference: req.reference.clone(),
        amount: req.amount,
        currency: req.currency.clone(),
        description: req.description.clone(),
        source_account_id,
        destination_account_id,
        correlation_id,
        metadata: req.metadata.clone(),
        status: TransactionStatus::Posted,
        is_hold: false,
        hold_expires_at: None,
        hold_destinations: None,
        fx_rate_micros: req.fx_rate_micros,
        destination_currency,
        created_at: now,
        updated_at: now,
        posted_at: Some(now),
    }
}

async fn insert_transaction(
    core: &Core,
    ctx: &mut TxContext,
    req: &PostingRequest,
    legs: &[Leg],
) -> Result<TransactionRecord, LedgerError> {
    let record = transaction_record(core, req, legs, ctx.correlation_id, ctx.now);
    let stored = ctx
        .storage()
        .insert(Table::TransactionRecord, to_row(&record)?)
        .await?;
    from_row(stored)
}

fn event_payload(
    req: &PostingRequest,
    transaction: &TransactionRecord,
    destination_amount: Option<u64>,
) -> Value {
    let mut payload = json!({
        "transactionId": transaction.id.to_string(),
        "transactionType": transaction.transaction_type,
        "reference": req.reference,
        "amount": req.amount,
        "currency": req.currency,
    });
    if let Some(dest_amount) = destination_amount {
        payload["destinationAmount"] = Value::from(dest_amount);
    }
    if let Some(original) = req.original_transaction_id {
        payload["originalTransactionId"] = Value::from(original.to_string());
    }
    payload
}

async fn write_velocity(
    core: &Core,
    ctx: &mut TxContext,
    account_id: Uuid,
    transaction_id: Uuid,
    side: EntrySide,
    amount: u64,
) -> Result<(), LedgerError> {
    let row: Row = [
        ("id".to_string(), Value::from(Uuid::new_v4().to_string())),
        ("ledgerId".to_string(), Value::from(core.config.ledger.clone())),
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

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdempotencyRecord {
    id: Uuid,
    ledger_id: String,
    key: String,
    reference: String,
    response: Value,
    expires_at: TimestampMillis,
    created_at: TimestampMillis,
}

/// Stored result for a `(ledger, key)` pair, if present, unexpired, and
/// recorded under the same reference. A key reused with a different
/// reference is a conflict, not a replay.
pub(crate) async fn load_idempotent(
    core: &Core,
    ctx: &mut TxContext,
    key: &str,
    reference: &str,
) -> Result<Option<Value>, LedgerError> {
    let row = ctx
        .storage()
        .find_one(
            Table::IdempotencyKey,
            &Filter::new()
                .eq("ledgerId", core.config.ledger.as_str())
                .eq("key", key),
            RowLock::None,
        )
        .await?;
    let record: IdempotencyRecord = match row {
        Some(row) => from_row(row)?,
        None => return Ok(None),
    };
    if record.expires_at <= ctx.now {
        return Ok(None);
    }
    if record.reference != reference {
        return Err(LedgerError::Conflict(format!(
            "idempotency key {key} was used with reference {}",
            record.reference
        )));
    }
    trace!("idempotent replay of {reference}");
    Ok(Some(record.response))
}

pub(crate) async fn save_idempotent(
    core: &Core,
    ctx: &mut TxContext,
    key: &str,
    reference: &str,
    response: Value,
) -> Result<(), LedgerError> {
    let filter = Filter::new()
        .eq("ledgerId", core.config.ledger.as_str())
        .eq("key", key);
    let existing = ctx
        .storage()
        .find_one(Table::IdempotencyKey, &filter, RowLock::None)
        .await?;
    if existing.is_some() {
        // expired key being reused: overwrite in place
        let expires_at = ctx.now + core.config.advanced.idempotency_ttl_ms;
        ctx.storage()
            .update(
                Table::IdempotencyKey,
                &filter,
                [
                    ("reference".to_string(), Value::from(reference)),
                    ("response".to_string(), response),
                    ("expiresAt".to_string(), Value::from(expires_at)),
                ]
                .into_iter()
                .collect(),
            )
            .await?;
        return Ok(());
    }
    let record = IdempotencyRecord {
        id: Uuid::new_v4(),
        ledger_id: core.config.ledger.clone(),
        key: key.to_string(),
        reference: reference.to_string(),
        response,
        expires_at: ctx.now + core.config.advanced.idempotency_ttl_ms,
        created_at: ctx.now,
    };
    ctx.storage()
        .insert(Table::IdempotencyKey, to_row(&record)?)
        .await?;
    Ok(())
}

pub(crate) async fn check_idempotency(
    core: &Core,
    ctx: &mut TxContext,
    req: &PostingRequest,
) -> Result<Option<TransactionOutcome>, LedgerError> {
    let key = match &req.idempotency_key {
        Some(key) => key,
        None => return Ok(None),
    };
    match load_idempotent(core, ctx, key, &req.reference).await? {
        Some(response) => {
            let outcome = serde_json::from_value(response)
                .map_err(|e| LedgerError::Internal(format!("stored idempotency response: {e}")))?;
            Ok(Some(outcome))
        }
        None => Ok(None),
    }
}

async fn store_idempotency(
    core: &Core,
    ctx: &mut TxContext,
    req: &PostingRequest,
    outcome: &TransactionOutcome,
) -> Result<(), LedgerError> {
    let key = match &req.idempotency_key {
        Some(key) => key,
        None => return Ok(()),
    };
    let response = serde_json::to_value(outcome)
        .map_err(|e| LedgerError::Internal(format!("idempotency response: {e}")))?;
    save_idempotent(core, ctx, key, &req.reference, response).await
}

pub(crate) async fn load_system_by_id(
    core: &Core,
    ctx: &mut TxContext,
    id: Uuid,
    lock: RowLock,
) -> Result<summa_common::account::SystemAccount, LedgerError> {
    let row = ctx
        .storage()
        .find_one(
            Table::SystemAccount,
            &Filter::new()
                .eq("ledgerId", core.config.ledger.as_str())
                .eq("id", id.to_string()),
            lock,
        )
        .await?;
    match row {
        Some(row) => from_row(row),
        None => Err(LedgerError::NotFound {
            entity: "system account",
            id: id.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn party_ref_parse_routes_on_the_at_prefix() {
        assert_eq!(PartyRef::parse("@World"), PartyRef::System("@World".into()));
        assert_eq!(PartyRef::parse("alice"), PartyRef::Holder("alice".into()));
    }

    #[test]
    fn storage_conflicts_map_to_domain_errors() {
        let duplicate: Result<(), _> = Err(LedgerError::Storage(StorageError::UniqueViolation {
            index: IDX_TXN_REFERENCE.into(),
        }));
        match map_storage_conflicts(duplicate, "r-1").unwrap_err() {
            LedgerError::Duplicate { reference } => assert_eq!(reference, "r-1"),
            other => panic!("expected duplicate, got {other}"),
        }

        let version: Result<(), _> = Err(LedgerError::Storage(StorageError::UniqueViolation {
            index: IDX_ENTRY_ACCOUNT_VERSION.into(),
        }));
        assert_eq!(
            map_storage_conflicts(version, "r-1").unwrap_err().code(),
            "OPTIMISTIC_LOCK_CONFLICT"
        );

        let passthrough: Result<(), _> = Err(LedgerError::InvalidArgument("x".into()));
        assert_eq!(
            map_storage_conflicts(passthrough, "r-1").unwrap_err().code(),
            "INVALID_ARGUMENT"
        );
    }
}
