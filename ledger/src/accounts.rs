//! Account lifecycle operations.
//!
//! Accounts are created, frozen, unfrozen, and closed; never deleted. Every
//! lifecycle change appends to the account's event stream. System accounts
//! are bootstrapped from configuration at ledger construction.

use log::{debug, info};
use serde::Serialize;
use serde_json::{json, Value};
use summa_common::account::{
    Account, AccountStatus, AccountType, HolderType, NormalBalance, SystemAccount,
};
use summa_common::error::LedgerError;
use summa_common::event::{AggregateType, EventType};
use uuid::Uuid;

use crate::ledger::Core;
use crate::orchestrator::{map_storage_conflicts, read_account};
use crate::outbox;
use crate::plugin::AccountIntent;
use crate::runner::{RunOptions, TxContext};
use crate::storage::{from_row, to_row, Filter, RowLock, Table, IDX_ACCOUNT_HOLDER};

pub const OUTBOX_TOPIC_ACCOUNT: &str = "account.lifecycle";

#[derive(Clone, Debug)]
pub struct CreateAccountArgs {
    pub holder_id: String,
    pub holder_type: HolderType,
    /// Defaults to the ledger currency.
    pub currency: Option<String>,
    pub overdraft_allowance: u64,
    pub account_type: Option<AccountType>,
    pub account_code: Option<String>,
    pub parent_account_id: Option<Uuid>,
    pub normal_balance: NormalBalance,
    pub metadata: Option<Value>,
}

impl CreateAccountArgs {
    pub fn new(holder_id: impl Into<String>) -> Self {
        Self {
            holder_id: holder_id.into(),
            holder_type: HolderType::Individual,
            currency: None,
            overdraft_allowance: 0,
            account_type: None,
            account_code: None,
            parent_account_id: None,
            normal_balance: NormalBalance::Credit,
            metadata: None,
        }
    }
}

/// A read-only balance view; `available` is derived, never stored.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
    pub balance: i64,
    pub available: i64,
    pub pending_debit: i64,
    pub pending_credit: i64,
    pub version: u64,
}

pub(crate) async fn create(core: &Core, args: &CreateAccountArgs) -> Result<Account, LedgerError> {
    if args.holder_id.is_empty() {
        return Err(LedgerError::InvalidArgument("holder id is empty".into()));
    }
    let result = core
        .runner
        .run(RunOptions::default(), |ctx| Box::pin(create_body(core, ctx, args)))
        .await;
    match result {
        Err(LedgerError::Storage(summa_common::error::StorageError::UniqueViolation {
            index,
        })) if index == IDX_ACCOUNT_HOLDER => Err(LedgerError::Duplicate {
            reference: args.holder_id.clone(),
        }),
        other => other,
    }
}

async fn create_body(
    core: &Core,
    ctx: &mut TxContext,
    args: &CreateAccountArgs,
) -> Result<Account, LedgerError> {
    let intent = AccountIntent {
        operation: "create",
        holder_id: args.holder_id.clone(),
    };
    core.plugins.before_account(&intent).await?;

    let existing = ctx
        .storage()
        .find_one(
            Table::Account,
            &Filter::new()
                .eq("ledgerId", core.config.ledger.as_str())
                .eq("holderId", args.holder_id.as_str()),
            RowLock::None,
        )
        .await?;
    if existing.is_some() {
        return Err(LedgerError::Duplicate {
            reference: args.holder_id.clone(),
        });
    }

    let currency = args
        .currency
        .clone()
        .unwrap_or_else(|| core.config.currency.clone());
    let checksum = core.hasher.balance_checksum(0, 0, 0, 0, 0, 1);
    let account = Account {
        id: Uuid::new_v4(),
        ledger_id: core.config.ledger.clone(),
        holder_id: args.holder_id.clone(),
        holder_type: args.holder_type.clone(),
        currency,
        status: AccountStatus::Active,
        balance: 0,
        credit_balance: 0,
        debit_balance: 0,
        pending_debit: 0,
        pending_credit: 0,
        version: 1,
        checksum,
        overdraft_allowance: args.overdraft_allowance,
        freeze_reason: None,
        frozen_at: None,
        closed_at: None,
        account_type: args.account_type,
        account_code: args.account_code.clone(),
        parent_account_id: args.parent_account_id,
        normal_balance: args.normal_balance,
        metadata: args.metadata.clone().unwrap_or(Value::Null),
        created_at: ctx.now,
        updated_at: ctx.now,
    };
    let stored = ctx.storage().insert(Table::Account, to_row(&account)?).await?;
    let account: Account = from_row(stored)?;

    let event = core
        .events
        .append(
            ctx,
            AggregateType::Account,
            account.id,
            EventType::AccountCreated,
            json!({
                "accountId": account.id.to_string(),
                "holderId": account.holder_id,
                "holderType": account.holder_type,
                "currency": account.currency,
            }),
        )
        .await?;
    outbox::write(
        ctx,
        &core.config.ledger,
        OUTBOX_TOPIC_ACCOUNT,
        serde_json::to_value(&event)
            .map_err(|e| LedgerError::Internal(format!("outbox payload: {e}")))?,
    )
    .await?;

    core.plugins.queue_after_account(ctx, &intent);
    info!("created account {} for holder {}", account.id, account.holder_id);
    Ok(account)
}

pub(crate) async fn freeze(
    core: &Core,
    holder: &str,
    reason: Option<String>,
) -> Result<Account, LedgerError> {
    transition(core, holder, "freeze", reason).await
}

pub(crate) async fn unfreeze(core: &Core, holder: &str) -> Result<Account, LedgerError> {
    transition(core, holder, "unfreeze", None).await
}

pub(crate) async fn close(core: &Core, holder: &str) -> Result<Account, LedgerError> {
    transition(core, holder, "close", None).await
}

async fn transition(
    core: &Core,
    holder: &str,
    operation: &'static str,
    reason: Option<String>,
) -> Result<Account, LedgerError> {
    let result = core
        .runner
        .run(RunOptions::default(), |ctx| {
            Box::pin(transition_body(core, ctx, holder, operation, reason.clone()))
        })
        .await;
    map_storage_conflicts(result, holder)
}

async fn transition_body(
    core: &Core,
    ctx: &mut TxContext,
    holder: &str,
    operation: &'static str,
    reason: Option<String>,
) -> Result<Account, LedgerError> {
    let intent = AccountIntent {
        operation,
        holder_id: holder.to_string(),
    };
    core.plugins.before_account(&intent).await?;

    let row = ctx
        .storage()
        .find_one(
            Table::Account,
            &Filter::new()
                .eq("ledgerId", core.config.ledger.as_str())
                .eq("holderId", holder),
            RowLock::ForUpdate,
        )
        .await?;
    let mut account: Account = match row {
        Some(row) => read_account(core, row)?,
        None => {
            return Err(LedgerError::NotFound {
                entity: "account",
                id: holder.to_string(),
            })
        }
    };

    let event_type = match operation {
        "freeze" => {
            if account.status != AccountStatus::Active {
                return Err(LedgerError::Conflict(format!(
                    "account {holder} is {}, only active accounts freeze",
                    account.status
                )));
            }
            account.status = AccountStatus::Frozen;
            account.freeze_reason = reason.clone();
            account.frozen_at = Some(ctx.now);
            EventType::AccountFrozen
        }
        "unfreeze" => {
            if account.status != AccountStatus::Frozen {
                return Err(LedgerError::Conflict(format!(
                    "account {holder} is {}, not frozen",
                    account.status
                )));
            }
            account.status = AccountStatus::Active;
            account.freeze_reason = None;
            account.frozen_at = None;
            EventType::AccountUnfrozen
        }
        "close" => {
            if account.status == AccountStatus::Closed {
                return Err(LedgerError::AccountClosed {
                    account_id: account.id.to_string(),
                });
            }
            if account.balance != 0 || account.pending_debit != 0 || account.pending_credit != 0 {
                return Err(LedgerError::Conflict(format!(
                    "account {holder} still carries a balance or open holds"
                )));
            }
            account.status = AccountStatus::Closed;
            account.closed_at = Some(ctx.now);
            EventType::AccountClosed
        }
        _ => return Err(LedgerError::Internal(format!("unknown transition {operation}"))),
    };

    let changes: crate::storage::Row = [
        (
            "status".to_string(),
            serde_json::to_value(account.status).unwrap_or(Value::Null),
        ),
        (
            "freezeReason".to_string(),
            account
                .freeze_reason
                .clone()
                .map(Value::from)
                .unwrap_or(Value::Null),
        ),
        (
            "frozenAt".to_string(),
            account.frozen_at.map(Value::from).unwrap_or(Value::Null),
        ),
        (
            "closedAt".to_string(),
            account.closed_at.map(Value::from).unwrap_or(Value::Null),
        ),
        ("updatedAt".to_string(), Value::from(ctx.now)),
    ]
    .into_iter()
    .collect();
    let affected = ctx
        .storage()
        .update(
            Table::Account,
            &Filter::new()
                .eq("id", account.id.to_string())
                .eq("version", account.version),
            changes,
        )
        .await?;
    if affected == 0 {
        return Err(LedgerError::OptimisticLockConflict {
            entity: "account",
            id: account.id.to_string(),
        });
    }

    let event = core
        .events
        .append(
            ctx,
            AggregateType::Account,
            account.id,
            event_type,
            json!({
                "accountId": account.id.to_string(),
                "holderId": holder,
                "reason": reason,
            }),
        )
        .await?;
    outbox::write(
        ctx,
        &core.config.ledger,
        OUTBOX_TOPIC_ACCOUNT,
        serde_json::to_value(&event)
            .map_err(|e| LedgerError::Internal(format!("outbox payload: {e}")))?,
    )
    .await?;

    core.plugins.queue_after_account(ctx, &intent);
    debug!("account {holder}: {operation}");
    Ok(account)
}

pub(crate) async fn get(core: &Core, holder: &str) -> Result<Account, LedgerError> {
    core.runner
        .run(RunOptions::default(), |ctx| {
            Box::pin(get_body(core, ctx, holder))
        })
        .await
}

async fn get_body(core: &Core, ctx: &mut TxContext, holder: &str) -> Result<Account, LedgerError> {
    let row = ctx
        .storage()
        .find_one(
            Table::Account,
            &Filter::new()
                .eq("ledgerId", core.config.ledger.as_str())
                .eq("holderId", holder),
            RowLock::None,
        )
        .await?;
    match row {
        Some(row) => read_account(core, row),
        None => Err(LedgerError::NotFound {
            entity: "account",
            id: holder.to_string(),
        }),
    }
}

pub(crate) async fn balance(core: &Core, holder: &str) -> Result<BalanceView, LedgerError> {
    let account = get(core, holder).await?;
    Ok(BalanceView {
        balance: account.balance,
        available: account.available_balance(),
        pending_debit: account.pending_debit,
        pending_credit: account.pending_credit,
        version: account.version,
    })
}

/// Create any configured system accounts that do not exist yet.
pub(crate) async fn ensure_system_accounts(core: &Core) -> Result<(), LedgerError> {
    core.runner
        .run(RunOptions::default(), |ctx| {
            Box::pin(ensure_system_accounts_body(core, ctx))
        })
        .await
}

async fn ensure_system_accounts_body(
    core: &Core,
    ctx: &mut TxContext,
) -> Result<(), LedgerError> {
    for (name, identifier) in &core.config.system_accounts {
        let existing = ctx
            .storage()
            .find_one(
                Table::SystemAccount,
                &Filter::new()
                    .eq("ledgerId", core.config.ledger.as_str())
                    .eq("identifier", identifier.as_str()),
                RowLock::None,
            )
            .await?;
        if existing.is_some() {
            continue;
        }
        let system = SystemAccount {
            id: Uuid::new_v4(),
            ledger_id: core.config.ledger.clone(),
            identifier: identifier.clone(),
            currency: core.config.currency.clone(),
            balance: 0,
            credit_balance: 0,
            debit_balance: 0,
            version: 1,
            checksum: core.hasher.balance_checksum(0, 0, 0, 0, 0, 1),
            normal_balance: NormalBalance::Credit,
            hot: false,
            created_at: ctx.now,
            updated_at: ctx.now,
        };
        ctx.storage()
            .insert(Table::SystemAccount, to_row(&system)?)
            .await?;
        info!("bootstrapped system account {name} as {identifier}");
    }
    Ok(())
}

pub(crate) async fn get_system(core: &Core, name: &str) -> Result<SystemAccount, LedgerError> {
    let identifier = core.config.system_identifier(name)?.to_string();
    core.runner
        .run(RunOptions::default(), |ctx| {
            let identifier = identifier.clone();
            Box::pin(async move {
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
                    Some(row) => from_row(row),
                    None => Err(LedgerError::NotFound {
                        entity: "system account",
                        id: identifier,
                    }),
                }
            })
        })
        .await
}

/// Every system account of this ledger, for invariant checks and the hot
/// flush worker.
pub(crate) async fn list_system(core: &Core) -> Result<Vec<SystemAccount>, LedgerError> {
    core.runner
        .run(RunOptions::default(), |ctx| {
            Box::pin(async move {
                let rows = ctx
                    .storage()
                    .find_many(
                        Table::SystemAccount,
                        &crate::storage::Query {
                            filter: Filter::new().eq("ledgerId", core.config.ledger.as_str()),
                            sort: Some(crate::storage::Sort::asc("identifier")),
                            ..Default::default()
                        },
                    )
                    .await?;
                rows.into_iter().map(from_row).collect()
            })
        })
        .await
}

/// Mark a system account hot or cold. Hot accounts batch entries in the
/// hot-entry ledger instead of updating their balance inline.
pub(crate) async fn set_system_hot(
    core: &Core,
    name: &str,
    hot: bool,
) -> Result<(), LedgerError> {
    let identifier = core.config.system_identifier(name)?.to_string();
    core.runner
        .run(RunOptions::default(), |ctx| {
            let identifier = identifier.clone();
            Box::pin(async move {
                let affected = ctx
                    .storage()
                    .update(
                        Table::SystemAccount,
                        &Filter::new()
                            .eq("ledgerId", core.config.ledger.as_str())
                            .eq("identifier", identifier.as_str()),
                        [("hot".to_string(), Value::from(hot))].into_iter().collect(),
                    )
                    .await?;
                if affected == 0 {
                    return Err(LedgerError::NotFound {
                        entity: "system account",
                        id: identifier,
                    });
                }
                Ok(())
            })
        })
        .await
}
