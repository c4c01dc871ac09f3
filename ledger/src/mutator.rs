//! The single point where balances change.
//!
//! Every balance mutation reads the account (locked, optimistic, or from a
//! caller-supplied snapshot), enforces the status gates, recomputes the
//! checksum, extends the per-account entry hash chain, and writes the entry
//! plus the version-predicated account update. A zero-row update is the
//! optimistic-lock miss; the unique `(accountId, accountVersion)` entry
//! index is the backstop for concurrent inserts at the same version.

use log::trace;
use serde_json::json;
use summa_common::account::{Account, AccountStatus, NormalBalance, SystemAccount};
use summa_common::canonical::canonical_string;
use summa_common::crypto::ChainHasher;
use summa_common::error::LedgerError;
use summa_common::transaction::{Entry, EntrySide};
use uuid::Uuid;

use crate::config::LockMode;
use crate::runner::TxContext;
use crate::storage::{from_row, to_row, Filter, Query, Row, RowLock, Sort, Table};

/// One requested balance mutation.
#[derive(Clone, Debug)]
pub struct BalanceChange {
    pub transaction_id: Uuid,
    pub side: EntrySide,
    /// Entry amount. Zero means no entry: the mutation only moves pending
    /// funds (hold create/release).
    pub amount: u64,
    pub currency: String,
    /// Applied to `pending_debit`: positive reserves, negative releases.
    pub pending_debit_delta: i64,
    pub fx_rate_micros: Option<u64>,
    pub original_amount: Option<u64>,
    pub original_currency: Option<String>,
    /// Override the engine-default lock mode for this mutation.
    pub lock: Option<LockMode>,
}

impl BalanceChange {
    pub fn entry(transaction_id: Uuid, side: EntrySide, amount: u64, currency: &str) -> Self {
        Self {
            transaction_id,
            side,
            amount,
            currency: currency.to_string(),
            pending_debit_delta: 0,
            fx_rate_micros: None,
            original_amount: None,
            original_currency: None,
            lock: None,
        }
    }

    /// A pure reservation move: no entry, only pending funds.
    pub fn pending(transaction_id: Uuid, delta: i64, currency: &str) -> Self {
        Self {
            transaction_id,
            side: EntrySide::Debit,
            amount: 0,
            currency: currency.to_string(),
            pending_debit_delta: delta,
            fx_rate_micros: None,
            original_amount: None,
            original_currency: None,
            lock: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MutationOutcome {
    pub account_id: Uuid,
    pub balance_before: i64,
    pub balance_after: i64,
    pub new_version: u64,
    pub entry: Option<Entry>,
}

/// The computed result of one posting, shared between the logical write
/// path and the single-statement CTE builder.
#[derive(Clone, Debug)]
pub struct PostingValues {
    pub balance_before: i64,
    pub balance_after: i64,
    pub credit_balance: i64,
    pub debit_balance: i64,
    pub pending_debit: i64,
    pub pending_credit: i64,
    pub new_version: u64,
    pub checksum: String,
}

pub struct BalanceMutator {
    ledger_id: String,
    hasher: ChainHasher,
    default_lock: LockMode,
}

impl BalanceMutator {
    pub fn new(ledger_id: String, hasher: ChainHasher, default_lock: LockMode) -> Self {
        Self {
            ledger_id,
            hasher,
            default_lock,
        }
    }

    fn row_lock(&self, change: &BalanceChange) -> RowLock {
        match change.lock.unwrap_or(self.default_lock) {
            LockMode::Wait => RowLock::ForUpdate,
            LockMode::Nowait => RowLock::ForUpdateNoWait,
            LockMode::Optimistic => RowLock::None,
        }
    }

    /// Read a user account applying the given lock mode. Callers that lock
    /// multiple accounts do so in ascending id order.
    pub async fn load_user(
        &self,
        ctx: &mut TxContext,
        account_id: Uuid,
        lock: RowLock,
    ) -> Result<Account, LedgerError> {
        let row = ctx
            .storage()
            .find_one(
                Table::Account,
                &Filter::new()
                    .eq("ledgerId", self.ledger_id.as_str())
                    .eq("id", account_id.to_string()),
                lock,
            )
            .await?;
        match row {
            Some(row) => from_row(row),
            None => Err(LedgerError::NotFound {
                entity: "account",
                id: account_id.to_string(),
            }),
        }
    }

    /// Apply a mutation to a user account. `snapshot` skips the read when
    /// the caller already locked and fetched the row.
    pub async fn apply_user(
        &self,
        ctx: &mut TxContext,
        account_id: Uuid,
        change: &BalanceChange,
        snapshot: Option<Account>,
    ) -> Result<MutationOutcome, LedgerError> {
        let account = match snapshot {
            Some(account) => account,
            None => {
                self.load_user(ctx, account_id, self.row_lock(change))
                    .await?
            }
        };
        self.enforce_status(&account, change.side, change.amount, change.pending_debit_delta)?;
        let values = self.compute_values(
            &account,
            change.side,
            change.amount,
            change.pending_debit_delta,
        )?;

        let entry = if change.amount > 0 {
            Some(self.insert_entry(ctx, account_id, false, change, &values).await?)
        } else {
            None
        };

        let changes = changes_row(&[
            ("balance", json!(values.balance_after)),
            ("creditBalance", json!(values.credit_balance)),
            ("debitBalance", json!(values.debit_balance)),
            ("pendingDebit", json!(values.pending_debit)),
            ("version", json!(values.new_version)),
            ("checksum", json!(values.checksum)),
            ("updatedAt", json!(ctx.now)),
        ]);
        let affected = ctx
            .storage()
            .update(
                Table::Account,
                &Filter::new()
                    .eq("id", account_id.to_string())
                    .eq("version", account.version),
                changes,
            )
            .await?;
        if affected == 0 {
            trace!("version predicate missed on account {account_id}");
            return Err(LedgerError::OptimisticLockConflict {
                entity: "account",
                id: account_id.to_string(),
            });
        }

        Ok(MutationOutcome {
            account_id,
            balance_before: values.balance_before,
            balance_after: values.balance_after,
            new_version: values.new_version,
            entry,
        })
    }

    /// Pure posting arithmetic for a user account (status gate included).
    /// The CTE builder consumes this to mirror the logical path exactly.
    pub fn compute_user(
        &self,
        account: &Account,
        side: EntrySide,
        amount: u64,
    ) -> Result<PostingValues, LedgerError> {
        self.enforce_status(account, side, amount, 0)?;
        self.compute_values(account, side, amount, 0)
    }

    /// Pure posting arithmetic for a non-hot system account. System
    /// accounts carry no pending funds and may go arbitrarily negative.
    pub fn compute_system(
        &self,
        system: &SystemAccount,
        side: EntrySide,
        amount: u64,
    ) -> PostingValues {
        let debit_normal = system.normal_balance == NormalBalance::Debit;
        let balance_before = system.balance;
        let (mut credit_balance, mut debit_balance) = (system.credit_balance, system.debit_balance);
        let balance_after = match side {
            EntrySide::Credit => {
                credit_balance += amount as i64;
                if debit_normal {
                    balance_before - amount as i64
                } else {
                    balance_before + amount as i64
                }
            }
            EntrySide::Debit => {
                debit_balance += amount as i64;
                if debit_normal {
                    balance_before + amount as i64
                } else {
                    balance_before - amount as i64
                }
            }
        };
        let new_version = system.version + 1;
        let checksum = self.hasher.balance_checksum(
            balance_after,
            credit_balance,
            debit_balance,
            0,
            0,
            new_version,
        );
        PostingValues {
            balance_before,
            balance_after,
            credit_balance,
            debit_balance,
            pending_debit: 0,
            pending_credit: 0,
            new_version,
            checksum,
        }
    }

    fn compute_values(
        &self,
        account: &Account,
        side: EntrySide,
        amount: u64,
        pending_debit_delta: i64,
    ) -> Result<PostingValues, LedgerError> {
        // debit-normal accounts (assets, expenses) grow on the debit side:
        // balance = debit_balance - credit_balance, the signed inverse of
        // the credit-normal identity
        let debit_normal = account.normal_balance == NormalBalance::Debit;
        let balance_before = account.balance;
        let (mut credit_balance, mut debit_balance) =
            (account.credit_balance, account.debit_balance);
        let balance_after = match side {
            EntrySide::Credit => {
                credit_balance = credit_balance
                    .checked_add(amount as i64)
                    .ok_or_else(|| LedgerError::Internal("credit balance overflow".into()))?;
                if debit_normal {
                    balance_before - amount as i64
                } else {
                    balance_before + amount as i64
                }
            }
            EntrySide::Debit => {
                debit_balance = debit_balance
                    .checked_add(amount as i64)
                    .ok_or_else(|| LedgerError::Internal("debit balance overflow".into()))?;
                if debit_normal {
                    balance_before + amount as i64
                } else {
                    balance_before - amount as i64
                }
            }
        };
        let pending_debit = account.pending_debit + pending_debit_delta;
        if pending_debit < 0 {
            return Err(LedgerError::Internal(format!(
                "pending debit would go negative on account {}",
                account.id
            )));
        }

        // funds check covers balance-reducing entries and new reservations;
        // for debit-normal accounts the reducing side is the credit
        let reduces_balance = amount > 0 && (side == EntrySide::Debit) != debit_normal;
        if reduces_balance || pending_debit_delta > 0 {
            let available_after = balance_after - pending_debit + account.pending_credit;
            if available_after < account.floor() {
                let need = if amount > 0 {
                    amount
                } else {
                    pending_debit_delta as u64
                };
                return Err(LedgerError::InsufficientBalance {
                    account_id: account.id.to_string(),
                    need,
                    available: account.available_balance(),
                });
            }
        }

        let new_version = account.version + 1;
        let checksum = self.hasher.balance_checksum(
            balance_after,
            credit_balance,
            debit_balance,
            pending_debit,
            account.pending_credit,
            new_version,
        );
        Ok(PostingValues {
            balance_before,
            balance_after,
            credit_balance,
            debit_balance,
            pending_debit,
            pending_credit: account.pending_credit,
            new_version,
            checksum,
        })
    }

    /// Apply a mutation to a system account. Hot accounts defer balance
    /// materialization to the hot-entry ledger.
    pub async fn apply_system(
        &self,
        ctx: &mut TxContext,
        system: &SystemAccount,
        change: &BalanceChange,
    ) -> Result<MutationOutcome, LedgerError> {
        if system.hot {
            let row = changes_row(&[
                ("id", json!(Uuid::new_v4().to_string())),
                ("ledgerId", json!(self.ledger_id)),
                ("accountId", json!(system.id.to_string())),
                ("entrySide", json!(change.side)),
                ("amount", json!(change.amount)),
                ("currency", json!(change.currency)),
                ("transactionId", json!(change.transaction_id.to_string())),
                ("createdAt", json!(ctx.now)),
            ]);
            ctx.storage().insert(Table::HotAccountEntry, row).await?;
            return Ok(MutationOutcome {
                account_id: system.id,
                balance_before: system.balance,
                balance_after: system.balance,
                new_version: system.version,
                entry: None,
            });
        }

        let values = self.compute_system(system, change.side, change.amount);
        let entry = self.insert_entry(ctx, system.id, true, change, &values).await?;

        let changes = changes_row(&[
            ("balance", json!(values.balance_after)),
            ("creditBalance", json!(values.credit_balance)),
            ("debitBalance", json!(values.debit_balance)),
            ("version", json!(values.new_version)),
            ("checksum", json!(values.checksum)),
            ("updatedAt", json!(ctx.now)),
        ]);
        let affected = ctx
            .storage()
            .update(
                Table::SystemAccount,
                &Filter::new()
                    .eq("id", system.id.to_string())
                    .eq("version", system.version),
                changes,
            )
            .await?;
        if affected == 0 {
            return Err(LedgerError::OptimisticLockConflict {
                entity: "system account",
                id: system.identifier.clone(),
            });
        }

        Ok(MutationOutcome {
            account_id: system.id,
            balance_before: values.balance_before,
            balance_after: values.balance_after,
            new_version: values.new_version,
            entry: Some(entry),
        })
    }

    /// Aggregate pending hot entries of one system account into its
    /// balance. Returns the number of entries flushed.
    pub async fn flush_hot(
        &self,
        ctx: &mut TxContext,
        system: &SystemAccount,
        limit: usize,
    ) -> Result<u64, LedgerError> {
        let rows = ctx
            .storage()
            .find_many(
                Table::HotAccountEntry,
                &Query {
                    filter: Filter::new().eq("accountId", system.id.to_string()),
                    sort: Some(Sort::asc("createdAt")),
                    limit: Some(limit),
                    ..Default::default()
                },
            )
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let (mut credit, mut debit) = (0i64, 0i64);
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let amount = row
                .get("amount")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0) as i64;
            match row.get("entrySide").and_then(serde_json::Value::as_str) {
                Some("CREDIT") => credit += amount,
                _ => debit += amount,
            }
            if let Some(id) = row.get("id").and_then(serde_json::Value::as_str) {
                ids.push(id.to_string());
            }
        }

        let delta = if system.normal_balance == NormalBalance::Debit {
            debit - credit
        } else {
            credit - debit
        };
        let changes = changes_row(&[
            ("balance", json!(system.balance + delta)),
            ("creditBalance", json!(system.credit_balance + credit)),
            ("debitBalance", json!(system.debit_balance + debit)),
            ("version", json!(system.version + 1)),
            (
                "checksum",
                json!(self.hasher.balance_checksum(
                    system.balance + delta,
                    system.credit_balance + credit,
                    system.debit_balance + debit,
                    0,
                    0,
                    system.version + 1,
                )),
            ),
            ("updatedAt", json!(ctx.now)),
        ]);
        let affected = ctx
            .storage()
            .update(
                Table::SystemAccount,
                &Filter::new()
                    .eq("id", system.id.to_string())
                    .eq("version", system.version),
                changes,
            )
            .await?;
        if affected == 0 {
            return Err(LedgerError::OptimisticLockConflict {
                entity: "system account",
                id: system.identifier.clone(),
            });
        }

        for id in &ids {
            ctx.storage()
                .delete(Table::HotAccountEntry, &Filter::new().eq("id", id.as_str()))
                .await?;
        }
        Ok(ids.len() as u64)
    }

    fn enforce_status(
        &self,
        account: &Account,
        side: EntrySide,
        amount: u64,
        pending_debit_delta: i64,
    ) -> Result<(), LedgerError> {
        match account.status {
            AccountStatus::Active => Ok(()),
            AccountStatus::Closed => Err(LedgerError::AccountClosed {
                account_id: account.id.to_string(),
            }),
            AccountStatus::Frozen => {
                let debits = side == EntrySide::Debit && amount > 0;
                let reserves = pending_debit_delta > 0;
                if debits || reserves {
                    Err(LedgerError::AccountFrozen {
                        account_id: account.id.to_string(),
                        reason: account.freeze_reason.clone(),
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Construct the next entry of an account's chain without inserting it.
    /// The hash commits to the core accounting fields only.
    pub async fn build_entry(
        &self,
        ctx: &mut TxContext,
        account_id: Uuid,
        system_account: bool,
        transaction_id: Uuid,
        side: EntrySide,
        amount: u64,
        currency: &str,
        values: &PostingValues,
    ) -> Result<Entry, LedgerError> {
        let prev_hash = self.entry_tail_hash(ctx, account_id).await?;
        let payload = json!({
            "transactionId": transaction_id.to_string(),
            "accountId": account_id.to_string(),
            "entrySide": side,
            "amount": amount,
            "currency": currency,
            "balanceBefore": values.balance_before,
            "balanceAfter": values.balance_after,
            "accountVersion": values.new_version,
        });
        let hash = self
            .hasher
            .chain_hash(prev_hash.as_deref(), &canonical_string(&payload));

        Ok(Entry {
            id: Uuid::new_v4(),
            ledger_id: self.ledger_id.clone(),
            transaction_id,
            account_id,
            system_account,
            entry_side: side,
            amount,
            currency: currency.to_string(),
            balance_before: values.balance_before,
            balance_after: values.balance_after,
            account_version: values.new_version,
            hash,
            prev_hash,
            sequence_number: 0,
            fx_rate_micros: None,
            original_amount: None,
            original_currency: None,
            created_at: ctx.now,
        })
    }

    async fn insert_entry(
        &self,
        ctx: &mut TxContext,
        account_id: Uuid,
        system_account: bool,
        change: &BalanceChange,
        values: &PostingValues,
    ) -> Result<Entry, LedgerError> {
        let mut entry = self
            .build_entry(
                ctx,
                account_id,
                system_account,
                change.transaction_id,
                change.side,
                change.amount,
                &change.currency,
                values,
            )
            .await?;
        entry.fx_rate_micros = change.fx_rate_micros;
        entry.original_amount = change.original_amount;
        entry.original_currency = change.original_currency.clone();
        let stored = ctx.storage().insert(Table::Entry, to_row(&entry)?).await?;
        from_row(stored)
    }

    /// Hash of the account's latest entry, the tail of its chain.
    async fn entry_tail_hash(
        &self,
        ctx: &mut TxContext,
        account_id: Uuid,
    ) -> Result<Option<String>, LedgerError> {
        let rows = ctx
            .storage()
            .find_many(
                Table::Entry,
                &Query {
                    filter: Filter::new().eq("accountId", account_id.to_string()),
                    sort: Some(Sort::desc("accountVersion")),
                    limit: Some(1),
                    ..Default::default()
                },
            )
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.get("hash").and_then(serde_json::Value::as_str).map(String::from)))
    }
}

fn changes_row(pairs: &[(&str, serde_json::Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
