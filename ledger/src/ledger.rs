//! The embedding surface.
//!
//! `Ledger` wires configuration, the storage adapter, the runner, the event
//! store, the mutator, and the plugin registry together, bootstraps system
//! accounts, and exposes the operation API. It is cheap to clone; all state
//! lives behind one `Arc`.

use std::sync::Arc;

use log::info;
use summa_common::account::{Account, SystemAccount};
use summa_common::crypto::ChainHasher;
use summa_common::error::LedgerError;
use summa_common::event::{AggregateType, LedgerEvent};
use uuid::Uuid;

use crate::accounts::{self, BalanceView, CreateAccountArgs};
use crate::config::LedgerConfig;
use crate::event_store::EventStore;
use crate::hold::{self, HoldOutcome};
use crate::mutator::BalanceMutator;
use crate::orchestrator::{self, JournalLeg, OperationOptions, TransactionOutcome};
use crate::outbox::OutboxEntry;
use crate::plugin::PluginRegistry;
use crate::runner::{RunOptions, TransactionRunner, TxContext};
use crate::storage::StorageAdapter;
use crate::verifier::{self, ChainReport};
use crate::workers::{self, WorkerSet};

/// Shared engine state. Modules take `&Core`; the facade owns the `Arc`.
pub(crate) struct Core {
    pub config: LedgerConfig,
    pub adapter: Arc<dyn StorageAdapter>,
    pub runner: TransactionRunner,
    pub events: EventStore,
    pub mutator: BalanceMutator,
    pub plugins: PluginRegistry,
    pub hasher: ChainHasher,
}

#[derive(Clone)]
pub struct Ledger {
    core: Arc<Core>,
}

impl Ledger {
    /// Validate the configuration, initialize plugins, and bootstrap system
    /// accounts.
    pub async fn new(
        adapter: Arc<dyn StorageAdapter>,
        config: LedgerConfig,
    ) -> Result<Self, LedgerError> {
        config.validate()?;
        let hasher = ChainHasher::new(config.advanced.hmac_secret.as_deref());
        let plugins = PluginRegistry::new(config.plugins.clone())?;
        let runner = TransactionRunner::new(adapter.clone(), config.advanced.clone());
        let events = EventStore::new(
            config.ledger.clone(),
            hasher.clone(),
            config.advanced.verify_hash_on_read,
        );
        let mutator = BalanceMutator::new(
            config.ledger.clone(),
            hasher.clone(),
            config.advanced.lock_mode,
        );
        let core = Arc::new(Core {
            config,
            adapter,
            runner,
            events,
            mutator,
            plugins,
            hasher,
        });

        core.plugins.init_all().await?;
        accounts::ensure_system_accounts(&core).await?;
        info!(
            "ledger {} ready ({} mode)",
            core.config.ledger,
            if core.config.advanced.lock_mode.is_pessimistic() {
                "pessimistic"
            } else {
                "optimistic"
            }
        );
        Ok(Self { core })
    }

    pub(crate) fn core(&self) -> &Core {
        &self.core
    }

    // ===== transactions =====

    /// Credit a user account from the world account.
    pub async fn credit(
        &self,
        holder: &str,
        amount: u64,
        reference: &str,
        opts: OperationOptions,
    ) -> Result<TransactionOutcome, LedgerError> {
        orchestrator::credit(&self.core, holder, amount, reference, &opts).await
    }

    /// Debit a user account into the world account.
    pub async fn debit(
        &self,
        holder: &str,
        amount: u64,
        reference: &str,
        opts: OperationOptions,
    ) -> Result<TransactionOutcome, LedgerError> {
        orchestrator::debit(&self.core, holder, amount, reference, &opts).await
    }

    /// Move funds between accounts. `destination` is a holder id or a
    /// `@`-prefixed system identifier; cross-currency transfers pass the
    /// micro-scaled rate in the options.
    pub async fn transfer(
        &self,
        source: &str,
        destination: &str,
        amount: u64,
        reference: &str,
        opts: OperationOptions,
    ) -> Result<TransactionOutcome, LedgerError> {
        orchestrator::transfer(&self.core, source, destination, amount, reference, &opts).await
    }

    /// One debit split over several destinations.
    pub async fn multi_transfer(
        &self,
        source: &str,
        destinations: &[(String, u64)],
        reference: &str,
        opts: OperationOptions,
    ) -> Result<TransactionOutcome, LedgerError> {
        orchestrator::multi_transfer(&self.core, source, destinations, reference, &opts).await
    }

    /// Reverse part or all of a posted transaction.
    pub async fn refund(
        &self,
        original_reference: &str,
        amount: u64,
        reference: &str,
        opts: OperationOptions,
    ) -> Result<TransactionOutcome, LedgerError> {
        orchestrator::refund(&self.core, original_reference, amount, reference, &opts).await
    }

    /// Fully reverse a posted transaction.
    pub async fn correct(
        &self,
        original_reference: &str,
        reference: &str,
        opts: OperationOptions,
    ) -> Result<TransactionOutcome, LedgerError> {
        orchestrator::correct(&self.core, original_reference, reference, &opts).await
    }

    /// Signed balance adjustment against the system adjustment account.
    pub async fn adjust(
        &self,
        holder: &str,
        delta: i64,
        reference: &str,
        opts: OperationOptions,
    ) -> Result<TransactionOutcome, LedgerError> {
        orchestrator::adjust(&self.core, holder, delta, reference, &opts).await
    }

    /// Raw N-leg posting; credits and debits must balance.
    pub async fn journal(
        &self,
        legs: &[JournalLeg],
        reference: &str,
        opts: OperationOptions,
    ) -> Result<TransactionOutcome, LedgerError> {
        orchestrator::journal(&self.core, legs, reference, &opts).await
    }

    // ===== holds =====

    pub async fn create_hold(
        &self,
        source: &str,
        amount: u64,
        reference: &str,
        expires_in_minutes: u64,
        destinations: &[(String, u64)],
        opts: OperationOptions,
    ) -> Result<HoldOutcome, LedgerError> {
        hold::create(
            &self.core,
            source,
            amount,
            reference,
            expires_in_minutes,
            destinations,
            &opts,
        )
        .await
    }

    /// Commit a hold; omit the amount for a full commit.
    pub async fn commit_hold(
        &self,
        reference: &str,
        committed_amount: Option<u64>,
        opts: OperationOptions,
    ) -> Result<HoldOutcome, LedgerError> {
        hold::commit(&self.core, reference, committed_amount, &opts).await
    }

    pub async fn void_hold(
        &self,
        reference: &str,
        opts: OperationOptions,
    ) -> Result<HoldOutcome, LedgerError> {
        hold::void(&self.core, reference, &opts).await
    }

    /// Release every expired inflight hold. Returns the number released.
    pub async fn expire_holds(&self) -> Result<u64, LedgerError> {
        hold::expire_all(&self.core, workers::DEFAULT_EXPIRY_BATCH).await
    }

    // ===== accounts =====

    pub async fn create_account(&self, args: CreateAccountArgs) -> Result<Account, LedgerError> {
        accounts::create(&self.core, &args).await
    }

    pub async fn freeze_account(
        &self,
        holder: &str,
        reason: Option<String>,
    ) -> Result<Account, LedgerError> {
        accounts::freeze(&self.core, holder, reason).await
    }

    pub async fn unfreeze_account(&self, holder: &str) -> Result<Account, LedgerError> {
        accounts::unfreeze(&self.core, holder).await
    }

    /// Close an account. Requires a zero balance and no open holds.
    pub async fn close_account(&self, holder: &str) -> Result<Account, LedgerError> {
        accounts::close(&self.core, holder).await
    }

    pub async fn get_account(&self, holder: &str) -> Result<Account, LedgerError> {
        accounts::get(&self.core, holder).await
    }

    pub async fn get_balance(&self, holder: &str) -> Result<BalanceView, LedgerError> {
        accounts::balance(&self.core, holder).await
    }

    pub async fn get_system_account(&self, name: &str) -> Result<SystemAccount, LedgerError> {
        accounts::get_system(&self.core, name).await
    }

    pub async fn list_system_accounts(&self) -> Result<Vec<SystemAccount>, LedgerError> {
        accounts::list_system(&self.core).await
    }

    /// Switch a system account between hot (batched) and cold (inline)
    /// balance materialization.
    pub async fn set_system_account_hot(&self, name: &str, hot: bool) -> Result<(), LedgerError> {
        accounts::set_system_hot(&self.core, name, hot).await
    }

    /// Run one hot-account flush pass inline (the background worker does
    /// this on an interval).
    pub async fn flush_hot_accounts(&self) -> Result<u64, LedgerError> {
        workers::hot_flush_tick(&self.core).await
    }

    // ===== events & verification =====

    pub async fn events_for_aggregate(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: Uuid,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        let core = &self.core;
        core.runner
            .run(RunOptions::default(), |ctx: &mut TxContext| {
                Box::pin(async move {
                    core.events
                        .events_for_aggregate(ctx, aggregate_type, aggregate_id)
                        .await
                })
            })
            .await
    }

    pub async fn events_for_correlation(
        &self,
        correlation_id: Uuid,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        let core = &self.core;
        core.runner
            .run(RunOptions::default(), |ctx: &mut TxContext| {
                Box::pin(async move {
                    core.events.events_for_correlation(ctx, correlation_id).await
                })
            })
            .await
    }

    /// Replay an aggregate's full hash chain.
    pub async fn verify_chain(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: Uuid,
    ) -> Result<ChainReport, LedgerError> {
        verifier::verify_chain(&self.core, aggregate_type, aggregate_id).await
    }

    /// Verify only past the persisted snapshot.
    pub async fn verify_chain_from_snapshot(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: Uuid,
    ) -> Result<ChainReport, LedgerError> {
        verifier::verify_from_snapshot(&self.core, aggregate_type, aggregate_id).await
    }

    /// Verify and persist a chain snapshot for an aggregate.
    pub async fn snapshot_chain(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: Uuid,
    ) -> Result<ChainReport, LedgerError> {
        verifier::snapshot(&self.core, aggregate_type, aggregate_id).await
    }

    /// Append a checkpoint over the global event sequence. `None` when no
    /// new events exist.
    pub async fn checkpoint(&self) -> Result<Option<ChainReport>, LedgerError> {
        verifier::checkpoint(&self.core).await
    }

    pub async fn verify_checkpoints(&self) -> Result<ChainReport, LedgerError> {
        verifier::verify_checkpoints(&self.core).await
    }

    // ===== outbox =====

    /// Oldest unprocessed outbox rows, for the draining consumer.
    pub async fn fetch_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, LedgerError> {
        let core = &self.core;
        core.runner
            .run(RunOptions::default(), |ctx: &mut TxContext| {
                Box::pin(async move {
                    crate::outbox::fetch_unprocessed(ctx, &core.config.ledger, limit).await
                })
            })
            .await
    }

    pub async fn mark_outbox_processed(&self, ids: &[Uuid]) -> Result<u64, LedgerError> {
        let core = &self.core;
        core.runner
            .run(RunOptions::default(), |ctx: &mut TxContext| {
                Box::pin(async move {
                    crate::outbox::mark_processed(ctx, &core.config.ledger, ids).await
                })
            })
            .await
    }

    // ===== workers =====

    /// Spawn the background workers (hold expiry, hot flush, idempotency
    /// purge, plugin workers). The caller owns the returned set.
    pub fn start_workers(&self) -> WorkerSet {
        workers::start(self.clone())
    }
}
