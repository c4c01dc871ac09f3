//! Background workers.
//!
//! Each worker is a tokio task ticking at a fixed interval. A tick first
//! takes its distributed lease (an advisory lock keyed by the worker id);
//! when another process holds the lease the tick is skipped and retried on
//! the next interval. The lease is held for the duration of the tick's
//! transaction and released at commit.

use std::time::Duration;

use log::{debug, warn};
use summa_common::crypto::advisory_key;
use summa_common::error::LedgerError;
use tokio::task::JoinHandle;

use crate::ledger::{Core, Ledger};
use crate::runner::RunOptions;
use crate::storage::{from_row, Filter, Query, Table, TxOptions};

pub const HOLD_EXPIRY_WORKER: &str = "hold-expiry";
pub const HOT_FLUSH_WORKER: &str = "hot-account-flush";
pub const IDEMPOTENCY_PURGE_WORKER: &str = "idempotency-purge";

// Expiry sweep batch size per tick
pub const DEFAULT_EXPIRY_BATCH: usize = 256;

pub const HOLD_EXPIRY_INTERVAL_MS: u64 = 60_000;
pub const HOT_FLUSH_INTERVAL_MS: u64 = 30_000;
pub const IDEMPOTENCY_PURGE_INTERVAL_MS: u64 = 3_600_000;

/// Handles of the spawned worker tasks. Aborting them is the shutdown path;
/// a tick in flight finishes its transaction or rolls back with it.
pub struct WorkerSet {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerSet {
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

pub(crate) fn start(ledger: Ledger) -> WorkerSet {
    let mut handles = Vec::new();

    {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(HOLD_EXPIRY_INTERVAL_MS));
            loop {
                interval.tick().await;
                if let Err(e) = hold_expiry_tick(ledger.core()).await {
                    warn!("{HOLD_EXPIRY_WORKER} tick failed: {e}");
                }
            }
        }));
    }

    {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(HOT_FLUSH_INTERVAL_MS));
            loop {
                interval.tick().await;
                if let Err(e) = hot_flush_tick(ledger.core()).await {
                    warn!("{HOT_FLUSH_WORKER} tick failed: {e}");
                }
            }
        }));
    }

    {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(IDEMPOTENCY_PURGE_INTERVAL_MS));
            loop {
                interval.tick().await;
                if let Err(e) = idempotency_purge_tick(ledger.core()).await {
                    warn!("{IDEMPOTENCY_PURGE_WORKER} tick failed: {e}");
                }
            }
        }));
    }

    // plugin-declared workers run under the same lease discipline
    for (plugin, spec) in ledger.core().plugins.workers() {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(spec.interval_ms));
            loop {
                interval.tick().await;
                let core = ledger.core();
                let result: Result<(), LedgerError> = async {
                    let mut tx = core
                        .adapter
                        .begin(TxOptions::default())
                        .await
                        .map_err(LedgerError::Storage)?;
                    if spec.lease && !tx.try_advisory_lock(advisory_key(&spec.id)).await? {
                        debug!("worker {} lease held elsewhere, skipping tick", spec.id);
                        tx.rollback().await.map_err(LedgerError::Storage)?;
                        return Ok(());
                    }
                    let run = plugin.run_worker(&spec.id).await;
                    match run {
                        Ok(()) => tx.commit().await.map_err(LedgerError::Storage),
                        Err(e) => {
                            tx.rollback().await.map_err(LedgerError::Storage)?;
                            Err(e)
                        }
                    }
                }
                .await;
                if let Err(e) = result {
                    warn!("plugin worker {} tick failed: {e}", spec.id);
                }
            }
        }));
    }

    WorkerSet { handles }
}

/// Sweep expired holds under the expiry lease.
pub(crate) async fn hold_expiry_tick(core: &Core) -> Result<u64, LedgerError> {
    core.runner
        .run(RunOptions::default(), |ctx| {
            Box::pin(async move {
                if !ctx
                    .storage()
                    .try_advisory_lock(advisory_key(HOLD_EXPIRY_WORKER))
                    .await?
                {
                    debug!("{HOLD_EXPIRY_WORKER} lease held elsewhere, skipping tick");
                    return Ok(0);
                }
                crate::hold::expire_body(core, ctx, DEFAULT_EXPIRY_BATCH).await
            })
        })
        .await
}

/// Materialize pending hot entries into their system account balances.
pub(crate) async fn hot_flush_tick(core: &Core) -> Result<u64, LedgerError> {
    core.runner
        .run(RunOptions::default(), |ctx| {
            Box::pin(async move {
                if !ctx
                    .storage()
                    .try_advisory_lock(advisory_key(HOT_FLUSH_WORKER))
                    .await?
                {
                    debug!("{HOT_FLUSH_WORKER} lease held elsewhere, skipping tick");
                    return Ok(0);
                }
                let rows = ctx
                    .storage()
                    .find_many(
                        Table::SystemAccount,
                        &Query {
                            filter: Filter::new()
                                .eq("ledgerId", core.config.ledger.as_str())
                                .eq("hot", true),
                            ..Default::default()
                        },
                    )
                    .await?;
                let mut flushed = 0;
                for row in rows {
                    let system: summa_common::account::SystemAccount = from_row(row)?;
                    flushed += core
                        .mutator
                        .flush_hot(ctx, &system, core.config.advanced.hot_account_threshold)
                        .await?;
                }
                Ok(flushed)
            })
        })
        .await
}

/// Drop idempotency keys past their TTL.
pub(crate) async fn idempotency_purge_tick(core: &Core) -> Result<u64, LedgerError> {
    core.runner
        .run(RunOptions::default(), |ctx| {
            Box::pin(async move {
                if !ctx
                    .storage()
                    .try_advisory_lock(advisory_key(IDEMPOTENCY_PURGE_WORKER))
                    .await?
                {
                    debug!("{IDEMPOTENCY_PURGE_WORKER} lease held elsewhere, skipping tick");
                    return Ok(0);
                }
                let now = ctx.now;
                let purged = ctx
                    .storage()
                    .delete(
                        Table::IdempotencyKey,
                        &Filter::new()
                            .eq("ledgerId", core.config.ledger.as_str())
                            .lte("expiresAt", now),
                    )
                    .await?;
                if purged > 0 {
                    debug!("purged {purged} expired idempotency keys");
                }
                Ok(purged)
            })
        })
        .await
}
