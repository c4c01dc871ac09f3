//! Scoped transactional execution.
//!
//! Opens a repeatable-read transaction with statement and lock timeouts,
//! runs the body, commits, then runs after-commit callbacks. Transient
//! failures (serialization, deadlock, lock contention, version-index unique
//! violations) retry with jittered exponential backoff; everything else
//! surfaces to the caller untouched. Cancellation is cooperative: every
//! storage call is an await point and inherits the caller's cancellation.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, warn};
use summa_common::error::{LedgerError, StorageError};
use summa_common::time::{now_millis, TimestampMillis};
use uuid::Uuid;

use crate::config::AdvancedConfig;
use crate::storage::{
    StorageAdapter, StorageTx, TxOptions, IDX_ENTRY_ACCOUNT_VERSION, IDX_EVENT_AGGREGATE_VERSION,
};

pub type AfterCommitHook =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), LedgerError>> + Send>;

/// Per-transaction working context handed to the body: the storage
/// transaction, the command's correlation id, the wall-clock captured at
/// open, and the after-commit queue.
pub struct TxContext {
    tx: Box<dyn StorageTx>,
    after_commit: Vec<(String, AfterCommitHook)>,
    pub correlation_id: Uuid,
    pub now: TimestampMillis,
}

impl TxContext {
    pub fn storage(&mut self) -> &mut dyn StorageTx {
        self.tx.as_mut()
    }

    /// Queue a callback to run after a successful commit, in insertion
    /// order. Callback failures are logged and never abort the commit.
    pub fn after_commit<F>(&mut self, label: impl Into<String>, hook: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<(), LedgerError>> + Send + 'static,
    {
        self.after_commit.push((label.into(), Box::new(hook)));
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RunOptions {
    /// Override the lock-mode-derived retry budget.
    pub retry_budget: Option<u32>,
    /// Reuse a correlation id instead of minting one.
    pub correlation_id: Option<Uuid>,
}

pub struct TransactionRunner {
    adapter: Arc<dyn StorageAdapter>,
    advanced: AdvancedConfig,
}

impl TransactionRunner {
    pub fn new(adapter: Arc<dyn StorageAdapter>, advanced: AdvancedConfig) -> Self {
        Self { adapter, advanced }
    }

    /// Execute `body` in a transaction and return its result. The body may
    /// run more than once; it must derive all state from the context it is
    /// given on each attempt.
    pub async fn run<T, F>(&self, opts: RunOptions, body: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'c> Fn(&'c mut TxContext) -> BoxFuture<'c, Result<T, LedgerError>> + Send + Sync,
    {
        let budget = opts.retry_budget.unwrap_or_else(|| self.advanced.retry_budget());
        let correlation_id = opts.correlation_id.unwrap_or_else(Uuid::new_v4);
        let tx_opts = TxOptions {
            statement_timeout_ms: self.advanced.transaction_timeout_ms,
            lock_timeout_ms: self.advanced.lock_timeout_ms,
            ..Default::default()
        };

        let mut attempt: u32 = 0;
        loop {
            let tx = self.adapter.begin(tx_opts).await.map_err(LedgerError::Storage)?;
            let mut ctx = TxContext {
                tx,
                after_commit: Vec::new(),
                correlation_id,
                now: now_millis(),
            };

            let error = match body(&mut ctx).await {
                Ok(value) => {
                    let TxContext {
                        tx, after_commit, ..
                    } = ctx;
                    match tx.commit().await {
                        Ok(()) => {
                            for (label, hook) in after_commit {
                                if let Err(e) = hook().await {
                                    warn!("after-commit callback {label} failed: {e}");
                                }
                            }
                            return Ok(value);
                        }
                        Err(e) => LedgerError::Storage(e),
                    }
                }
                Err(error) => {
                    let TxContext { tx, .. } = ctx;
                    if let Err(e) = tx.rollback().await {
                        warn!("rollback failed: {e}");
                    }
                    error
                }
            };

            if is_retryable(&error) && attempt < budget {
                let delay = backoff_delay(
                    attempt,
                    self.advanced.retry_backoff_base_ms,
                    self.advanced.retry_backoff_max_ms,
                );
                debug!(
                    "transient failure on attempt {attempt}, retrying in {}ms: {error}",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(error);
        }
    }
}

/// Whether the runner may re-run the transaction. Only contention faults and
/// version-index races qualify; duplicate references and idempotency-key
/// collisions are real outcomes and never retried.
pub fn is_retryable(error: &LedgerError) -> bool {
    match error {
        LedgerError::OptimisticLockConflict { .. } => true,
        LedgerError::Storage(storage) => match storage {
            StorageError::SerializationFailure
            | StorageError::Deadlock
            | StorageError::LockNotAvailable
            | StorageError::LockTimeout { .. } => true,
            StorageError::UniqueViolation { index } => {
                index == IDX_ENTRY_ACCOUNT_VERSION || index == IDX_EVENT_AGGREGATE_VERSION
            }
            _ => false,
        },
        _ => false,
    }
}

/// `min(base * 2^attempt, max) * (0.5 + rand)`.
fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(max_ms) as f64;
    let jitter = 0.5 + rand::random::<f64>();
    Duration::from_millis((capped * jitter) as u64)
}
