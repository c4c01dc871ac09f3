use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use summa_common::error::LedgerError;
use summa_common::time::MILLIS_PER_DAY;

use crate::plugin::LedgerPlugin;

// Hot-path batching threshold: a flush tick aggregates at most this many
// pending hot entries per account
pub const DEFAULT_HOT_ACCOUNT_THRESHOLD: usize = 1000;

// Idempotency keys expire after a day
pub const DEFAULT_IDEMPOTENCY_TTL_MS: u64 = MILLIS_PER_DAY;

// Statement and lock timeouts applied to every ledger transaction
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 3000;

// Upper bound on a single transaction amount: 100 billion minor units
pub const DEFAULT_MAX_TRANSACTION_AMOUNT: u64 = 100_000_000_000;

// Retry budgets per lock mode. Pessimistic flows hold row locks, so a
// failure is not expected to clear on its own; optimistic flows race on the
// version predicate and retry cheaply.
pub const DEFAULT_LOCK_RETRY_COUNT: u32 = 0;
pub const DEFAULT_OPTIMISTIC_RETRY_COUNT: u32 = 3;

// Backoff between retries: min(base * 2^attempt, max) * (0.5 + rand)
pub const DEFAULT_RETRY_BACKOFF_BASE_MS: u64 = 50;
pub const DEFAULT_RETRY_BACKOFF_MAX_MS: u64 = 500;

// Well-known system account names
pub const SYSTEM_WORLD: &str = "world";
pub const SYSTEM_FEES: &str = "fees";
pub const SYSTEM_ADJUSTMENT: &str = "adjustment";

/// How the mutator serializes concurrent writes to one account.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LockMode {
    /// `SELECT ... FOR UPDATE`, waiting for the lock.
    #[default]
    Wait,
    /// `SELECT ... FOR UPDATE NOWAIT`, failing fast under contention.
    Nowait,
    /// No row lock; conflicts surface through the version predicate and the
    /// unique `(account_id, account_version)` entry constraint.
    Optimistic,
}

impl LockMode {
    pub fn is_pessimistic(self) -> bool {
        !matches!(self, LockMode::Optimistic)
    }
}

/// Tuning knobs. Every field has a production default.
#[derive(Clone, Debug)]
pub struct AdvancedConfig {
    pub hot_account_threshold: usize,
    pub idempotency_ttl_ms: u64,
    pub transaction_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub max_transaction_amount: u64,
    /// When set, chain hashes and balance checksums use HMAC-SHA-256 with
    /// this secret instead of plain SHA-256.
    pub hmac_secret: Option<String>,
    /// Re-derive event hashes and balance checksums on every read.
    pub verify_hash_on_read: bool,
    pub lock_mode: LockMode,
    pub lock_retry_count: u32,
    pub optimistic_retry_count: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            hot_account_threshold: DEFAULT_HOT_ACCOUNT_THRESHOLD,
            idempotency_ttl_ms: DEFAULT_IDEMPOTENCY_TTL_MS,
            transaction_timeout_ms: DEFAULT_TRANSACTION_TIMEOUT_MS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            max_transaction_amount: DEFAULT_MAX_TRANSACTION_AMOUNT,
            hmac_secret: None,
            verify_hash_on_read: false,
            lock_mode: LockMode::default(),
            lock_retry_count: DEFAULT_LOCK_RETRY_COUNT,
            optimistic_retry_count: DEFAULT_OPTIMISTIC_RETRY_COUNT,
            retry_backoff_base_ms: DEFAULT_RETRY_BACKOFF_BASE_MS,
            retry_backoff_max_ms: DEFAULT_RETRY_BACKOFF_MAX_MS,
        }
    }
}

impl AdvancedConfig {
    /// Retry budget for the configured lock mode.
    pub fn retry_budget(&self) -> u32 {
        match self.lock_mode {
            LockMode::Optimistic => self.optimistic_retry_count,
            LockMode::Wait | LockMode::Nowait => self.lock_retry_count,
        }
    }
}

/// Top-level ledger configuration.
#[derive(Clone)]
pub struct LedgerConfig {
    /// Logical ledger id. Every row this instance writes is scoped to it.
    pub ledger: String,
    /// Default currency (ISO 4217 code).
    pub currency: String,
    /// Map of system account name to identifier, e.g. `world -> "@World"`.
    pub system_accounts: IndexMap<String, String>,
    /// Logical table namespace for SQL backends.
    pub schema: Option<String>,
    pub advanced: AdvancedConfig,
    /// Ordered plugin list; hooks dispatch in this order.
    pub plugins: Vec<Arc<dyn LedgerPlugin>>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let mut system_accounts = IndexMap::new();
        system_accounts.insert(SYSTEM_WORLD.to_string(), "@World".to_string());
        system_accounts.insert(SYSTEM_FEES.to_string(), "@Fees".to_string());
        system_accounts.insert(SYSTEM_ADJUSTMENT.to_string(), "@Adjustments".to_string());
        Self {
            ledger: "default".to_string(),
            currency: "USD".to_string(),
            system_accounts,
            schema: None,
            advanced: AdvancedConfig::default(),
            plugins: Vec::new(),
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.ledger.is_empty() {
            return Err(LedgerError::InvalidArgument("ledger id is empty".into()));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(LedgerError::InvalidArgument(format!(
                "currency must be an ISO 4217 code, got {:?}",
                self.currency
            )));
        }
        if !self.system_accounts.contains_key(SYSTEM_WORLD) {
            return Err(LedgerError::InvalidArgument(
                "system_accounts must define a world account".into(),
            ));
        }
        for (name, identifier) in &self.system_accounts {
            if !identifier.starts_with('@') {
                return Err(LedgerError::InvalidArgument(format!(
                    "system account {name} identifier {identifier:?} must start with '@'"
                )));
            }
        }
        if self.advanced.max_transaction_amount == 0 {
            return Err(LedgerError::InvalidArgument(
                "max_transaction_amount must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn system_identifier(&self, name: &str) -> Result<&str, LedgerError> {
        self.system_accounts
            .get(name)
            .map(|s| s.as_str())
            .ok_or_else(|| LedgerError::NotFound {
                entity: "system account",
                id: name.to_string(),
            })
    }
}
