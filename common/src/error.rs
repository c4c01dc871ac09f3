use serde_json::{json, Value};
use thiserror::Error;

/// Faults raised by a storage backend. The engine never interprets backend
/// text; it matches on these variants to decide retry behavior.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unique constraint violated on index {index}")]
    UniqueViolation { index: String },

    #[error("serialization failure")]
    SerializationFailure,

    #[error("deadlock detected")]
    Deadlock,

    #[error("lock not available")]
    LockNotAvailable,

    #[error("lock wait timed out after {waited_ms} ms")]
    LockTimeout { waited_ms: u64 },

    #[error("statement timed out after {limit_ms} ms")]
    StatementTimeout { limit_ms: u64 },

    #[error("table {table} is append-only: {operation} rejected")]
    ImmutableTable {
        table: &'static str,
        operation: &'static str,
    },

    #[error("operation not supported by this adapter: {0}")]
    Unsupported(&'static str),

    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StorageError {
    /// Lock/serialization faults that a fresh transaction may not hit again.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            StorageError::SerializationFailure
                | StorageError::Deadlock
                | StorageError::LockNotAvailable
                | StorageError::LockTimeout { .. }
        )
    }
}

/// Ledger error taxonomy. Every variant carries a stable code, an HTTP
/// status for hosts that surface errors over the wire, and a transient flag
/// suggesting whether a retry with a fresh idempotency key can succeed.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient balance on account {account_id}: need {need}, available {available}")]
    InsufficientBalance {
        account_id: String,
        need: u64,
        available: i64,
    },

    #[error("account {account_id} is frozen")]
    AccountFrozen {
        account_id: String,
        reason: Option<String>,
    },

    #[error("account {account_id} is closed")]
    AccountClosed { account_id: String },

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("duplicate reference {reference}")]
    Duplicate { reference: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("hold {hold_id} expired at {expired_at}")]
    HoldExpired { hold_id: String, expired_at: u64 },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("optimistic lock conflict on {entity} {id}")]
    OptimisticLockConflict { entity: &'static str, id: String },

    #[error("hash chain broken for {aggregate_type} {aggregate_id} at version {broken_at_version}")]
    ChainIntegrityViolation {
        aggregate_type: String,
        aggregate_id: String,
        broken_at_version: u64,
    },

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LedgerError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            LedgerError::AccountFrozen { .. } => "ACCOUNT_FROZEN",
            LedgerError::AccountClosed { .. } => "ACCOUNT_CLOSED",
            LedgerError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            LedgerError::NotFound { .. } => "NOT_FOUND",
            LedgerError::InvalidArgument(_) => "INVALID_ARGUMENT",
            LedgerError::Duplicate { .. } => "DUPLICATE",
            LedgerError::Conflict(_) => "CONFLICT",
            LedgerError::HoldExpired { .. } => "HOLD_EXPIRED",
            LedgerError::RateLimited(_) => "RATE_LIMITED",
            LedgerError::OptimisticLockConflict { .. } => "OPTIMISTIC_LOCK_CONFLICT",
            LedgerError::ChainIntegrityViolation { .. } => "CHAIN_INTEGRITY_VIOLATION",
            LedgerError::Internal(_) => "INTERNAL",
            LedgerError::Storage(_) => "INTERNAL",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::InsufficientBalance { .. } => 400,
            LedgerError::AccountFrozen { .. } => 403,
            LedgerError::AccountClosed { .. } => 403,
            LedgerError::LimitExceeded(_) => 429,
            LedgerError::NotFound { .. } => 404,
            LedgerError::InvalidArgument(_) => 400,
            LedgerError::Duplicate { .. } => 409,
            LedgerError::Conflict(_) => 409,
            LedgerError::HoldExpired { .. } => 410,
            LedgerError::RateLimited(_) => 429,
            LedgerError::OptimisticLockConflict { .. } => 409,
            LedgerError::ChainIntegrityViolation { .. } => 500,
            LedgerError::Internal(_) => 500,
            LedgerError::Storage(_) => 500,
        }
    }

    /// Whether a retry (with a fresh idempotency key) is worth suggesting to
    /// the caller. Distinct from the runner's internal retry classification,
    /// which only re-runs specific storage faults.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientBalance { .. }
                | LedgerError::AccountFrozen { .. }
                | LedgerError::LimitExceeded(_)
                | LedgerError::NotFound { .. }
                | LedgerError::HoldExpired { .. }
                | LedgerError::RateLimited(_)
                | LedgerError::OptimisticLockConflict { .. }
        ) || matches!(self, LedgerError::Storage(e) if e.is_contention())
    }

    pub fn doc_url(&self) -> String {
        format!(
            "https://summa.dev/docs/errors/{}",
            self.code().to_lowercase().replace('_', "-")
        )
    }

    /// Context map for hosts that attach details to wire responses.
    pub fn details(&self) -> Value {
        match self {
            LedgerError::InsufficientBalance {
                account_id,
                need,
                available,
            } => json!({ "accountId": account_id, "need": need, "available": available }),
            LedgerError::AccountFrozen { account_id, reason } => {
                json!({ "accountId": account_id, "reason": reason })
            }
            LedgerError::AccountClosed { account_id } => json!({ "accountId": account_id }),
            LedgerError::NotFound { entity, id } => json!({ "entity": entity, "id": id }),
            LedgerError::Duplicate { reference } => json!({ "reference": reference }),
            LedgerError::HoldExpired {
                hold_id,
                expired_at,
            } => json!({ "holdId": hold_id, "expiredAt": expired_at }),
            LedgerError::OptimisticLockConflict { entity, id } => {
                json!({ "entity": entity, "id": id })
            }
            LedgerError::ChainIntegrityViolation {
                aggregate_type,
                aggregate_id,
                broken_at_version,
            } => json!({
                "aggregateType": aggregate_type,
                "aggregateId": aggregate_id,
                "brokenAtVersion": broken_at_version,
            }),
            _ => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_codes_and_statuses() {
        let err = LedgerError::InsufficientBalance {
            account_id: "acc-1".into(),
            need: 500,
            available: 100,
        };
        assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
        assert_eq!(err.http_status(), 400);
        assert!(err.is_transient());
        assert_eq!(
            err.doc_url(),
            "https://summa.dev/docs/errors/insufficient-balance"
        );

        let err = LedgerError::Duplicate {
            reference: "r-1".into(),
        };
        assert_eq!(err.http_status(), 409);
        assert!(!err.is_transient());

        let err = LedgerError::ChainIntegrityViolation {
            aggregate_type: "account".into(),
            aggregate_id: "acc-1".into(),
            broken_at_version: 3,
        };
        assert_eq!(err.http_status(), 500);
        assert!(!err.is_transient());
        assert_eq!(err.details()["brokenAtVersion"], 3);
    }

    #[test]
    fn storage_contention_is_transient() {
        let err = LedgerError::Storage(StorageError::Deadlock);
        assert!(err.is_transient());
        let err = LedgerError::Storage(StorageError::Unsupported("raw sql"));
        assert!(!err.is_transient());
    }
}
