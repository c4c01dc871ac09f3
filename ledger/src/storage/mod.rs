//! Storage adapter interface.
//!
//! Every other component talks to the persistent store through these traits.
//! Backends map the logical schema and operations onto their own wire
//! format; the engine never hands them un-parameterized SQL built from user
//! data.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use summa_common::error::{LedgerError, StorageError};

pub mod memory;

/// A logical row. Backends decide the physical representation.
pub type Row = Map<String, Value>;

/// Unique index names, shared between backends and the retry classifier.
pub const IDX_ACCOUNT_HOLDER: &str = "account_ledger_holder_idx";
pub const IDX_SYSTEM_IDENTIFIER: &str = "system_account_ledger_identifier_idx";
pub const IDX_TXN_REFERENCE: &str = "transaction_record_ledger_reference_idx";
pub const IDX_ENTRY_ACCOUNT_VERSION: &str = "entry_account_version_idx";
pub const IDX_EVENT_AGGREGATE_VERSION: &str = "ledger_event_aggregate_version_idx";
pub const IDX_IDEMPOTENCY_KEY: &str = "idempotency_key_ledger_key_idx";
pub const IDX_HASH_SNAPSHOT: &str = "hash_snapshot_aggregate_idx";

/// The persisted tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Table {
    Account,
    SystemAccount,
    TransactionRecord,
    Entry,
    LedgerEvent,
    IdempotencyKey,
    Outbox,
    HotAccountEntry,
    HashSnapshot,
    BlockCheckpoint,
    AccountTransactionLog,
}

impl Table {
    /// Append-only tables reject UPDATE and DELETE at the storage layer.
    pub fn immutable(self) -> bool {
        matches!(
            self,
            Table::Entry | Table::LedgerEvent | Table::BlockCheckpoint
        )
    }

    /// Unique indexes enforced on this table, as `(index name, columns)`.
    /// Column keys follow the serde rendering of the domain types
    /// (camelCase); backends map them to physical columns.
    pub fn unique_indexes(self) -> &'static [(&'static str, &'static [&'static str])] {
        match self {
            Table::Account => &[(IDX_ACCOUNT_HOLDER, &["ledgerId", "holderId"])],
            Table::SystemAccount => &[(IDX_SYSTEM_IDENTIFIER, &["ledgerId", "identifier"])],
            Table::TransactionRecord => &[(IDX_TXN_REFERENCE, &["ledgerId", "reference"])],
            Table::Entry => &[(IDX_ENTRY_ACCOUNT_VERSION, &["accountId", "accountVersion"])],
            Table::LedgerEvent => &[(
                IDX_EVENT_AGGREGATE_VERSION,
                &["ledgerId", "aggregateType", "aggregateId", "aggregateVersion"],
            )],
            Table::IdempotencyKey => &[(IDX_IDEMPOTENCY_KEY, &["ledgerId", "key"])],
            Table::HashSnapshot => &[(
                IDX_HASH_SNAPSHOT,
                &["ledgerId", "aggregateType", "aggregateId"],
            )],
            _ => &[],
        }
    }

    /// Tables whose `sequence_number` column is fed by a global sequence.
    pub fn sequenced(self) -> bool {
        matches!(self, Table::Entry | Table::LedgerEvent)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    IsNull,
    IsNotNull,
}

#[derive(Clone, Debug)]
pub struct Condition {
    pub field: &'static str,
    pub op: FilterOp,
    pub value: Value,
}

/// Conjunction of field conditions.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field,
            op: FilterOp::Eq,
            value: value.into(),
        });
        self
    }

    pub fn ne(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field,
            op: FilterOp::Ne,
            value: value.into(),
        });
        self
    }

    pub fn lt(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field,
            op: FilterOp::Lt,
            value: value.into(),
        });
        self
    }

    pub fn lte(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field,
            op: FilterOp::Lte,
            value: value.into(),
        });
        self
    }

    pub fn gt(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field,
            op: FilterOp::Gt,
            value: value.into(),
        });
        self
    }

    pub fn gte(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field,
            op: FilterOp::Gte,
            value: value.into(),
        });
        self
    }

    pub fn is_null(mut self, field: &'static str) -> Self {
        self.conditions.push(Condition {
            field,
            op: FilterOp::IsNull,
            value: Value::Null,
        });
        self
    }

    pub fn is_not_null(mut self, field: &'static str) -> Self {
        self.conditions.push(Condition {
            field,
            op: FilterOp::IsNotNull,
            value: Value::Null,
        });
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RowLock {
    #[default]
    None,
    /// `FOR UPDATE`, waiting up to the lock timeout.
    ForUpdate,
    /// `FOR UPDATE NOWAIT`.
    ForUpdateNoWait,
    /// `FOR UPDATE SKIP LOCKED`: contended rows drop out of the result.
    ForUpdateSkipLocked,
}

#[derive(Clone, Copy, Debug)]
pub struct Sort {
    pub field: &'static str,
    pub descending: bool,
}

impl Sort {
    pub fn asc(field: &'static str) -> Self {
        Self {
            field,
            descending: false,
        }
    }

    pub fn desc(field: &'static str) -> Self {
        Self {
            field,
            descending: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Query {
    pub filter: Filter,
    pub sort: Option<Sort>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub lock: RowLock,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Isolation {
    ReadCommitted,
    #[default]
    RepeatableRead,
    Serializable,
}

/// Options applied when a transaction opens.
#[derive(Clone, Copy, Debug)]
pub struct TxOptions {
    pub isolation: Isolation,
    pub statement_timeout_ms: u64,
    pub lock_timeout_ms: u64,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            isolation: Isolation::RepeatableRead,
            statement_timeout_ms: crate::config::DEFAULT_TRANSACTION_TIMEOUT_MS,
            lock_timeout_ms: crate::config::DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Capabilities {
    /// Whether `raw` / `raw_mutate` accept SQL. Enables the single-statement
    /// CTE hot path.
    pub raw_sql: bool,
}

/// SQL fragments that differ between dialects. Backends without SQL ignore
/// this entirely.
pub trait SqlDialect: Send + Sync {
    fn generate_uuid(&self) -> &'static str;
    fn now(&self) -> &'static str;
    fn interval_millis(&self, ms: u64) -> String;
    fn set_statement_timeout(&self, ms: u64) -> String;
    fn set_lock_timeout(&self, ms: u64) -> String;
}

/// PostgreSQL fragments; the reference dialect for the CTE builder.
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn generate_uuid(&self) -> &'static str {
        "gen_random_uuid()"
    }

    fn now(&self) -> &'static str {
        "now()"
    }

    fn interval_millis(&self, ms: u64) -> String {
        format!("interval '{ms} milliseconds'")
    }

    fn set_statement_timeout(&self, ms: u64) -> String {
        format!("SET LOCAL statement_timeout = {ms}")
    }

    fn set_lock_timeout(&self, ms: u64) -> String {
        format!("SET LOCAL lock_timeout = {ms}")
    }
}

/// Factory for transactions plus backend capabilities.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn StorageTx>, StorageError>;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn dialect(&self) -> &dyn SqlDialect {
        &PostgresDialect
    }
}

/// One open transaction. All reads and writes of a ledger operation flow
/// through a single `StorageTx` and commit or roll back together.
#[async_trait]
pub trait StorageTx: Send {
    /// Insert a row; returns the stored image (with assigned sequence
    /// numbers).
    async fn insert(&mut self, table: Table, row: Row) -> Result<Row, StorageError>;

    async fn find_one(
        &mut self,
        table: Table,
        filter: &Filter,
        lock: RowLock,
    ) -> Result<Option<Row>, StorageError>;

    async fn find_many(&mut self, table: Table, query: &Query) -> Result<Vec<Row>, StorageError>;

    /// Update matching rows with the given column changes; returns the
    /// number of affected rows. Zero with a version predicate is the
    /// optimistic-lock miss.
    async fn update(
        &mut self,
        table: Table,
        filter: &Filter,
        changes: Row,
    ) -> Result<u64, StorageError>;

    async fn delete(&mut self, table: Table, filter: &Filter) -> Result<u64, StorageError>;

    async fn count(&mut self, table: Table, filter: &Filter) -> Result<u64, StorageError>;

    /// Process-global advisory lock, held until this transaction ends.
    async fn advisory_lock(&mut self, key: i64) -> Result<(), StorageError>;

    /// Non-blocking advisory lock acquisition.
    async fn try_advisory_lock(&mut self, key: i64) -> Result<bool, StorageError>;

    /// Raw parameterized SQL passthrough for capable backends.
    async fn raw(&mut self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>, StorageError>;

    async fn raw_mutate(&mut self, sql: &str, params: Vec<Value>) -> Result<u64, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Serialize a domain value into a logical row.
pub fn to_row<T: Serialize>(value: &T) -> Result<Row, LedgerError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(LedgerError::Internal(format!(
            "expected an object row, got {other}"
        ))),
        Err(e) => Err(LedgerError::Internal(format!("row serialization: {e}"))),
    }
}

/// Deserialize a logical row into a domain value.
pub fn from_row<T: DeserializeOwned>(row: Row) -> Result<T, LedgerError> {
    serde_json::from_value(Value::Object(row))
        .map_err(|e| LedgerError::Internal(format!("row deserialization: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immutable_tables_are_the_audit_surfaces() {
        assert!(Table::Entry.immutable());
        assert!(Table::LedgerEvent.immutable());
        assert!(Table::BlockCheckpoint.immutable());
        assert!(!Table::Account.immutable());
        assert!(!Table::HotAccountEntry.immutable());
    }

    #[test]
    fn table_names_are_snake_case() {
        assert_eq!(Table::TransactionRecord.to_string(), "transaction_record");
        assert_eq!(
            Table::AccountTransactionLog.to_string(),
            "account_transaction_log"
        );
    }

    #[test]
    fn filter_builder_accumulates_conditions() {
        let f = Filter::new()
            .eq("ledgerId", "default")
            .lt("holdExpiresAt", 100)
            .is_null("processedAt");
        assert_eq!(f.conditions.len(), 3);
        assert_eq!(f.conditions[1].op, FilterOp::Lt);
    }

    #[test]
    fn postgres_dialect_fragments() {
        let d = PostgresDialect;
        assert_eq!(d.set_lock_timeout(3000), "SET LOCAL lock_timeout = 3000");
        assert_eq!(d.interval_millis(500), "interval '500 milliseconds'");
    }
}
