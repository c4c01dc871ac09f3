//! In-memory storage backend.
//!
//! Serves tests and hosts that embed the ledger without a database. Writes
//! buffer in a per-transaction overlay and apply atomically at commit under
//! a single apply lock. Row-level write locks model `FOR UPDATE`
//! (wait / nowait / skip-locked): every update of a committed row acquires
//! its lock and re-evaluates the predicate after acquisition, so a stale
//! version predicate misses exactly as it would against a SQL backend.
//! Unique indexes are checked at write time against committed state and
//! re-checked at commit, which makes racing inserts surface as unique
//! violations on the loser.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use summa_common::error::StorageError;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{
    Capabilities, Condition, Filter, FilterOp, Query, Row, RowLock, StorageAdapter, StorageTx,
    Table, TxOptions,
};

type RowKey = (Table, String);

#[derive(Default)]
struct MemoryStore {
    tables: Mutex<HashMap<Table, BTreeMap<String, Row>>>,
    row_locks: Mutex<HashMap<RowKey, Arc<AsyncMutex<()>>>>,
    advisory: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
    sequences: Mutex<HashMap<Table, u64>>,
}

impl MemoryStore {
    fn row_lock(&self, key: &RowKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.row_locks.lock().unwrap();
        locks.entry(key.clone()).or_default().clone()
    }

    fn advisory_lock_handle(&self, key: i64) -> Arc<AsyncMutex<()>> {
        let mut locks = self.advisory.lock().unwrap();
        locks.entry(key).or_default().clone()
    }

    fn next_sequence(&self, table: Table) -> u64 {
        let mut sequences = self.sequences.lock().unwrap();
        let counter = sequences.entry(table).or_insert(0);
        *counter += 1;
        *counter
    }

    fn committed(&self, table: Table) -> BTreeMap<String, Row> {
        let tables = self.tables.lock().unwrap();
        tables.get(&table).cloned().unwrap_or_default()
    }
}

/// Adapter handle; cheap to clone, all state shared.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    store: Arc<MemoryStore>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct committed-state mutation, bypassing every constraint. Only for
    /// tamper tests.
    pub fn tamper_with<F>(&self, table: Table, id: &str, f: F)
    where
        F: FnOnce(&mut Row),
    {
        let mut tables = self.store.tables.lock().unwrap();
        if let Some(row) = tables.entry(table).or_default().get_mut(id) {
            f(row);
        }
    }

    /// Committed row count, for side-effect assertions in tests.
    pub fn committed_count(&self, table: Table) -> usize {
        self.store.committed(table).len()
    }

    /// Committed rows of a table, for invariant assertions in tests.
    pub fn committed_rows(&self, table: Table) -> Vec<Row> {
        self.store.committed(table).into_values().collect()
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn StorageTx>, StorageError> {
        Ok(Box::new(MemoryTx {
            store: self.store.clone(),
            opts,
            inserted: HashMap::new(),
            insert_order: Vec::new(),
            updated: HashMap::new(),
            deleted: HashSet::new(),
            guards: HashMap::new(),
            advisory_guards: HashMap::new(),
        }))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { raw_sql: false }
    }
}

struct MemoryTx {
    store: Arc<MemoryStore>,
    opts: TxOptions,
    inserted: HashMap<RowKey, Row>,
    insert_order: Vec<RowKey>,
    updated: HashMap<RowKey, Row>,
    deleted: HashSet<RowKey>,
    guards: HashMap<RowKey, OwnedMutexGuard<()>>,
    advisory_guards: HashMap<i64, OwnedMutexGuard<()>>,
}

fn row_id(row: &Row) -> Result<String, StorageError> {
    row.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StorageError::Backend(anyhow::anyhow!("row is missing a string id")))
}

// Numeric comparison across the integer widths serde_json produces.
fn cmp_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return Some(x.cmp(&y));
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return Some(x.cmp(&y));
            }
            x.as_f64().zip(y.as_f64()).and_then(|(x, y)| x.partial_cmp(&y))
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn matches_condition(row: &Row, cond: &Condition) -> bool {
    let field = row.get(cond.field).unwrap_or(&Value::Null);
    match cond.op {
        FilterOp::IsNull => field.is_null(),
        FilterOp::IsNotNull => !field.is_null(),
        FilterOp::Eq => field == &cond.value,
        FilterOp::Ne => field != &cond.value,
        op => match cmp_values(field, &cond.value) {
            Some(ordering) => match op {
                FilterOp::Lt => ordering.is_lt(),
                FilterOp::Lte => ordering.is_le(),
                FilterOp::Gt => ordering.is_gt(),
                FilterOp::Gte => ordering.is_ge(),
                _ => unreachable!(),
            },
            None => false,
        },
    }
}

fn matches_filter(row: &Row, filter: &Filter) -> bool {
    filter.conditions.iter().all(|c| matches_condition(row, c))
}

fn index_key(row: &Row, columns: &[&str]) -> String {
    let mut key = String::new();
    for column in columns {
        key.push_str(&row.get(*column).map(|v| v.to_string()).unwrap_or_default());
        key.push('\u{1f}');
    }
    key
}

impl MemoryTx {
    /// Committed state merged with this transaction's overlay.
    fn merged(&self, table: Table) -> BTreeMap<String, Row> {
        let mut rows = self.store.committed(table);
        rows.retain(|id, _| !self.deleted.contains(&(table, id.clone())));
        for (key, row) in &self.updated {
            if key.0 == table {
                rows.insert(key.1.clone(), row.clone());
            }
        }
        for key in &self.insert_order {
            if key.0 == table {
                if let Some(row) = self.inserted.get(key) {
                    rows.insert(key.1.clone(), row.clone());
                }
            }
        }
        rows
    }

    fn merged_row(&self, key: &RowKey) -> Option<Row> {
        if self.deleted.contains(key) {
            return None;
        }
        if let Some(row) = self.inserted.get(key).or_else(|| self.updated.get(key)) {
            return Some(row.clone());
        }
        self.store.committed(key.0).remove(&key.1)
    }

    fn filtered(&self, table: Table, filter: &Filter) -> Vec<(String, Row)> {
        self.merged(table)
            .into_iter()
            .filter(|(_, row)| matches_filter(row, filter))
            .collect()
    }

    /// Acquire the write lock of a committed row. Returns false only in
    /// skip-locked mode when the row is contended.
    async fn acquire_row_lock(&mut self, key: RowKey, mode: RowLock) -> Result<bool, StorageError> {
        if mode == RowLock::None || self.guards.contains_key(&key) {
            return Ok(true);
        }
        // own inserts are invisible to other transactions, nothing to lock
        if self.inserted.contains_key(&key) {
            return Ok(true);
        }
        let lock = self.store.row_lock(&key);
        match mode {
            RowLock::ForUpdate => {
                let waited_ms = self.opts.lock_timeout_ms;
                let guard =
                    tokio::time::timeout(Duration::from_millis(waited_ms), lock.lock_owned())
                        .await
                        .map_err(|_| StorageError::LockTimeout { waited_ms })?;
                self.guards.insert(key, guard);
                Ok(true)
            }
            RowLock::ForUpdateNoWait => match lock.try_lock_owned() {
                Ok(guard) => {
                    self.guards.insert(key, guard);
                    Ok(true)
                }
                Err(_) => Err(StorageError::LockNotAvailable),
            },
            RowLock::ForUpdateSkipLocked => match lock.try_lock_owned() {
                Ok(guard) => {
                    self.guards.insert(key, guard);
                    Ok(true)
                }
                Err(_) => Ok(false),
            },
            RowLock::None => unreachable!(),
        }
    }

    fn check_unique(
        &self,
        table: Table,
        row: &Row,
        row_key: &RowKey,
        committed: &BTreeMap<String, Row>,
    ) -> Result<(), StorageError> {
        for (index, columns) in table.unique_indexes() {
            let key = index_key(row, columns);
            let conflict = committed
                .iter()
                .filter(|(id, _)| {
                    id.as_str() != row_key.1 && !self.deleted.contains(&(table, (*id).clone()))
                })
                .map(|(id, existing)| {
                    // own updates shadow the committed image
                    self.updated
                        .get(&(table, id.clone()))
                        .unwrap_or(existing)
                })
                .chain(
                    self.insert_order
                        .iter()
                        .filter(|k| k.0 == table && *k != row_key)
                        .filter_map(|k| self.inserted.get(k)),
                )
                .any(|existing| index_key(existing, columns) == key);
            if conflict {
                return Err(StorageError::UniqueViolation {
                    index: index.to_string(),
                });
            }
        }
        Ok(())
    }

    fn apply_changes(base: &Row, changes: &Row) -> Row {
        let mut next = base.clone();
        for (field, value) in changes {
            next.insert(field.clone(), value.clone());
        }
        next
    }
}

#[async_trait]
impl StorageTx for MemoryTx {
    async fn insert(&mut self, table: Table, mut row: Row) -> Result<Row, StorageError> {
        let id = row_id(&row)?;
        let key = (table, id.clone());
        if table.sequenced() {
            row.insert(
                "sequenceNumber".to_string(),
                Value::from(self.store.next_sequence(table)),
            );
        }
        let committed = self.store.committed(table);
        if committed.contains_key(&id) || self.inserted.contains_key(&key) {
            return Err(StorageError::Backend(anyhow::anyhow!(
                "duplicate primary key {id} in {table}"
            )));
        }
        self.check_unique(table, &row, &key, &committed)?;
        self.inserted.insert(key.clone(), row.clone());
        self.insert_order.push(key);
        Ok(row)
    }

    async fn find_one(
        &mut self,
        table: Table,
        filter: &Filter,
        lock: RowLock,
    ) -> Result<Option<Row>, StorageError> {
        loop {
            let candidate = self.filtered(table, filter).into_iter().next();
            let (id, row) = match candidate {
                Some(c) => c,
                None => return Ok(None),
            };
            if lock == RowLock::None {
                return Ok(Some(row));
            }
            let key = (table, id);
            if !self.acquire_row_lock(key.clone(), lock).await? {
                // skip-locked: the only candidate is contended
                return Ok(None);
            }
            // the row may have changed while we waited for the lock
            match self.merged_row(&key) {
                Some(fresh) if matches_filter(&fresh, filter) => return Ok(Some(fresh)),
                _ => {
                    self.guards.remove(&key);
                    continue;
                }
            }
        }
    }

    async fn find_many(&mut self, table: Table, query: &Query) -> Result<Vec<Row>, StorageError> {
        let mut rows = self.filtered(table, &query.filter);
        if let Some(sort) = query.sort {
            rows.sort_by(|(a_id, a), (b_id, b)| {
                let a_val = a.get(sort.field).unwrap_or(&Value::Null);
                let b_val = b.get(sort.field).unwrap_or(&Value::Null);
                let ordering = cmp_values(a_val, b_val)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a_id.cmp(b_id));
                if sort.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        let rows: Vec<(String, Row)> = rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();

        if query.lock == RowLock::None {
            return Ok(rows.into_iter().map(|(_, row)| row).collect());
        }
        let mut locked = Vec::with_capacity(rows.len());
        for (id, _) in rows {
            let key = (table, id);
            if !self.acquire_row_lock(key.clone(), query.lock).await? {
                continue;
            }
            if let Some(fresh) = self.merged_row(&key) {
                if matches_filter(&fresh, &query.filter) {
                    locked.push(fresh);
                    continue;
                }
            }
            self.guards.remove(&key);
        }
        Ok(locked)
    }

    async fn update(
        &mut self,
        table: Table,
        filter: &Filter,
        changes: Row,
    ) -> Result<u64, StorageError> {
        if table.immutable() {
            return Err(StorageError::ImmutableTable {
                table: match table {
                    Table::Entry => "entry",
                    Table::LedgerEvent => "ledger_event",
                    Table::BlockCheckpoint => "block_checkpoint",
                    _ => unreachable!(),
                },
                operation: "UPDATE",
            });
        }
        let candidates: Vec<String> = self
            .filtered(table, filter)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let mut affected = 0;
        for id in candidates {
            let key = (table, id);
            // writes serialize on the row lock; the predicate re-check after
            // acquisition is what makes a stale version miss
            self.acquire_row_lock(key.clone(), RowLock::ForUpdate).await?;
            let fresh = match self.merged_row(&key) {
                Some(row) if matches_filter(&row, filter) => row,
                _ => continue,
            };
            let next = Self::apply_changes(&fresh, &changes);
            if self.inserted.contains_key(&key) {
                self.inserted.insert(key, next);
            } else {
                self.updated.insert(key, next);
            }
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete(&mut self, table: Table, filter: &Filter) -> Result<u64, StorageError> {
        if table.immutable() {
            return Err(StorageError::ImmutableTable {
                table: match table {
                    Table::Entry => "entry",
                    Table::LedgerEvent => "ledger_event",
                    Table::BlockCheckpoint => "block_checkpoint",
                    _ => unreachable!(),
                },
                operation: "DELETE",
            });
        }
        let candidates: Vec<String> = self
            .filtered(table, filter)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let mut affected = 0;
        for id in candidates {
            let key = (table, id);
            self.acquire_row_lock(key.clone(), RowLock::ForUpdate).await?;
            let still_matches = self
                .merged_row(&key)
                .map(|r| matches_filter(&r, filter))
                .unwrap_or(false);
            if !still_matches {
                continue;
            }
            if self.inserted.remove(&key).is_some() {
                self.insert_order.retain(|k| k != &key);
            } else {
                self.updated.remove(&key);
                self.deleted.insert(key);
            }
            affected += 1;
        }
        Ok(affected)
    }

    async fn count(&mut self, table: Table, filter: &Filter) -> Result<u64, StorageError> {
        Ok(self.filtered(table, filter).len() as u64)
    }

    async fn advisory_lock(&mut self, key: i64) -> Result<(), StorageError> {
        if self.advisory_guards.contains_key(&key) {
            return Ok(());
        }
        let lock = self.store.advisory_lock_handle(key);
        let waited_ms = self.opts.lock_timeout_ms;
        let guard = tokio::time::timeout(Duration::from_millis(waited_ms), lock.lock_owned())
            .await
            .map_err(|_| StorageError::LockTimeout { waited_ms })?;
        self.advisory_guards.insert(key, guard);
        Ok(())
    }

    async fn try_advisory_lock(&mut self, key: i64) -> Result<bool, StorageError> {
        if self.advisory_guards.contains_key(&key) {
            return Ok(true);
        }
        let lock = self.store.advisory_lock_handle(key);
        match lock.try_lock_owned() {
            Ok(guard) => {
                self.advisory_guards.insert(key, guard);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn raw(&mut self, _sql: &str, _params: Vec<Value>) -> Result<Vec<Row>, StorageError> {
        Err(StorageError::Unsupported("raw sql on the memory adapter"))
    }

    async fn raw_mutate(&mut self, _sql: &str, _params: Vec<Value>) -> Result<u64, StorageError> {
        Err(StorageError::Unsupported("raw sql on the memory adapter"))
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let store = self.store.clone();
        let mut tables = store.tables.lock().unwrap();

        // re-check unique constraints against the state being committed
        // into; a racing transaction may have won since the write-time check
        for key in &self.insert_order {
            if let Some(row) = self.inserted.get(key) {
                let committed = tables.get(&key.0).cloned().unwrap_or_default();
                for (index, columns) in key.0.unique_indexes() {
                    let candidate = index_key(row, columns);
                    let conflict = committed.iter().any(|(id, existing)| {
                        *id != key.1
                            && !self.deleted.contains(&(key.0, id.clone()))
                            && index_key(existing, columns) == candidate
                    });
                    if conflict {
                        return Err(StorageError::UniqueViolation {
                            index: index.to_string(),
                        });
                    }
                }
            }
        }

        for key in &self.deleted {
            if let Some(table) = tables.get_mut(&key.0) {
                table.remove(&key.1);
            }
        }
        for (key, row) in self.updated.drain() {
            tables.entry(key.0).or_default().insert(key.1, row);
        }
        for key in self.insert_order.drain(..) {
            if let Some(row) = self.inserted.remove(&key) {
                tables.entry(key.0).or_default().insert(key.1, row);
            }
        }
        drop(tables);
        self.guards.clear();
        self.advisory_guards.clear();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.guards.clear();
        self.advisory_guards.clear();
        Ok(())
    }
}
