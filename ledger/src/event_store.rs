//! Append-only ledger event log.
//!
//! One row per state change, versioned per aggregate without gaps. Each
//! event's hash commits to the previous event's hash and the canonical
//! rendering of its payload. The unique
//! `(ledgerId, aggregateType, aggregateId, aggregateVersion)` index is the
//! serialization point for concurrent appends: the loser surfaces a
//! retryable conflict and re-reads the tail on the next attempt.

use log::trace;
use serde_json::Value;
use summa_common::canonical::canonical_string;
use summa_common::crypto::ChainHasher;
use summa_common::error::LedgerError;
use summa_common::event::{AggregateType, EventType, LedgerEvent};
use uuid::Uuid;

use crate::runner::TxContext;
use crate::storage::{from_row, to_row, Filter, Query, RowLock, Sort, Table};

pub struct EventStore {
    ledger_id: String,
    hasher: ChainHasher,
    verify_on_read: bool,
}

impl EventStore {
    pub fn new(ledger_id: String, hasher: ChainHasher, verify_on_read: bool) -> Self {
        Self {
            ledger_id,
            hasher,
            verify_on_read,
        }
    }

    pub fn hasher(&self) -> &ChainHasher {
        &self.hasher
    }

    /// Append the next event of an aggregate. Computes the version and hash
    /// from the current tail inside the same transaction.
    pub async fn append(
        &self,
        ctx: &mut TxContext,
        aggregate_type: AggregateType,
        aggregate_id: Uuid,
        event_type: EventType,
        event_data: Value,
    ) -> Result<LedgerEvent, LedgerError> {
        let tail = self.tail(ctx, aggregate_type, aggregate_id).await?;
        let (aggregate_version, prev_hash) = match tail {
            Some(event) => (event.aggregate_version + 1, Some(event.hash)),
            None => (1, None),
        };
        let canonical = canonical_string(&event_data);
        let hash = self.hasher.chain_hash(prev_hash.as_deref(), &canonical);
        trace!(
            "append {} v{aggregate_version} for {aggregate_type} {aggregate_id}",
            event_type.as_str()
        );

        let event = LedgerEvent {
            id: Uuid::new_v4(),
            ledger_id: self.ledger_id.clone(),
            sequence_number: 0,
            aggregate_type,
            aggregate_id,
            aggregate_version,
            event_type,
            event_data,
            correlation_id: ctx.correlation_id,
            hash,
            prev_hash,
            created_at: ctx.now,
        };
        let stored = ctx
            .storage()
            .insert(Table::LedgerEvent, to_row(&event)?)
            .await?;
        from_row(stored)
    }

    /// Latest event of an aggregate, if any.
    pub async fn tail(
        &self,
        ctx: &mut TxContext,
        aggregate_type: AggregateType,
        aggregate_id: Uuid,
    ) -> Result<Option<LedgerEvent>, LedgerError> {
        let rows = ctx
            .storage()
            .find_many(
                Table::LedgerEvent,
                &Query {
                    filter: self.aggregate_filter(aggregate_type, aggregate_id),
                    sort: Some(Sort::desc("aggregateVersion")),
                    limit: Some(1),
                    ..Default::default()
                },
            )
            .await?;
        rows.into_iter()
            .next()
            .map(|row| self.read(row))
            .transpose()
    }

    /// Full event stream of an aggregate, ascending versions.
    pub async fn events_for_aggregate(
        &self,
        ctx: &mut TxContext,
        aggregate_type: AggregateType,
        aggregate_id: Uuid,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        let rows = ctx
            .storage()
            .find_many(
                Table::LedgerEvent,
                &Query {
                    filter: self.aggregate_filter(aggregate_type, aggregate_id),
                    sort: Some(Sort::asc("aggregateVersion")),
                    ..Default::default()
                },
            )
            .await?;
        rows.into_iter().map(|row| self.read(row)).collect()
    }

    /// Every event of one top-level command.
    pub async fn events_for_correlation(
        &self,
        ctx: &mut TxContext,
        correlation_id: Uuid,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        let rows = ctx
            .storage()
            .find_many(
                Table::LedgerEvent,
                &Query {
                    filter: Filter::new()
                        .eq("ledgerId", self.ledger_id.as_str())
                        .eq("correlationId", correlation_id.to_string()),
                    sort: Some(Sort::asc("sequenceNumber")),
                    ..Default::default()
                },
            )
            .await?;
        rows.into_iter().map(|row| self.read(row)).collect()
    }

    /// Events strictly after a given aggregate version.
    pub async fn events_after_version(
        &self,
        ctx: &mut TxContext,
        aggregate_type: AggregateType,
        aggregate_id: Uuid,
        after_version: u64,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        let rows = ctx
            .storage()
            .find_many(
                Table::LedgerEvent,
                &Query {
                    filter: self
                        .aggregate_filter(aggregate_type, aggregate_id)
                        .gt("aggregateVersion", after_version),
                    sort: Some(Sort::asc("aggregateVersion")),
                    ..Default::default()
                },
            )
            .await?;
        rows.into_iter().map(|row| self.read(row)).collect()
    }

    /// Events strictly after a global sequence number.
    pub async fn events_after_sequence(
        &self,
        ctx: &mut TxContext,
        after_sequence: u64,
        lock: RowLock,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        let rows = ctx
            .storage()
            .find_many(
                Table::LedgerEvent,
                &Query {
                    filter: Filter::new()
                        .eq("ledgerId", self.ledger_id.as_str())
                        .gt("sequenceNumber", after_sequence),
                    sort: Some(Sort::asc("sequenceNumber")),
                    lock,
                    ..Default::default()
                },
            )
            .await?;
        rows.into_iter().map(|row| self.read(row)).collect()
    }

    fn aggregate_filter(&self, aggregate_type: AggregateType, aggregate_id: Uuid) -> Filter {
        Filter::new()
            .eq("ledgerId", self.ledger_id.as_str())
            .eq("aggregateType", aggregate_type.to_string())
            .eq("aggregateId", aggregate_id.to_string())
    }

    fn read(&self, row: crate::storage::Row) -> Result<LedgerEvent, LedgerError> {
        let event: LedgerEvent = from_row(row)?;
        if self.verify_on_read {
            let canonical = canonical_string(&event.event_data);
            let expected = self.hasher.chain_hash(event.prev_hash.as_deref(), &canonical);
            if expected != event.hash {
                return Err(LedgerError::ChainIntegrityViolation {
                    aggregate_type: event.aggregate_type.to_string(),
                    aggregate_id: event.aggregate_id.to_string(),
                    broken_at_version: event.aggregate_version,
                });
            }
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdvancedConfig;
    use crate::runner::{RunOptions, TransactionRunner};
    use crate::storage::memory::MemoryAdapter;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::Arc;

    fn fixtures() -> (TransactionRunner, EventStore, MemoryAdapter) {
        let adapter = MemoryAdapter::new();
        let runner = TransactionRunner::new(Arc::new(adapter.clone()), AdvancedConfig::default());
        let store = EventStore::new("default".into(), ChainHasher::new(Some("secret")), true);
        (runner, store, adapter)
    }

    #[tokio::test]
    async fn versions_are_gap_free_and_chained() {
        let (runner, store, _) = fixtures();
        let aggregate_id = Uuid::new_v4();
        let events = runner
            .run(RunOptions::default(), |ctx| {
                let store = &store;
                async move {
                    for i in 0..3 {
                        store
                            .append(
                                ctx,
                                AggregateType::Account,
                                aggregate_id,
                                EventType::Custom(format!("tick:{i}")),
                                json!({ "i": i }),
                            )
                            .await?;
                    }
                    store
                        .events_for_aggregate(ctx, AggregateType::Account, aggregate_id)
                        .await
                }
                .boxed()
            })
            .await
            .unwrap();

        assert_eq!(events.len(), 3);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.aggregate_version, i as u64 + 1);
            if i == 0 {
                assert!(event.prev_hash.is_none());
            } else {
                assert_eq!(event.prev_hash.as_deref(), Some(events[i - 1].hash.as_str()));
            }
            assert!(event.sequence_number > 0);
        }
    }

    #[tokio::test]
    async fn verify_on_read_detects_tampering() {
        let (runner, store, adapter) = fixtures();
        let aggregate_id = Uuid::new_v4();
        let event = runner
            .run(RunOptions::default(), |ctx| {
                let store = &store;
                async move {
                    store
                        .append(
                            ctx,
                            AggregateType::Transaction,
                            aggregate_id,
                            EventType::TransactionPosted,
                            json!({ "amount": 100 }),
                        )
                        .await
                }
                .boxed()
            })
            .await
            .unwrap();

        adapter.tamper_with(Table::LedgerEvent, &event.id.to_string(), |row| {
            row.insert("eventData".into(), json!({ "amount": 999_999 }));
        });

        let err = runner
            .run(RunOptions::default(), |ctx| {
                let store = &store;
                async move {
                    store
                        .events_for_aggregate(ctx, AggregateType::Transaction, aggregate_id)
                        .await
                }
                .boxed()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CHAIN_INTEGRITY_VIOLATION");
    }
}
