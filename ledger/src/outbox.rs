//! Transactional outbox.
//!
//! Observable events are written here in the same transaction as the state
//! change they describe; an external consumer drains them. Because the event
//! append and the outbox insert commit together, a consumer reading rows
//! with sequence below some bound always sees a consistent prefix.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use summa_common::error::LedgerError;
use summa_common::time::TimestampMillis;
use uuid::Uuid;

use crate::runner::TxContext;
use crate::storage::{from_row, to_row, Filter, Query, Sort, Table};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: Uuid,
    pub ledger_id: String,
    pub topic: String,
    pub payload: Value,
    pub created_at: TimestampMillis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<TimestampMillis>,
}

/// Insert an outbox row inside the current transaction.
pub(crate) async fn write(
    ctx: &mut TxContext,
    ledger_id: &str,
    topic: &str,
    payload: Value,
) -> Result<OutboxEntry, LedgerError> {
    let entry = OutboxEntry {
        id: Uuid::new_v4(),
        ledger_id: ledger_id.to_string(),
        topic: topic.to_string(),
        payload,
        created_at: ctx.now,
        processed_at: None,
    };
    ctx.storage().insert(Table::Outbox, to_row(&entry)?).await?;
    Ok(entry)
}

/// Oldest unprocessed rows, for the draining consumer.
pub(crate) async fn fetch_unprocessed(
    ctx: &mut TxContext,
    ledger_id: &str,
    limit: usize,
) -> Result<Vec<OutboxEntry>, LedgerError> {
    let rows = ctx
        .storage()
        .find_many(
            Table::Outbox,
            &Query {
                filter: Filter::new()
                    .eq("ledgerId", ledger_id)
                    .is_null("processedAt"),
                sort: Some(Sort::asc("createdAt")),
                limit: Some(limit),
                ..Default::default()
            },
        )
        .await?;
    rows.into_iter().map(from_row).collect()
}

pub(crate) async fn mark_processed(
    ctx: &mut TxContext,
    ledger_id: &str,
    ids: &[Uuid],
) -> Result<u64, LedgerError> {
    let now = ctx.now;
    let mut affected = 0;
    for id in ids {
        affected += ctx
            .storage()
            .update(
                Table::Outbox,
                &Filter::new()
                    .eq("ledgerId", ledger_id)
                    .eq("id", id.to_string()),
                [("processedAt".to_string(), Value::from(now))]
                    .into_iter()
                    .collect(),
            )
            .await?;
    }
    Ok(affected)
}
