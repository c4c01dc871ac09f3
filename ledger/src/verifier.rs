//! Hash chain verification, snapshots, and checkpoints.
//!
//! Full verification replays an aggregate's event stream from version 1,
//! asserting the version sequence is gap-free, each event links to its
//! predecessor's hash, and each hash re-derives from the canonical payload.
//! Snapshots persist a verified prefix so later runs only check the suffix.
//! Checkpoints commit to the global event sequence with a rolling hash
//! chained across checkpoint rows; the checkpoint table is append-only.

use log::warn;
use serde::{Deserialize, Serialize};
use summa_common::canonical::canonical_string;
use summa_common::error::LedgerError;
use summa_common::event::{AggregateType, LedgerEvent};
use summa_common::time::TimestampMillis;
use uuid::Uuid;

use crate::ledger::Core;
use crate::runner::{RunOptions, TxContext};
use crate::storage::{from_row, to_row, Filter, Query, RowLock, Sort, Table};

/// Verification result. `broken_at_version` points at the first event that
/// fails its link or hash check.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at_version: Option<u64>,
    pub checked: u64,
}

impl ChainReport {
    fn ok(checked: u64) -> Self {
        Self {
            valid: true,
            broken_at_version: None,
            checked,
        }
    }

    fn broken(version: u64, checked: u64) -> Self {
        Self {
            valid: false,
            broken_at_version: Some(version),
            checked,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HashSnapshot {
    id: Uuid,
    ledger_id: String,
    aggregate_type: AggregateType,
    aggregate_id: Uuid,
    snapshot_version: u64,
    snapshot_hash: String,
    event_count: u64,
    created_at: TimestampMillis,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockCheckpoint {
    id: Uuid,
    ledger_id: String,
    last_sequence: u64,
    event_count: u64,
    checkpoint_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_checkpoint_hash: Option<String>,
    created_at: TimestampMillis,
}

/// Replay an aggregate's chain from version 1.
pub(crate) async fn verify_chain(
    core: &Core,
    aggregate_type: AggregateType,
    aggregate_id: Uuid,
) -> Result<ChainReport, LedgerError> {
    core.runner
        .run(RunOptions::default(), |ctx| {
            Box::pin(async move {
                let events = raw_events(core, ctx, aggregate_type, aggregate_id, 0).await?;
                Ok(check_chain(core, &events, None, 0))
            })
        })
        .await
}

/// Verify only the suffix past the persisted snapshot, extending from its
/// hash. Falls back to a full replay when no snapshot exists.
pub(crate) async fn verify_from_snapshot(
    core: &Core,
    aggregate_type: AggregateType,
    aggregate_id: Uuid,
) -> Result<ChainReport, LedgerError> {
    core.runner
        .run(RunOptions::default(), |ctx| {
            Box::pin(async move {
                let snapshot = load_snapshot(core, ctx, aggregate_type, aggregate_id).await?;
                let (after_version, prev_hash) = match &snapshot {
                    Some(s) => (s.snapshot_version, Some(s.snapshot_hash.clone())),
                    None => (0, None),
                };
                let events =
                    raw_events(core, ctx, aggregate_type, aggregate_id, after_version).await?;
                Ok(check_chain(core, &events, prev_hash.as_deref(), after_version))
            })
        })
        .await
}

/// Verify the full chain and persist its tail as the new snapshot.
pub(crate) async fn snapshot(
    core: &Core,
    aggregate_type: AggregateType,
    aggregate_id: Uuid,
) -> Result<ChainReport, LedgerError> {
    core.runner
        .run(RunOptions::default(), |ctx| {
            Box::pin(async move {
                let events = raw_events(core, ctx, aggregate_type, aggregate_id, 0).await?;
                let report = check_chain(core, &events, None, 0);
                if !report.valid {
                    warn!(
                        "refusing to snapshot a broken chain for {aggregate_type} {aggregate_id}"
                    );
                    return Ok(report);
                }
                let tail = match events.last() {
                    Some(tail) => tail,
                    None => return Ok(report),
                };

                let filter = Filter::new()
                    .eq("ledgerId", core.config.ledger.as_str())
                    .eq("aggregateType", aggregate_type.to_string())
                    .eq("aggregateId", aggregate_id.to_string());
                let existing = ctx
                    .storage()
                    .find_one(Table::HashSnapshot, &filter, RowLock::ForUpdate)
                    .await?;
                if existing.is_some() {
                    ctx.storage()
                        .update(
                            Table::HashSnapshot,
                            &filter,
                            [
                                (
                                    "snapshotVersion".to_string(),
                                    serde_json::Value::from(tail.aggregate_version),
                                ),
                                (
                                    "snapshotHash".to_string(),
                                    serde_json::Value::from(tail.hash.clone()),
                                ),
                                (
                                    "eventCount".to_string(),
                                    serde_json::Value::from(events.len() as u64),
                                ),
                            ]
                            .into_iter()
                            .collect(),
                        )
                        .await?;
                } else {
                    let row = HashSnapshot {
                        id: Uuid::new_v4(),
                        ledger_id: core.config.ledger.clone(),
                        aggregate_type,
                        aggregate_id,
                        snapshot_version: tail.aggregate_version,
                        snapshot_hash: tail.hash.clone(),
                        event_count: events.len() as u64,
                        created_at: ctx.now,
                    };
                    ctx.storage()
                        .insert(Table::HashSnapshot, to_row(&row)?)
                        .await?;
                }
                Ok(report)
            })
        })
        .await
}

/// Append a checkpoint committing to the current tail of the global event
/// sequence.
pub(crate) async fn checkpoint(core: &Core) -> Result<Option<ChainReport>, LedgerError> {
    core.runner
        .run(RunOptions::default(), |ctx| {
            Box::pin(async move {
                let last = last_checkpoint(core, ctx).await?;
                let after_sequence = last.as_ref().map(|c| c.last_sequence).unwrap_or(0);
                let events = core
                    .events
                    .events_after_sequence(ctx, after_sequence, RowLock::None)
                    .await?;
                if events.is_empty() {
                    return Ok(None);
                }

                let prev_hash = last.map(|c| c.checkpoint_hash);
                let mut rolling = prev_hash.clone().unwrap_or_default();
                for event in &events {
                    rolling = core.hasher.chain_hash(Some(&rolling), &event.hash);
                }
                let row = BlockCheckpoint {
                    id: Uuid::new_v4(),
                    ledger_id: core.config.ledger.clone(),
                    last_sequence: events.last().map(|e| e.sequence_number).unwrap_or(0),
                    event_count: events.len() as u64,
                    checkpoint_hash: rolling,
                    prev_checkpoint_hash: prev_hash,
                    created_at: ctx.now,
                };
                ctx.storage()
                    .insert(Table::BlockCheckpoint, to_row(&row)?)
                    .await?;
                Ok(Some(ChainReport::ok(events.len() as u64)))
            })
        })
        .await
}

/// Recompute every checkpoint from the event log. `broken_at_version`
/// carries the failing checkpoint's `last_sequence`.
pub(crate) async fn verify_checkpoints(core: &Core) -> Result<ChainReport, LedgerError> {
    core.runner
        .run(RunOptions::default(), |ctx| {
            Box::pin(async move {
                let rows = ctx
                    .storage()
                    .find_many(
                        Table::BlockCheckpoint,
                        &Query {
                            filter: Filter::new().eq("ledgerId", core.config.ledger.as_str()),
                            sort: Some(Sort::asc("lastSequence")),
                            ..Default::default()
                        },
                    )
                    .await?;
                let mut checked = 0u64;
                let mut prev_hash: Option<String> = None;
                let mut after_sequence = 0u64;
                for row in rows {
                    let cp: BlockCheckpoint = from_row(row)?;
                    if cp.prev_checkpoint_hash != prev_hash {
                        return Ok(ChainReport::broken(cp.last_sequence, checked));
                    }
                    let events = core
                        .events
                        .events_after_sequence(ctx, after_sequence, RowLock::None)
                        .await?;
                    let window: Vec<&LedgerEvent> = events
                        .iter()
                        .filter(|e| e.sequence_number <= cp.last_sequence)
                        .collect();
                    let mut rolling = prev_hash.clone().unwrap_or_default();
                    for event in &window {
                        rolling = core.hasher.chain_hash(Some(&rolling), &event.hash);
                    }
                    if rolling != cp.checkpoint_hash || window.len() as u64 != cp.event_count {
                        return Ok(ChainReport::broken(cp.last_sequence, checked));
                    }
                    checked += window.len() as u64;
                    prev_hash = Some(cp.checkpoint_hash);
                    after_sequence = cp.last_sequence;
                }
                Ok(ChainReport::ok(checked))
            })
        })
        .await
}

/// Event rows read without the verify-on-read gate, so a broken chain
/// produces a report instead of an error.
async fn raw_events(
    core: &Core,
    ctx: &mut TxContext,
    aggregate_type: AggregateType,
    aggregate_id: Uuid,
    after_version: u64,
) -> Result<Vec<LedgerEvent>, LedgerError> {
    let mut filter = Filter::new()
        .eq("ledgerId", core.config.ledger.as_str())
        .eq("aggregateType", aggregate_type.to_string())
        .eq("aggregateId", aggregate_id.to_string());
    if after_version > 0 {
        filter = filter.gt("aggregateVersion", after_version);
    }
    let rows = ctx
        .storage()
        .find_many(
            Table::LedgerEvent,
            &Query {
                filter,
                sort: Some(Sort::asc("aggregateVersion")),
                ..Default::default()
            },
        )
        .await?;
    rows.into_iter().map(from_row).collect()
}

fn check_chain(
    core: &Core,
    events: &[LedgerEvent],
    snapshot_hash: Option<&str>,
    snapshot_version: u64,
) -> ChainReport {
    let mut prev_hash: Option<String> = snapshot_hash.map(str::to_string);
    let mut expected_version = snapshot_version + 1;
    let mut checked = 0u64;

    for event in events {
        if event.aggregate_version != expected_version {
            return ChainReport::broken(event.aggregate_version, checked);
        }
        // normalize: an absent prev hash and an empty one are the same link
        let stored_prev = event.prev_hash.clone().filter(|h| !h.is_empty());
        let expected_prev = prev_hash.clone().filter(|h| !h.is_empty());
        if stored_prev != expected_prev {
            return ChainReport::broken(event.aggregate_version, checked);
        }
        let recomputed = core
            .hasher
            .chain_hash(stored_prev.as_deref(), &canonical_string(&event.event_data));
        if recomputed != event.hash {
            return ChainReport::broken(event.aggregate_version, checked);
        }
        prev_hash = Some(event.hash.clone());
        expected_version += 1;
        checked += 1;
    }
    ChainReport::ok(checked)
}

async fn load_snapshot(
    core: &Core,
    ctx: &mut TxContext,
    aggregate_type: AggregateType,
    aggregate_id: Uuid,
) -> Result<Option<HashSnapshot>, LedgerError> {
    let row = ctx
        .storage()
        .find_one(
            Table::HashSnapshot,
            &Filter::new()
                .eq("ledgerId", core.config.ledger.as_str())
                .eq("aggregateType", aggregate_type.to_string())
                .eq("aggregateId", aggregate_id.to_string()),
            RowLock::None,
        )
        .await?;
    row.map(from_row).transpose()
}

async fn last_checkpoint(
    core: &Core,
    ctx: &mut TxContext,
) -> Result<Option<BlockCheckpoint>, LedgerError> {
    let rows = ctx
        .storage()
        .find_many(
            Table::BlockCheckpoint,
            &Query {
                filter: Filter::new().eq("ledgerId", core.config.ledger.as_str()),
                sort: Some(Sort::desc("lastSequence")),
                limit: Some(1),
                ..Default::default()
            },
        )
        .await?;
    rows.into_iter().next().map(from_row).transpose()
}
