use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::time::TimestampMillis;

/// Objects whose history is captured as a versioned event stream.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AggregateType {
    Account,
    Transaction,
    Hold,
}

/// Engine-emitted event kinds, plus an escape hatch for plugin-contributed
/// events carried as opaque names.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    #[serde(rename = "account:created")]
    AccountCreated,
    #[serde(rename = "account:frozen")]
    AccountFrozen,
    #[serde(rename = "account:unfrozen")]
    AccountUnfrozen,
    #[serde(rename = "account:closed")]
    AccountClosed,
    #[serde(rename = "transaction:posted")]
    TransactionPosted,
    #[serde(rename = "hold:created")]
    HoldCreated,
    #[serde(rename = "hold:committed")]
    HoldCommitted,
    #[serde(rename = "hold:voided")]
    HoldVoided,
    #[serde(rename = "hold:expired")]
    HoldExpired,
    #[serde(untagged)]
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::AccountCreated => "account:created",
            EventType::AccountFrozen => "account:frozen",
            EventType::AccountUnfrozen => "account:unfrozen",
            EventType::AccountClosed => "account:closed",
            EventType::TransactionPosted => "transaction:posted",
            EventType::HoldCreated => "hold:created",
            EventType::HoldCommitted => "hold:committed",
            EventType::HoldVoided => "hold:voided",
            EventType::HoldExpired => "hold:expired",
            EventType::Custom(name) => name,
        }
    }
}

/// One link of an aggregate's immutable audit log. Versions are 1-based and
/// gap-free per aggregate; `hash` commits to `prev_hash` and the canonical
/// rendering of `event_data`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEvent {
    pub id: Uuid,
    pub ledger_id: String,
    /// Globally monotonic, assigned by storage. Gaps allowed.
    #[serde(default)]
    pub sequence_number: u64,
    pub aggregate_type: AggregateType,
    pub aggregate_id: Uuid,
    pub aggregate_version: u64,
    pub event_type: EventType,
    pub event_data: Value,
    pub correlation_id: Uuid,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub created_at: TimestampMillis,
}
