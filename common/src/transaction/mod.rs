use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::time::TimestampMillis;

// Exchange rates are carried as integers scaled by 10^6 so cross-currency
// arithmetic never touches floating point.
pub const FX_RATE_SCALE: u64 = 1_000_000;

// Maximum number of legs accepted by a raw journal posting
pub const MAX_JOURNAL_LEGS: usize = 64;

// Maximum number of destinations of a multi-destination hold or transfer
pub const MAX_DESTINATIONS: usize = 32;

/// Every way money moves through the ledger.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TransactionType {
    Credit,
    Debit,
    Transfer,
    Correction,
    Adjustment,
    Journal,
    Refund,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TransactionStatus {
    /// Created but not settled. Holds live here until resolved.
    Inflight,
    /// Settled. Terminal for ordinary transactions.
    Posted,
    /// Cancelled before settlement. Terminal.
    Voided,
    /// A hold whose expiry sweep released it. Terminal.
    Expired,
}

/// One destination of a multi-destination hold, amounts summing to the hold
/// amount.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HoldDestination {
    /// Holder id of a user account, or a `@`-prefixed system identifier.
    pub destination: String,
    pub amount: u64,
}

/// A logical transfer: the unit callers reason about. Entries hang off it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: Uuid,
    pub ledger_id: String,
    pub transaction_type: TransactionType,
    /// External idempotent identifier, unique per ledger.
    pub reference: String,
    pub amount: u64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_account_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_account_id: Option<Uuid>,
    /// Groups every event produced by one top-level command.
    pub correlation_id: Uuid,
    #[serde(default)]
    pub metadata: Value,
    pub status: TransactionStatus,
    pub is_hold: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_expires_at: Option<TimestampMillis>,
    /// Multi-destination split of a hold; amounts sum to `amount`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_destinations: Option<Vec<HoldDestination>>,
    /// Exchange rate scaled by [`FX_RATE_SCALE`]. For holds this is locked
    /// at create time and reused on commit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fx_rate_micros: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_currency: Option<String>,
    pub created_at: TimestampMillis,
    pub updated_at: TimestampMillis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub posted_at: Option<TimestampMillis>,
}

impl TransactionRecord {
    pub fn is_open_hold(&self) -> bool {
        self.is_hold && self.status == TransactionStatus::Inflight
    }
}

/// Accounting line item side.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
pub enum EntrySide {
    #[serde(rename = "DEBIT")]
    #[strum(serialize = "DEBIT")]
    Debit,
    #[serde(rename = "CREDIT")]
    #[strum(serialize = "CREDIT")]
    Credit,
}

impl EntrySide {
    pub fn opposite(self) -> Self {
        match self {
            EntrySide::Debit => EntrySide::Credit,
            EntrySide::Credit => EntrySide::Debit,
        }
    }
}

/// The append-only accounting line item. Captures the balance around the
/// mutation and the per-account hash chain link. `account_version` is the
/// post-entry account version and the optimistic lock token.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: Uuid,
    pub ledger_id: String,
    pub transaction_id: Uuid,
    pub account_id: Uuid,
    /// True when the account is a system account.
    pub system_account: bool,
    pub entry_side: EntrySide,
    pub amount: u64,
    pub currency: String,
    pub balance_before: i64,
    pub balance_after: i64,
    pub account_version: u64,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    /// Globally monotonic, assigned by storage. Gaps allowed.
    #[serde(default)]
    pub sequence_number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fx_rate_micros: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_currency: Option<String>,
    pub created_at: TimestampMillis,
}
