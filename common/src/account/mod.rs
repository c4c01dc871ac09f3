use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::time::TimestampMillis;

/// Account lifecycle status.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AccountStatus {
    /// Accepts all operations.
    Active,
    /// Rejects debits and holds; credits still land.
    Frozen,
    /// Rejects every mutation. Terminal.
    Closed,
}

/// Who the holder of an account is.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HolderType {
    Individual,
    Business,
    System,
    #[serde(untagged)]
    Custom(String),
}

/// Chart-of-accounts classification.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

/// Which entry side increases the balance.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NormalBalance {
    Credit,
    Debit,
}

/// A balance-bearing entity. Balances are integer minor units; the row
/// version bumps on every balance change and doubles as the optimistic lock
/// token. The checksum is an HMAC over the balance columns and version.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: Uuid,
    pub ledger_id: String,
    /// External identity, unique per ledger.
    pub holder_id: String,
    pub holder_type: HolderType,
    pub currency: String,
    pub status: AccountStatus,
    pub balance: i64,
    pub credit_balance: i64,
    pub debit_balance: i64,
    /// Funds reserved by open holds.
    pub pending_debit: i64,
    pub pending_credit: i64,
    pub version: u64,
    pub checksum: String,
    /// How far below zero the balance may go.
    pub overdraft_allowance: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freeze_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frozen_at: Option<TimestampMillis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<TimestampMillis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_type: Option<AccountType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_account_id: Option<Uuid>,
    pub normal_balance: NormalBalance,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: TimestampMillis,
    pub updated_at: TimestampMillis,
}

impl Account {
    /// Derived, never stored: what a new debit or hold can draw on.
    pub fn available_balance(&self) -> i64 {
        self.balance - self.pending_debit + self.pending_credit
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Lowest balance this account may reach.
    pub fn floor(&self) -> i64 {
        -(self.overdraft_allowance as i64)
    }
}

/// Backs internal flows (`@World`, `@Fees`, ...). Same balance shape as a
/// user account; hot accounts defer balance materialization to the
/// hot-entry ledger and a periodic flush.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemAccount {
    pub id: Uuid,
    pub ledger_id: String,
    /// Well-known identifier, by convention prefixed with `@`.
    pub identifier: String,
    pub currency: String,
    pub balance: i64,
    pub credit_balance: i64,
    pub debit_balance: i64,
    pub version: u64,
    pub checksum: String,
    pub normal_balance: NormalBalance,
    /// Entries accumulate in the hot-entry ledger instead of updating the
    /// balance inline.
    pub hot: bool,
    pub created_at: TimestampMillis,
    pub updated_at: TimestampMillis,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account {
            id: Uuid::nil(),
            ledger_id: "default".into(),
            holder_id: "alice".into(),
            holder_type: HolderType::Individual,
            currency: "USD".into(),
            status: AccountStatus::Active,
            balance: 50_000,
            credit_balance: 50_000,
            debit_balance: 0,
            pending_debit: 20_000,
            pending_credit: 0,
            version: 3,
            checksum: String::new(),
            overdraft_allowance: 0,
            freeze_reason: None,
            frozen_at: None,
            closed_at: None,
            account_type: None,
            account_code: None,
            parent_account_id: None,
            normal_balance: NormalBalance::Credit,
            metadata: Value::Null,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn available_balance_subtracts_pending_debits() {
        let acc = account();
        assert_eq!(acc.available_balance(), 30_000);
    }

    #[test]
    fn holder_type_roundtrip() {
        for ht in [
            HolderType::Individual,
            HolderType::System,
            HolderType::Custom("municipality".into()),
        ] {
            let data = serde_json::to_string(&ht).unwrap();
            let back: HolderType = serde_json::from_str(&data).unwrap();
            assert_eq!(ht, back);
        }
        assert_eq!(
            serde_json::to_string(&HolderType::Business).unwrap(),
            "\"business\""
        );
    }

    #[test]
    fn account_serializes_camel_case() {
        let v = serde_json::to_value(account()).unwrap();
        assert!(v.get("holderId").is_some());
        assert!(v.get("pendingDebit").is_some());
        // absent options are stripped, not null
        assert!(v.get("freezeReason").is_none());
    }
}
