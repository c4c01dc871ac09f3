//! Single-statement write path for SQL backends.
//!
//! Chains every write of a two-leg posting into one `WITH` statement:
//! transaction, both entries, both account updates, event, outbox, velocity
//! log, and idempotency upsert. Built with a single monotonic placeholder
//! counter; every value is a bound parameter and no user data is ever
//! interpolated into the SQL text. Backends without `raw_sql` capability
//! take the logical multi-operation path with identical semantics.

use serde_json::Value;

/// Accumulates bound parameters, handing out `$n` placeholders in order.
#[derive(Default)]
pub struct SqlParams {
    values: Vec<Value>,
}

impl SqlParams {
    pub fn bind(&mut self, value: impl Into<Value>) -> String {
        self.values.push(value.into());
        format!("${}", self.values.len())
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A ready-to-execute parameterized statement.
pub struct CtePlan {
    pub sql: String,
    pub params: Vec<Value>,
}

/// One account-side of the posting, with values precomputed by the mutator
/// arithmetic.
pub struct LegValues {
    pub entry_id: String,
    pub account_id: String,
    pub system_account: bool,
    pub entry_side: &'static str,
    pub amount: u64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub credit_balance: i64,
    pub debit_balance: i64,
    pub pending_debit: i64,
    pub new_version: u64,
    pub expected_version: u64,
    pub hash: String,
    pub prev_hash: Option<String>,
    pub checksum: String,
}

/// Inputs of the two-leg hot path.
pub struct TwoLegPosting {
    pub ledger_id: String,
    pub transaction_id: String,
    pub transaction_type: String,
    pub reference: String,
    pub amount: u64,
    pub currency: String,
    pub correlation_id: String,
    pub metadata: Value,
    pub debit: LegValues,
    pub credit: LegValues,
    pub event_id: String,
    pub event_type: String,
    pub event_data: Value,
    pub event_hash: String,
    pub outbox_id: String,
    pub outbox_topic: String,
    pub velocity_id: String,
    pub velocity_account_id: String,
    pub idempotency: Option<(String, String, Value, u64)>,
    pub now: u64,
}

fn entry_cte(name: &str, posting: &TwoLegPosting, leg: &LegValues, p: &mut SqlParams) -> String {
    format!(
        "{name} AS (\n  INSERT INTO entry (id, ledger_id, transaction_id, account_id, system_account, entry_side, amount, currency, balance_before, balance_after, account_version, hash, prev_hash, sequence_number, created_at)\n  VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, nextval('entry_sequence'), {})\n  RETURNING id\n)",
        p.bind(leg.entry_id.as_str()),
        p.bind(posting.ledger_id.as_str()),
        p.bind(posting.transaction_id.as_str()),
        p.bind(leg.account_id.as_str()),
        p.bind(leg.system_account),
        p.bind(leg.entry_side),
        p.bind(leg.amount),
        p.bind(posting.currency.as_str()),
        p.bind(leg.balance_before),
        p.bind(leg.balance_after),
        p.bind(leg.new_version),
        p.bind(leg.hash.as_str()),
        p.bind(leg.prev_hash.clone().map(Value::from).unwrap_or(Value::Null)),
        p.bind(posting.now),
    )
}

fn account_update_cte(name: &str, table: &str, leg: &LegValues, now: u64, p: &mut SqlParams) -> String {
    let pending = if leg.system_account {
        String::new()
    } else {
        format!("pending_debit = {}, ", p.bind(leg.pending_debit))
    };
    format!(
        "{name} AS (\n  UPDATE {table} SET balance = {}, credit_balance = {}, debit_balance = {}, {pending}version = {}, checksum = {}, updated_at = {}\n  WHERE id = {} AND version = {}\n  RETURNING id\n)",
        p.bind(leg.balance_after),
        p.bind(leg.credit_balance),
        p.bind(leg.debit_balance),
        p.bind(leg.new_version),
        p.bind(leg.checksum.as_str()),
        p.bind(now),
        p.bind(leg.account_id.as_str()),
        p.bind(leg.expected_version),
    )
}

/// Build the full posting statement. The returned row count tells the caller
/// whether both version predicates held; zero means an optimistic conflict.
pub fn build_two_leg_posting(posting: &TwoLegPosting) -> CtePlan {
    let mut p = SqlParams::default();
    let mut ctes: Vec<String> = Vec::new();

    ctes.push(format!(
        "new_txn AS (\n  INSERT INTO transaction_record (id, ledger_id, transaction_type, reference, amount, currency, correlation_id, metadata, status, is_hold, created_at, updated_at, posted_at)\n  VALUES ({}, {}, {}, {}, {}, {}, {}, {}, 'posted', false, {}, {}, {})\n  RETURNING id\n)",
        p.bind(posting.transaction_id.as_str()),
        p.bind(posting.ledger_id.as_str()),
        p.bind(posting.transaction_type.as_str()),
        p.bind(posting.reference.as_str()),
        p.bind(posting.amount),
        p.bind(posting.currency.as_str()),
        p.bind(posting.correlation_id.as_str()),
        p.bind(posting.metadata.clone()),
        p.bind(posting.now),
        p.bind(posting.now),
        p.bind(posting.now),
    ));

    ctes.push(entry_cte("new_debit_entry", posting, &posting.debit, &mut p));
    ctes.push(entry_cte("new_credit_entry", posting, &posting.credit, &mut p));

    let debit_table = if posting.debit.system_account {
        "system_account"
    } else {
        "account"
    };
    let credit_table = if posting.credit.system_account {
        "system_account"
    } else {
        "account"
    };
    ctes.push(account_update_cte(
        "new_debit_version",
        debit_table,
        &posting.debit,
        posting.now,
        &mut p,
    ));
    ctes.push(account_update_cte(
        "new_credit_version",
        credit_table,
        &posting.credit,
        posting.now,
        &mut p,
    ));

    // a transaction aggregate is born at this event, so prev_hash is null
    ctes.push(format!(
        "new_event AS (\n  INSERT INTO ledger_event (id, ledger_id, sequence_number, aggregate_type, aggregate_id, aggregate_version, event_type, event_data, correlation_id, hash, prev_hash, created_at)\n  VALUES ({}, {}, nextval('ledger_event_sequence'), 'transaction', {}, 1, {}, {}, {}, {}, NULL, {})\n  RETURNING id\n)",
        p.bind(posting.event_id.as_str()),
        p.bind(posting.ledger_id.as_str()),
        p.bind(posting.transaction_id.as_str()),
        p.bind(posting.event_type.as_str()),
        p.bind(posting.event_data.clone()),
        p.bind(posting.correlation_id.as_str()),
        p.bind(posting.event_hash.as_str()),
        p.bind(posting.now),
    ));

    ctes.push(format!(
        "new_outbox AS (\n  INSERT INTO outbox (id, ledger_id, topic, payload, created_at)\n  VALUES ({}, {}, {}, {}, {})\n  RETURNING id\n)",
        p.bind(posting.outbox_id.as_str()),
        p.bind(posting.ledger_id.as_str()),
        p.bind(posting.outbox_topic.as_str()),
        p.bind(posting.event_data.clone()),
        p.bind(posting.now),
    ));

    ctes.push(format!(
        "new_velocity AS (\n  INSERT INTO account_transaction_log (id, ledger_id, account_id, transaction_id, amount, entry_side, created_at)\n  VALUES ({}, {}, {}, {}, {}, {}, {})\n  RETURNING id\n)",
        p.bind(posting.velocity_id.as_str()),
        p.bind(posting.ledger_id.as_str()),
        p.bind(posting.velocity_account_id.as_str()),
        p.bind(posting.transaction_id.as_str()),
        p.bind(posting.amount),
        p.bind(if posting.velocity_account_id == posting.debit.account_id {
            "DEBIT"
        } else {
            "CREDIT"
        }),
        p.bind(posting.now),
    ));

    if let Some((idem_id, key, response, expires_at)) = &posting.idempotency {
        ctes.push(format!(
            "new_idem AS (\n  INSERT INTO idempotency_key (id, ledger_id, key, reference, response, expires_at, created_at)\n  VALUES ({}, {}, {}, {}, {}, {}, {})\n  ON CONFLICT (ledger_id, key) DO UPDATE SET response = EXCLUDED.response, expires_at = EXCLUDED.expires_at\n  RETURNING id\n)",
            p.bind(idem_id.as_str()),
            p.bind(posting.ledger_id.as_str()),
            p.bind(key.as_str()),
            p.bind(posting.reference.as_str()),
            p.bind(response.clone()),
            p.bind(*expires_at),
            p.bind(posting.now),
        ));
    }

    let sql = format!(
        "WITH {}\nSELECT (SELECT count(*) FROM new_debit_version) + (SELECT count(*) FROM new_credit_version) AS updated_accounts",
        ctes.join(",\n")
    );
    CtePlan {
        sql,
        params: p.into_values(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leg(system: bool, side: &'static str) -> LegValues {
        LegValues {
            entry_id: format!("e-{side}"),
            account_id: format!("a-{side}"),
            system_account: system,
            entry_side: side,
            amount: 1000,
            balance_before: 0,
            balance_after: if side == "CREDIT" { 1000 } else { -1000 },
            credit_balance: 1000,
            debit_balance: 0,
            pending_debit: 0,
            new_version: 2,
            expected_version: 1,
            hash: format!("h-{side}"),
            prev_hash: None,
            checksum: format!("c-{side}"),
        }
    }

    fn posting() -> TwoLegPosting {
        TwoLegPosting {
            ledger_id: "default".into(),
            transaction_id: "t-1".into(),
            transaction_type: "credit".into(),
            reference: "r-1".into(),
            amount: 1000,
            currency: "USD".into(),
            correlation_id: "corr-1".into(),
            metadata: json!({}),
            debit: leg(true, "DEBIT"),
            credit: leg(false, "CREDIT"),
            event_id: "ev-1".into(),
            event_type: "transaction:posted".into(),
            event_data: json!({ "amount": 1000 }),
            event_hash: "evh".into(),
            outbox_id: "o-1".into(),
            outbox_topic: "transaction.posted".into(),
            velocity_id: "v-1".into(),
            velocity_account_id: "a-CREDIT".into(),
            idempotency: Some(("i-1".into(), "key-1".into(), json!({ "ok": true }), 99)),
            now: 42,
        }
    }

    #[test]
    fn placeholders_are_monotonic_and_match_params() {
        let plan = build_two_leg_posting(&posting());
        for n in 1..=plan.params.len() {
            assert!(
                plan.sql.contains(&format!("${n}")),
                "placeholder ${n} missing"
            );
        }
        // no placeholder beyond the parameter count
        assert!(!plan.sql.contains(&format!("${}", plan.params.len() + 1)));
    }

    #[test]
    fn no_user_data_is_interpolated() {
        let mut posting = posting();
        posting.reference = "'; DROP TABLE entry; --".into();
        posting.metadata = json!({ "note": "'; DROP TABLE account; --" });
        let plan = build_two_leg_posting(&posting);
        assert!(!plan.sql.contains("DROP TABLE"));
        assert!(plan
            .params
            .iter()
            .any(|v| v.as_str() == Some("'; DROP TABLE entry; --")));
    }

    #[test]
    fn chains_every_write_stage() {
        let plan = build_two_leg_posting(&posting());
        for stage in [
            "new_txn",
            "new_debit_entry",
            "new_credit_entry",
            "new_debit_version",
            "new_credit_version",
            "new_event",
            "new_outbox",
            "new_velocity",
            "new_idem",
        ] {
            assert!(plan.sql.contains(stage), "stage {stage} missing");
        }
        // transaction aggregates are born at this event
        assert!(plan.sql.contains("1, "));
        assert!(plan.sql.contains("NULL"));
        // system legs have no pending_debit column
        assert!(plan.sql.contains("UPDATE system_account"));
        assert!(plan.sql.contains("UPDATE account"));
    }

    #[test]
    fn idempotency_stage_is_optional() {
        let mut no_idem = posting();
        no_idem.idempotency = None;
        let plan = build_two_leg_posting(&no_idem);
        assert!(!plan.sql.contains("new_idem"));
    }
}
