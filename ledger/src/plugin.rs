//! Plugin surface and hook dispatcher.
//!
//! Plugins are trait objects in a registry vector. `before*` hooks dispatch
//! in registration order and may veto by returning an error, which
//! propagates unchanged; `after*` hooks dispatch in reverse registration
//! order and run as after-commit callbacks, so they never block or abort
//! the write path. The registry refuses to start when a declared dependency
//! is missing.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use summa_common::error::LedgerError;
use summa_common::transaction::TransactionType;
use uuid::Uuid;

use crate::orchestrator::TransactionOutcome;
use crate::runner::TxContext;

/// What a transaction operation is about to do, shown to `before` hooks.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionIntent {
    pub transaction_type: TransactionType,
    pub reference: String,
    pub amount: u64,
    pub currency: String,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub metadata: Value,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountIntent {
    pub operation: &'static str,
    pub holder_id: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldIntent {
    pub operation: &'static str,
    pub hold_id: Option<Uuid>,
    pub reference: Option<String>,
    pub amount: Option<u64>,
}

/// A background worker a plugin asks the host to run.
#[derive(Clone, Debug)]
pub struct WorkerSpec {
    pub id: String,
    pub interval_ms: u64,
    /// Acquire a distributed lease (advisory lock) so only one process runs
    /// a tick at a time.
    pub lease: bool,
}

#[async_trait]
pub trait LedgerPlugin: Send + Sync {
    fn id(&self) -> &str;

    /// Plugin ids that must be registered before this one starts.
    fn dependencies(&self) -> Vec<&str> {
        Vec::new()
    }

    async fn init(&self) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn before_transaction(&self, _intent: &TransactionIntent) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn after_transaction(&self, _outcome: &TransactionOutcome) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn before_account(&self, _intent: &AccountIntent) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn after_account(&self, _intent: &AccountIntent) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn before_hold(&self, _intent: &HoldIntent) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn after_hold(&self, _intent: &HoldIntent) -> Result<(), LedgerError> {
        Ok(())
    }

    fn workers(&self) -> Vec<WorkerSpec> {
        Vec::new()
    }

    async fn run_worker(&self, _worker_id: &str) -> Result<(), LedgerError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Arc<Vec<Arc<dyn LedgerPlugin>>>,
}

impl PluginRegistry {
    pub fn new(plugins: Vec<Arc<dyn LedgerPlugin>>) -> Result<Self, LedgerError> {
        let mut seen: HashSet<String> = HashSet::new();
        for plugin in &plugins {
            if !seen.insert(plugin.id().to_string()) {
                return Err(LedgerError::InvalidArgument(format!(
                    "duplicate plugin id {}",
                    plugin.id()
                )));
            }
        }
        for plugin in &plugins {
            for dep in plugin.dependencies() {
                if !seen.contains(dep) {
                    return Err(LedgerError::InvalidArgument(format!(
                        "plugin {} depends on missing plugin {dep}",
                        plugin.id()
                    )));
                }
            }
        }
        Ok(Self {
            plugins: Arc::new(plugins),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub async fn init_all(&self) -> Result<(), LedgerError> {
        for plugin in self.plugins.iter() {
            plugin.init().await?;
        }
        Ok(())
    }

    pub async fn before_transaction(&self, intent: &TransactionIntent) -> Result<(), LedgerError> {
        for plugin in self.plugins.iter() {
            plugin.before_transaction(intent).await?;
        }
        Ok(())
    }

    /// Queue every plugin's `after_transaction` as an after-commit callback,
    /// in reverse registration order.
    pub fn queue_after_transaction(&self, ctx: &mut TxContext, outcome: &TransactionOutcome) {
        for plugin in self.plugins.iter().rev() {
            let plugin = plugin.clone();
            let outcome = outcome.clone();
            let label = format!("after_transaction:{}", plugin.id());
            ctx.after_commit(label, move || {
                async move { plugin.after_transaction(&outcome).await }.boxed()
            });
        }
    }

    pub async fn before_account(&self, intent: &AccountIntent) -> Result<(), LedgerError> {
        for plugin in self.plugins.iter() {
            plugin.before_account(intent).await?;
        }
        Ok(())
    }

    pub fn queue_after_account(&self, ctx: &mut TxContext, intent: &AccountIntent) {
        for plugin in self.plugins.iter().rev() {
            let plugin = plugin.clone();
            let intent = intent.clone();
            let label = format!("after_account:{}", plugin.id());
            ctx.after_commit(label, move || {
                async move { plugin.after_account(&intent).await }.boxed()
            });
        }
    }

    pub async fn before_hold(&self, intent: &HoldIntent) -> Result<(), LedgerError> {
        for plugin in self.plugins.iter() {
            plugin.before_hold(intent).await?;
        }
        Ok(())
    }

    pub fn queue_after_hold(&self, ctx: &mut TxContext, intent: &HoldIntent) {
        for plugin in self.plugins.iter().rev() {
            let plugin = plugin.clone();
            let intent = intent.clone();
            let label = format!("after_hold:{}", plugin.id());
            ctx.after_commit(label, move || {
                async move { plugin.after_hold(&intent).await }.boxed()
            });
        }
    }

    /// Every worker declared by every plugin, with its owner.
    pub fn workers(&self) -> Vec<(Arc<dyn LedgerPlugin>, WorkerSpec)> {
        self.plugins
            .iter()
            .flat_map(|plugin| {
                plugin
                    .workers()
                    .into_iter()
                    .map(move |spec| (plugin.clone(), spec))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        id: &'static str,
        deps: Vec<&'static str>,
        log: Arc<Mutex<Vec<String>>>,
        veto: bool,
    }

    #[async_trait]
    impl LedgerPlugin for Recorder {
        fn id(&self) -> &str {
            self.id
        }

        fn dependencies(&self) -> Vec<&str> {
            self.deps.clone()
        }

        async fn before_transaction(&self, _: &TransactionIntent) -> Result<(), LedgerError> {
            self.log.lock().unwrap().push(format!("before:{}", self.id));
            if self.veto {
                return Err(LedgerError::LimitExceeded(format!(
                    "{} vetoed the transaction",
                    self.id
                )));
            }
            Ok(())
        }
    }

    fn intent() -> TransactionIntent {
        TransactionIntent {
            transaction_type: TransactionType::Credit,
            reference: "r-1".into(),
            amount: 100,
            currency: "USD".into(),
            source: None,
            destination: Some("alice".into()),
            metadata: Value::Null,
        }
    }

    #[tokio::test]
    async fn before_hooks_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = PluginRegistry::new(vec![
            Arc::new(Recorder {
                id: "velocity",
                deps: vec![],
                log: log.clone(),
                veto: false,
            }),
            Arc::new(Recorder {
                id: "audit",
                deps: vec!["velocity"],
                log: log.clone(),
                veto: false,
            }),
        ])
        .unwrap();
        registry.before_transaction(&intent()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["before:velocity", "before:audit"]);
    }

    #[tokio::test]
    async fn veto_propagates_typed_and_stops_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = PluginRegistry::new(vec![
            Arc::new(Recorder {
                id: "limiter",
                deps: vec![],
                log: log.clone(),
                veto: true,
            }),
            Arc::new(Recorder {
                id: "audit",
                deps: vec![],
                log: log.clone(),
                veto: false,
            }),
        ])
        .unwrap();
        let err = registry.before_transaction(&intent()).await.unwrap_err();
        assert_eq!(err.code(), "LIMIT_EXCEEDED");
        assert_eq!(*log.lock().unwrap(), vec!["before:limiter"]);
    }

    #[test]
    fn missing_dependency_refuses_to_start() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = PluginRegistry::new(vec![Arc::new(Recorder {
            id: "statements",
            deps: vec!["audit"],
            log,
            veto: false,
        })])
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = PluginRegistry::new(vec![
            Arc::new(Recorder {
                id: "audit",
                deps: vec![],
                log: log.clone(),
                veto: false,
            }),
            Arc::new(Recorder {
                id: "audit",
                deps: vec![],
                log,
                veto: false,
            }),
        ])
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }
}
