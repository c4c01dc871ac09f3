#![allow(clippy::module_inception)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

pub mod accounts;
pub mod config;
pub mod cte;
pub mod event_store;
pub mod hold;
pub mod ledger;
pub mod mutator;
pub mod orchestrator;
pub mod outbox;
pub mod plugin;
pub mod runner;
pub mod storage;
pub mod verifier;
pub mod workers;

pub use config::{AdvancedConfig, LedgerConfig, LockMode};
pub use ledger::Ledger;
pub use summa_common as common;
