//! LedgerLink orchestrator - library interface
//!
//! Drives cross-chain instructions (settlements, validator syncs, atomic
//! swaps) between EVM interop chains and Corda networks. Re-exports
//! internal modules for use in integration tests.

pub mod api;
pub mod callback;
pub mod config;
pub mod hash;
pub mod ledger;
pub mod machine;
pub mod metrics;
pub mod proof;
pub mod scheduler;
pub mod store;
pub mod testing;
pub mod types;
