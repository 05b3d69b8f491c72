//! Durable instruction storage
//!
//! The orchestrator relies on exactly two storage guarantees for
//! correctness: duplicate-key rejection on `add` (no double-creation across
//! racing submits) and point lookups fresh enough for the optimistic
//! state-check-before-commit inside transitions. Everything else is plain
//! keyed record storage.

use async_trait::async_trait;

use crate::types::{InstructionKind, InstructionState};

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryInstructionStore;
pub use models::*;
pub use postgres::{create_pool, run_migrations, PgInstructionStore};

/// Validation and persistence failures at the store boundary. The first
/// four are rejected synchronously at the API; `Database` wraps backend
/// faults.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("instruction {0} already exists")]
    Duplicate(String),
    #[error("instruction {0} not found")]
    NotFound(String),
    #[error("transition {from} -> {to} is not allowed")]
    TransitionNotAllowed {
        from: InstructionState,
        to: InstructionState,
    },
    #[error("cannot delete instruction in state {0}")]
    DeleteNotAllowed(InstructionState),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Keyed record storage with duplicate detection and "records needing work"
/// scans. One implementation over Postgres for production, one in memory
/// for tests and local runs.
#[async_trait]
pub trait InstructionStore: Send + Sync + 'static {
    /// Insert a new record. Fails with `Duplicate` if the composite key is
    /// already present; never overwrites.
    async fn add(&self, record: &Instruction) -> Result<(), StoreError>;

    /// Persist a mutated record, refreshing `last_update`. Fails with
    /// `NotFound` if the key is absent.
    async fn update(&self, record: &Instruction) -> Result<(), StoreError>;

    /// Delete a record. Fails with `NotFound` if absent and with
    /// `DeleteNotAllowed` unless the current state is in the deletable
    /// whitelist.
    async fn remove(&self, key: &InstructionKey) -> Result<(), StoreError>;

    async fn find_by_key(&self, key: &InstructionKey) -> Result<Option<Instruction>, StoreError>;

    async fn find_by_state(
        &self,
        kind: InstructionKind,
        state: InstructionState,
    ) -> Result<Vec<Instruction>, StoreError>;

    /// All records of the kind in any non-terminal state, oldest first.
    async fn find_all_to_process(
        &self,
        kind: InstructionKind,
    ) -> Result<Vec<Instruction>, StoreError>;
}
