//! In-memory instruction store
//!
//! Same contract as the Postgres store, backed by a mutex-guarded map.
//! Used by the test suite and for local single-process runs without a
//! database.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{Instruction, InstructionKey, InstructionStore, StoreError};
use crate::types::{InstructionKind, InstructionState};

#[derive(Default)]
pub struct MemoryInstructionStore {
    records: Mutex<HashMap<(u64, String), Instruction>>,
}

impl MemoryInstructionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map_key(key: &InstructionKey) -> (u64, String) {
        (key.system_id, key.operation_id.clone())
    }

    /// Shift a record's `last_update` into the past. Test hook for
    /// exercising wall-clock timeout transitions without sleeping.
    pub fn backdate_last_update(&self, key: &InstructionKey, by: chrono::Duration) {
        let mut records = self.records.lock().expect("store mutex poisoned");
        if let Some(record) = records.get_mut(&Self::map_key(key)) {
            record.last_update -= by;
            record.created_at -= by;
        }
    }
}

#[async_trait]
impl InstructionStore for MemoryInstructionStore {
    async fn add(&self, record: &Instruction) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("store mutex poisoned");
        let key = Self::map_key(&record.key);
        if records.contains_key(&key) {
            return Err(StoreError::Duplicate(record.key.to_string()));
        }
        records.insert(key, record.clone());
        Ok(())
    }

    async fn update(&self, record: &Instruction) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("store mutex poisoned");
        let key = Self::map_key(&record.key);
        let existing = records
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(record.key.to_string()))?;

        let mut updated = record.clone();
        // last_update is monotonically non-decreasing
        updated.last_update = Utc::now().max(existing.last_update);
        records.insert(key, updated);
        Ok(())
    }

    async fn remove(&self, key: &InstructionKey) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("store mutex poisoned");
        let map_key = Self::map_key(key);
        let existing = records
            .get(&map_key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if !existing.state.is_deletable() {
            return Err(StoreError::DeleteNotAllowed(existing.state));
        }
        records.remove(&map_key);
        Ok(())
    }

    async fn find_by_key(&self, key: &InstructionKey) -> Result<Option<Instruction>, StoreError> {
        let records = self.records.lock().expect("store mutex poisoned");
        Ok(records.get(&Self::map_key(key)).cloned())
    }

    async fn find_by_state(
        &self,
        kind: InstructionKind,
        state: InstructionState,
    ) -> Result<Vec<Instruction>, StoreError> {
        let records = self.records.lock().expect("store mutex poisoned");
        let mut found: Vec<Instruction> = records
            .values()
            .filter(|r| r.kind == kind && r.state == state)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn find_all_to_process(
        &self,
        kind: InstructionKind,
    ) -> Result<Vec<Instruction>, StoreError> {
        let records = self.records.lock().expect("store mutex poisoned");
        let mut found: Vec<Instruction> = records
            .values()
            .filter(|r| r.kind == kind && !r.state.is_terminal())
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }
}
