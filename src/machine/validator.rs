//! Validator sync state machines
//!
//! Two kinds share one machine body: `validatorSet` pushes a full
//! replacement set to every destination filter, `validatorUpdate` reads the
//! current set from the source ledger, merges additions and removals, and
//! pushes the merged set. Neither kind has a hold phase; confirmed records
//! go straight to waiting for the cross-chain update to land.

use eyre::{eyre, Result};
use tracing::debug;

use crate::ledger::evm::VALIDATOR_SET_UPDATED_SIG;
use crate::ledger::EventQuery;
use crate::store::{Instruction, InstructionPayload};
use crate::types::{InstructionKind, InstructionState};

use super::{
    apply_ledger_result, check_timeout, communication_step, fail, finish_with_communication,
    notify_best_effort, transition, InstructionMachine, OrchestratorContext,
};

pub struct ValidatorMachine {
    kind: InstructionKind,
}

impl ValidatorMachine {
    pub fn set() -> Self {
        Self {
            kind: InstructionKind::ValidatorSet,
        }
    }

    pub fn update() -> Self {
        Self {
            kind: InstructionKind::ValidatorUpdate,
        }
    }

    /// The set to push: the payload as-is for a replacement, the merged
    /// current set for an incremental update.
    async fn target_validators(
        &self,
        ctx: &OrchestratorContext,
        record: &mut Instruction,
    ) -> Result<Option<Vec<String>>> {
        match &record.payload {
            InstructionPayload::ValidatorSet(p) => Ok(Some(p.validators.clone())),
            InstructionPayload::ValidatorUpdate(p) => {
                let additions = p.additions.clone();
                let removals = p.removals.clone();
                let local = ctx.ledgers.get(record.key.system_id)?;
                let current = apply_ledger_result(
                    ctx,
                    record,
                    local.system_id(),
                    local.read_validators().await,
                )
                .await?;
                let Some(current) = current else {
                    return Ok(None);
                };
                Ok(Some(merge_validators(&current, &additions, &removals)))
            }
            other => Err(eyre!(
                "validator machine got {} payload",
                other.kind()
            )),
        }
    }
}

/// Merge an incremental update into the current set: keep order, append new
/// additions, drop removals. Comparison is case-insensitive because EVM
/// addresses arrive in mixed checksum casings.
pub fn merge_validators(current: &[String], additions: &[String], removals: &[String]) -> Vec<String> {
    let removed = |v: &str| removals.iter().any(|r| r.eq_ignore_ascii_case(v));
    let mut merged: Vec<String> = current
        .iter()
        .filter(|v| !removed(v))
        .cloned()
        .collect();
    for addition in additions {
        let present = merged.iter().any(|v| v.eq_ignore_ascii_case(addition));
        if !present && !removed(addition) {
            merged.push(addition.clone());
        }
    }
    merged
}

#[async_trait::async_trait]
impl InstructionMachine for ValidatorMachine {
    fn kind(&self) -> InstructionKind {
        self.kind
    }

    async fn step(&self, ctx: &OrchestratorContext, record: &mut Instruction) -> Result<()> {
        match record.state {
            InstructionState::Confirmed => {
                let Some(validators) = self.target_validators(ctx, record).await? else {
                    return Ok(());
                };
                if validators.is_empty() {
                    return fail(ctx, record, "validator set would become empty".into()).await;
                }
                let destinations = record.destination_networks();
                if destinations.is_empty() {
                    return fail(ctx, record, "no destination networks configured".into()).await;
                }

                for destination in &destinations {
                    let connector = ctx.ledgers.get(*destination)?;
                    let pushed = apply_ledger_result(
                        ctx,
                        record,
                        *destination,
                        connector.update_validators(&validators).await,
                    )
                    .await?;
                    if pushed.is_none() {
                        return Ok(());
                    }
                    debug!(key = %record.key, destination, "validator set pushed");
                }

                record.result = Some(serde_json::json!({
                    "validators": validators,
                    "destinations": destinations,
                }));
                transition(
                    ctx,
                    record,
                    InstructionState::WaitingForCrossBlockchainCallExecuted,
                )
                .await?;
                Ok(())
            }

            InstructionState::WaitingForCrossBlockchainCallExecuted => {
                if check_timeout(ctx, record).await? {
                    return Ok(());
                }
                let result = record
                    .result
                    .clone()
                    .ok_or_else(|| eyre!("validator record {} lost its result", record.key))?;
                let expected_count = result["validators"]
                    .as_array()
                    .map(|v| v.len())
                    .unwrap_or_default();

                for destination in record.destination_networks() {
                    let connector = ctx.ledgers.get(destination)?;
                    let query = EventQuery::new(VALIDATOR_SET_UPDATED_SIG)
                        .with_param("validatorCount", expected_count.to_string());
                    let events = apply_ledger_result(
                        ctx,
                        record,
                        destination,
                        connector.scan_events(&query).await,
                    )
                    .await?;
                    let Some(events) = events else {
                        return Ok(());
                    };
                    if events.is_empty() {
                        debug!(key = %record.key, destination, "update not yet visible");
                        return Ok(());
                    }
                }
                finish_with_communication(ctx, record).await?;
                Ok(())
            }

            InstructionState::WaitingForCommunication => communication_step(ctx, record).await,

            // there is no hold to unwind for validator kinds
            InstructionState::Cancel
            | InstructionState::Cancelling
            | InstructionState::WaitingForForeignSystemCancellation
            | InstructionState::WaitingForCancelHoldExecuted => {
                if transition(ctx, record, InstructionState::Cancelled).await? {
                    notify_best_effort(ctx, record).await;
                }
                Ok(())
            }

            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        CallbackFilter, InstructionKey, InstructionStore, ValidatorSetPayload,
        ValidatorUpdatePayload,
    };
    use crate::testing::{harness, FOREIGN_SYSTEM, LOCAL_SYSTEM};

    fn set_record(validators: Vec<&str>) -> Instruction {
        Instruction::new(
            InstructionKey::new(LOCAL_SYSTEM, "0xv1"),
            InstructionPayload::ValidatorSet(ValidatorSetPayload {
                validators: validators.into_iter().map(String::from).collect(),
            }),
            None,
            vec![CallbackFilter {
                remote_destination_network_id: FOREIGN_SYSTEM,
                callback_url: None,
            }],
        )
    }

    fn update_record(additions: Vec<&str>, removals: Vec<&str>) -> Instruction {
        Instruction::new(
            InstructionKey::new(LOCAL_SYSTEM, "0xv2"),
            InstructionPayload::ValidatorUpdate(ValidatorUpdatePayload {
                additions: additions.into_iter().map(String::from).collect(),
                removals: removals.into_iter().map(String::from).collect(),
            }),
            None,
            vec![CallbackFilter {
                remote_destination_network_id: FOREIGN_SYSTEM,
                callback_url: None,
            }],
        )
    }

    #[test]
    fn test_merge_validators() {
        let current = vec!["0xAA".to_string(), "0xBB".to_string()];
        let merged = merge_validators(
            &current,
            &["0xCC".to_string(), "0xaa".to_string()],
            &["0xbb".to_string()],
        );
        assert_eq!(merged, vec!["0xAA", "0xCC"]);
    }

    #[tokio::test]
    async fn test_full_replacement_reaches_processed() {
        let h = harness();
        let mut record = set_record(vec!["0x01", "0x02"]);
        h.store.add(&record).await.unwrap();

        ValidatorMachine::set().step(&h.ctx, &mut record).await.unwrap();
        assert_eq!(
            record.state,
            InstructionState::WaitingForCrossBlockchainCallExecuted
        );
        assert_eq!(
            *h.foreign.validators.lock().unwrap(),
            vec!["0x01", "0x02"]
        );

        // the mock emitted ValidatorSetUpdated on push
        ValidatorMachine::set().step(&h.ctx, &mut record).await.unwrap();
        assert_eq!(record.state, InstructionState::Processed);
        assert_eq!(record.result.unwrap()["destinations"][0], FOREIGN_SYSTEM);
    }

    #[tokio::test]
    async fn test_incremental_update_merges_source_set() {
        let h = harness();
        *h.local.validators.lock().unwrap() = vec!["0x01".into(), "0x02".into()];
        let mut record = update_record(vec!["0x03"], vec!["0x01"]);
        h.store.add(&record).await.unwrap();

        ValidatorMachine::update()
            .step(&h.ctx, &mut record)
            .await
            .unwrap();
        assert_eq!(
            *h.foreign.validators.lock().unwrap(),
            vec!["0x02", "0x03"]
        );
    }

    #[tokio::test]
    async fn test_empty_result_set_is_rejected() {
        let h = harness();
        *h.local.validators.lock().unwrap() = vec!["0x01".into()];
        let mut record = update_record(vec![], vec!["0x01"]);
        h.store.add(&record).await.unwrap();

        ValidatorMachine::update()
            .step(&h.ctx, &mut record)
            .await
            .unwrap();
        assert_eq!(record.state, InstructionState::Failed);
        assert!(record.error.unwrap().contains("empty"));
    }

    #[tokio::test]
    async fn test_cancelled_validator_record_settles_immediately() {
        let h = harness();
        let mut record = set_record(vec!["0x01"]);
        record.state = InstructionState::Cancel;
        h.store.add(&record).await.unwrap();

        ValidatorMachine::set().step(&h.ctx, &mut record).await.unwrap();
        assert_eq!(record.state, InstructionState::Cancelled);

        // nothing was pushed and no holds were touched
        assert!(h.foreign.validators.lock().unwrap().is_empty());
        assert_eq!(h.local.calls_named("cancelHold"), 0);
    }

    #[tokio::test]
    async fn test_unconfirmed_destination_blocks_completion() {
        let h = harness();
        let mut record = set_record(vec!["0x01"]);
        h.store.add(&record).await.unwrap();

        h.foreign
            .auto_emit
            .store(false, std::sync::atomic::Ordering::SeqCst);
        ValidatorMachine::set().step(&h.ctx, &mut record).await.unwrap();
        assert_eq!(
            record.state,
            InstructionState::WaitingForCrossBlockchainCallExecuted
        );

        // no ValidatorSetUpdated event yet: stays put
        ValidatorMachine::set().step(&h.ctx, &mut record).await.unwrap();
        assert_eq!(
            record.state,
            InstructionState::WaitingForCrossBlockchainCallExecuted
        );

        h.foreign
            .push_event("ValidatorSetUpdated", &[("validatorCount", "1")]);
        ValidatorMachine::set().step(&h.ctx, &mut record).await.unwrap();
        assert_eq!(record.state, InstructionState::Processed);
    }
}
