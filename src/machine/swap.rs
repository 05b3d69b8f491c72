//! Atomic swap state machine
//!
//! Maps commit/claim/revert onto the shared record shape: a commit is a
//! hold on each chain, the claim is a cross-chain execution authorized by a
//! k-of-n threshold attestation from the designated signers, and a revert
//! runs the cancellation branch (also quorum-gated).

use eyre::Result;
use tracing::{debug, info};

use crate::hash::derive_operation_id;
use crate::ledger::evm::{
    CROSS_CHAIN_CALL_EXECUTED_SIG, HOLD_CREATED_SIG, HOLD_EXECUTED_SIG,
};
use crate::ledger::{EventQuery, HoldRequest, LedgerError};
use crate::proof::{collect_signatures, ProofError, ThresholdAttestation};
use crate::store::{Instruction, InstructionPayload, SwapPayload};
use crate::types::{InstructionKind, InstructionState, ProofBundle};

use super::{
    apply_ledger_result, check_timeout, communication_step, counterparty_network, fail,
    finish_with_communication, run_cancellation, transition, InstructionMachine,
    OrchestratorContext,
};

pub struct SwapMachine;

/// The counterparty commit runs under the swapped-account operation id.
pub fn counter_operation_id(payload: &SwapPayload) -> String {
    derive_operation_id(
        &payload.trade_id,
        &payload.receiver_account,
        &payload.sender_account,
    )
}

/// Gather the threshold attestation over `message`. Signer outages are
/// transient: the record stays put and the next sweep tries again.
async fn attestation_for(
    ctx: &OrchestratorContext,
    payload: &SwapPayload,
    message: &str,
) -> Result<ThresholdAttestation, LedgerError> {
    collect_signatures(
        ctx.signers.as_ref(),
        &payload.signers,
        payload.signatures_threshold,
        message,
    )
    .await
    .map_err(|e| match e {
        ProofError::QuorumNotReached { .. } => LedgerError::Transient(e.to_string()),
        other => LedgerError::Failed(other.to_string()),
    })
}

fn claim_bundle(
    record: &Instruction,
    foreign_id: u64,
    attestation: &ThresholdAttestation,
) -> Result<ProofBundle> {
    Ok(ProofBundle {
        source_system_id: record.key.system_id,
        destination_system_id: foreign_id,
        encoded_info: record.key.operation_id.clone(),
        signature_or_proof: format!("0x{}", hex::encode(serde_json::to_vec(attestation)?)),
    })
}

#[async_trait::async_trait]
impl InstructionMachine for SwapMachine {
    fn kind(&self) -> InstructionKind {
        InstructionKind::Swap
    }

    async fn step(&self, ctx: &OrchestratorContext, record: &mut Instruction) -> Result<()> {
        let payload = match &record.payload {
            InstructionPayload::Swap(p) => p.clone(),
            other => {
                return fail(
                    ctx,
                    record,
                    format!("swap machine got {} payload", other.kind()),
                )
                .await
            }
        };
        let operation_id = record.key.operation_id.clone();

        match record.state {
            InstructionState::Confirmed => {
                // the commit is a hold under the swap's operation id
                let local = ctx.ledgers.get(record.key.system_id)?;
                let request = HoldRequest {
                    operation_id: operation_id.clone(),
                    from_account: payload.sender_account.clone(),
                    to_account: payload.receiver_account.clone(),
                    amount: payload.amount.clone(),
                };
                let committed = apply_ledger_result(
                    ctx,
                    record,
                    local.system_id(),
                    local.create_hold(&request).await,
                )
                .await?;
                if let Some(outcome) = committed {
                    info!(key = %record.key, tx_hash = %outcome.tx_hash, "swap commit placed");
                    transition(ctx, record, InstructionState::WaitingForHold).await?;
                }
                Ok(())
            }

            InstructionState::WaitingForHold => {
                if check_timeout(ctx, record).await? {
                    return Ok(());
                }
                let local = ctx.ledgers.get(record.key.system_id)?;
                let Some(foreign_id) = counterparty_network(record) else {
                    return fail(ctx, record, "no counterparty network configured".into()).await;
                };
                let foreign = ctx.ledgers.get(foreign_id)?;

                let local_query =
                    EventQuery::new(HOLD_CREATED_SIG).with_param("operationId", &operation_id);
                let local_commits = apply_ledger_result(
                    ctx,
                    record,
                    local.system_id(),
                    local.scan_events(&local_query).await,
                )
                .await?;
                let Some(local_commits) = local_commits else {
                    return Ok(());
                };
                if local_commits.is_empty() {
                    return Ok(());
                }

                let counter_op = counter_operation_id(&payload);
                let foreign_query =
                    EventQuery::new(HOLD_CREATED_SIG).with_param("operationId", &counter_op);
                let foreign_commits = apply_ledger_result(
                    ctx,
                    record,
                    foreign_id,
                    foreign.scan_events(&foreign_query).await,
                )
                .await?;
                let Some(foreign_commits) = foreign_commits else {
                    return Ok(());
                };
                if foreign_commits.is_empty() {
                    debug!(key = %record.key, counter_op, "counterparty commit not yet observed");
                    return Ok(());
                }

                // both commits in place: claim under threshold attestation
                let attestation = apply_ledger_result(
                    ctx,
                    record,
                    record.key.system_id,
                    attestation_for(ctx, &payload, &operation_id).await,
                )
                .await?;
                let Some(attestation) = attestation else {
                    return Ok(());
                };
                record.result = Some(serde_json::json!({
                    "tradeId": payload.trade_id,
                    "operationId": operation_id,
                    "attestation": attestation,
                }));

                let bundle = claim_bundle(record, foreign_id, &attestation)?;
                let submitted = apply_ledger_result(
                    ctx,
                    record,
                    foreign_id,
                    foreign.submit_remote_call(&bundle).await,
                )
                .await?;
                if submitted.is_some() {
                    info!(
                        key = %record.key,
                        signatures = attestation.signatures.len(),
                        "swap claim submitted"
                    );
                    transition(
                        ctx,
                        record,
                        InstructionState::WaitingForCrossBlockchainCallExecuted,
                    )
                    .await?;
                }
                Ok(())
            }

            InstructionState::WaitingForCrossBlockchainCallExecuted => {
                if check_timeout(ctx, record).await? {
                    return Ok(());
                }
                let Some(foreign_id) = counterparty_network(record) else {
                    return fail(ctx, record, "no counterparty network configured".into()).await;
                };
                let foreign = ctx.ledgers.get(foreign_id)?;
                let query = EventQuery::new(CROSS_CHAIN_CALL_EXECUTED_SIG)
                    .with_param("operationId", &operation_id);
                let events = apply_ledger_result(
                    ctx,
                    record,
                    foreign_id,
                    foreign.scan_events(&query).await,
                )
                .await?;
                let Some(events) = events else {
                    return Ok(());
                };
                if events.is_empty() {
                    return Ok(());
                }

                // their side claimed: execute our own commit
                let local = ctx.ledgers.get(record.key.system_id)?;
                let executed = apply_ledger_result(
                    ctx,
                    record,
                    local.system_id(),
                    local.execute_hold(&operation_id).await,
                )
                .await?;
                if executed.is_some() {
                    transition(ctx, record, InstructionState::WaitingForExecuteHoldExecuted)
                        .await?;
                }
                Ok(())
            }

            InstructionState::WaitingForExecuteHoldExecuted => {
                if check_timeout(ctx, record).await? {
                    return Ok(());
                }
                let local = ctx.ledgers.get(record.key.system_id)?;
                let query =
                    EventQuery::new(HOLD_EXECUTED_SIG).with_param("operationId", &operation_id);
                let events = apply_ledger_result(
                    ctx,
                    record,
                    local.system_id(),
                    local.scan_events(&query).await,
                )
                .await?;
                let Some(events) = events else {
                    return Ok(());
                };
                if events.is_empty() {
                    return Ok(());
                }
                finish_with_communication(ctx, record).await?;
                Ok(())
            }

            InstructionState::WaitingForCommunication => communication_step(ctx, record).await,

            InstructionState::Cancel => {
                // a revert needs the same quorum a claim does
                let revert_message = format!("revert:{operation_id}");
                let attestation = apply_ledger_result(
                    ctx,
                    record,
                    record.key.system_id,
                    attestation_for(ctx, &payload, &revert_message).await,
                )
                .await?;
                let Some(attestation) = attestation else {
                    return Ok(());
                };
                record.result = Some(serde_json::json!({
                    "tradeId": payload.trade_id,
                    "operationId": operation_id,
                    "revertAttestation": attestation,
                }));
                run_cancellation(ctx, record, &counter_operation_id(&payload)).await
            }

            InstructionState::Cancelling
            | InstructionState::WaitingForForeignSystemCancellation
            | InstructionState::WaitingForCancelHoldExecuted => {
                run_cancellation(ctx, record, &counter_operation_id(&payload)).await
            }

            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InstructionKey, InstructionStore};
    use crate::testing::{harness, FOREIGN_SYSTEM, LOCAL_SYSTEM};

    fn swap_record(threshold: u32, signers: usize) -> Instruction {
        let payload = SwapPayload {
            trade_id: "S-7".into(),
            sender_account: "Bob".into(),
            receiver_account: "Alice".into(),
            amount: "25".into(),
            signers: (0..signers)
                .map(|i| format!("http://signer-{i}/sign"))
                .collect(),
            signatures_threshold: threshold,
        };
        Instruction::new(
            InstructionKey::new(
                LOCAL_SYSTEM,
                derive_operation_id("S-7", "Bob", "Alice"),
            ),
            InstructionPayload::Swap(payload),
            Some(FOREIGN_SYSTEM),
            vec![],
        )
    }

    fn counter_op() -> String {
        derive_operation_id("S-7", "Alice", "Bob")
    }

    async fn step(h: &crate::testing::TestHarness, record: &mut Instruction) {
        SwapMachine.step(&h.ctx, record).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_claim_reaches_processed() {
        let h = harness();
        let mut record = swap_record(2, 3);
        h.store.add(&record).await.unwrap();

        // commit placed locally
        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::WaitingForHold);
        assert_eq!(h.local.calls_named("createHold"), 1);

        // counterparty commit appears: claim goes out under quorum
        h.foreign
            .push_event("HoldCreated", &[("operationId", &counter_op())]);
        step(&h, &mut record).await;
        assert_eq!(
            record.state,
            InstructionState::WaitingForCrossBlockchainCallExecuted
        );
        assert_eq!(h.foreign.calls_named("performCallFromRemoteChain"), 1);
        let attestation = &record.result.as_ref().unwrap()["attestation"];
        assert_eq!(attestation["signatures"].as_array().unwrap().len(), 3);

        // their claim executed: execute ours
        h.foreign.push_event(
            "CrossChainCallExecuted",
            &[("operationId", &record.key.operation_id)],
        );
        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::WaitingForExecuteHoldExecuted);

        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::Processed);
    }

    #[tokio::test]
    async fn test_unreachable_quorum_is_retried_not_failed() {
        let h = harness();
        // threshold higher than the number of signers can ever satisfy
        let mut record = swap_record(5, 2);
        h.store.add(&record).await.unwrap();

        step(&h, &mut record).await;
        h.foreign
            .push_event("HoldCreated", &[("operationId", &counter_op())]);
        step(&h, &mut record).await;

        // no claim went out, record still waiting
        assert_eq!(record.state, InstructionState::WaitingForHold);
        assert_eq!(h.foreign.calls_named("performCallFromRemoteChain"), 0);
    }

    #[tokio::test]
    async fn test_revert_collects_quorum_then_unwinds() {
        let h = harness();
        let mut record = swap_record(2, 3);
        h.store.add(&record).await.unwrap();

        step(&h, &mut record).await;
        record.state = InstructionState::Cancel;
        h.store.update(&record).await.unwrap();

        step(&h, &mut record).await;
        assert_eq!(
            record.state,
            InstructionState::WaitingForForeignSystemCancellation
        );
        assert!(record.result.as_ref().unwrap()["revertAttestation"]["signatures"].is_array());

        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::Cancelling);
        step(&h, &mut record).await;
        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::Cancelled);
    }
}
