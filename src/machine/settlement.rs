//! Settlement state machine
//!
//! Drives asset delivery across a chain pair: both legs place holds under
//! operation ids derived from the same trade (account order swapped on the
//! counterparty side), the cross-chain call executes the remote hold under
//! proof, then the local hold is executed and the result delivered.

use eyre::Result;
use tracing::{debug, info, warn};

use crate::hash::derive_operation_id;
use crate::ledger::evm::{
    CROSS_CHAIN_CALL_EXECUTED_SIG, HOLD_CREATED_SIG, HOLD_EXECUTED_SIG,
};
use crate::ledger::{EventQuery, HoldRequest};
use crate::store::{
    settlement_result, Instruction, InstructionKey, InstructionPayload, SettlementPayload,
};
use crate::types::{InstructionKind, InstructionState};

use super::{
    apply_ledger_result, check_timeout, communication_step, counterparty_network, fail,
    finish_with_communication, proof_for_event, run_cancellation, transition,
    InstructionMachine, OrchestratorContext,
};

pub struct SettlementMachine;

/// The operation id the counterparty leg runs under: same trade, account
/// order swapped.
pub fn counter_operation_id(payload: &SettlementPayload) -> String {
    derive_operation_id(
        &payload.trade_id,
        &payload.to_account,
        &payload.from_account,
    )
}

#[async_trait::async_trait]
impl InstructionMachine for SettlementMachine {
    fn kind(&self) -> InstructionKind {
        InstructionKind::Settlement
    }

    async fn step(&self, ctx: &OrchestratorContext, record: &mut Instruction) -> Result<()> {
        let payload = match &record.payload {
            InstructionPayload::Settlement(p) => p.clone(),
            other => {
                return fail(
                    ctx,
                    record,
                    format!("settlement machine got {} payload", other.kind()),
                )
                .await
            }
        };
        let operation_id = record.key.operation_id.clone();

        match record.state {
            InstructionState::Confirmed => {
                let local = ctx.ledgers.get(record.key.system_id)?;
                if payload.use_existing_earmark {
                    debug!(key = %record.key, "earmark already placed by caller");
                    transition(ctx, record, InstructionState::WaitingForHold).await?;
                    return Ok(());
                }
                let request = HoldRequest {
                    operation_id: operation_id.clone(),
                    from_account: payload.from_account.clone(),
                    to_account: payload.to_account.clone(),
                    amount: payload.amount.clone(),
                };
                let placed = apply_ledger_result(
                    ctx,
                    record,
                    local.system_id(),
                    local.create_hold(&request).await,
                )
                .await?;
                if let Some(outcome) = placed {
                    info!(key = %record.key, tx_hash = %outcome.tx_hash, "hold placed");
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

                // our own hold first
                let local_query =
                    EventQuery::new(HOLD_CREATED_SIG).with_param("operationId", &operation_id);
                let local_holds = apply_ledger_result(
                    ctx,
                    record,
                    local.system_id(),
                    local.scan_events(&local_query).await,
                )
                .await?;
                let Some(local_holds) = local_holds else {
                    return Ok(());
                };
                let Some(local_hold) = local_holds.first() else {
                    return Ok(());
                };

                // then the counterparty leg, account order swapped
                let counter_op = counter_operation_id(&payload);
                let foreign_query =
                    EventQuery::new(HOLD_CREATED_SIG).with_param("operationId", &counter_op);
                let foreign_holds = apply_ledger_result(
                    ctx,
                    record,
                    foreign_id,
                    foreign.scan_events(&foreign_query).await,
                )
                .await?;
                let Some(foreign_holds) = foreign_holds else {
                    return Ok(());
                };
                if foreign_holds.is_empty() {
                    debug!(key = %record.key, counter_op, "counterparty hold not yet observed");
                    return Ok(());
                }

                // both legs held: prove our hold to the counterparty and
                // trigger the cross-chain execution there
                let proof = apply_ledger_result(
                    ctx,
                    record,
                    local.system_id(),
                    proof_for_event(ctx, &local, foreign_id, HOLD_CREATED_SIG, local_hold).await,
                )
                .await?;
                let Some(proof) = proof else {
                    return Ok(());
                };
                let submitted = apply_ledger_result(
                    ctx,
                    record,
                    foreign_id,
                    foreign.submit_remote_call(&proof).await,
                )
                .await?;
                if submitted.is_some() {
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
                let Some(event) = events.first() else {
                    return Ok(());
                };

                // evidence of the remote execution becomes the result
                let proof = apply_ledger_result(
                    ctx,
                    record,
                    foreign_id,
                    proof_for_event(
                        ctx,
                        &foreign,
                        record.key.system_id,
                        CROSS_CHAIN_CALL_EXECUTED_SIG,
                        event,
                    )
                    .await,
                )
                .await?;
                let Some(proof) = proof else {
                    return Ok(());
                };
                record.result = Some(settlement_result(&payload.trade_id, &proof));

                if payload.use_existing_earmark {
                    // nothing left to execute locally
                    finish_with_communication(ctx, record).await?;
                    return Ok(());
                }

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

                if let Some(leg) = &payload.closing_leg {
                    submit_closing_leg(ctx, record, &payload, leg).await;
                }
                finish_with_communication(ctx, record).await?;
                Ok(())
            }

            InstructionState::WaitingForCommunication => communication_step(ctx, record).await,

            InstructionState::Cancel
            | InstructionState::Cancelling
            | InstructionState::WaitingForForeignSystemCancellation
            | InstructionState::WaitingForCancelHoldExecuted => {
                let counter_op = counter_operation_id(&payload);
                run_cancellation(ctx, record, &counter_op).await
            }

            // terminal and externally-driven states have no autonomous work
            _ => Ok(()),
        }
    }
}

/// Closing leg of a paired obligation: submitted as its own instruction the
/// moment the opening leg executes. Fire-and-forget; a duplicate or store
/// fault is logged and never affects the opening leg.
async fn submit_closing_leg(
    ctx: &OrchestratorContext,
    record: &Instruction,
    payload: &SettlementPayload,
    leg: &crate::store::TradeLeg,
) {
    let closing = Instruction::new(
        InstructionKey::new(
            record.key.system_id,
            derive_operation_id(&payload.trade_id, &leg.from_account, &leg.to_account),
        ),
        InstructionPayload::Settlement(SettlementPayload {
            trade_id: payload.trade_id.clone(),
            from_account: leg.from_account.clone(),
            to_account: leg.to_account.clone(),
            amount: leg.amount.clone(),
            use_existing_earmark: false,
            closing_leg: None,
        }),
        record.foreign_system_id,
        record.filters.clone(),
    );
    match ctx.store.add(&closing).await {
        Ok(()) => info!(key = %closing.key, opening = %record.key, "closing leg submitted"),
        Err(e) => warn!(key = %closing.key, error = %e, "closing leg not submitted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CallbackFilter, InstructionStore};
    use crate::testing::{harness, FOREIGN_SYSTEM, LOCAL_SYSTEM};
    use crate::types::LedgerKind;
    use std::sync::atomic::Ordering;

    fn settlement_record(filters: Vec<CallbackFilter>) -> Instruction {
        let payload = SettlementPayload {
            trade_id: "O-101".into(),
            from_account: "Bob".into(),
            to_account: "Alice".into(),
            amount: "1".into(),
            use_existing_earmark: false,
            closing_leg: None,
        };
        Instruction::new(
            InstructionKey::new(
                LOCAL_SYSTEM,
                derive_operation_id("O-101", "Bob", "Alice"),
            ),
            InstructionPayload::Settlement(payload),
            Some(FOREIGN_SYSTEM),
            filters,
        )
    }

    async fn step(h: &crate::testing::TestHarness, record: &mut Instruction) {
        SettlementMachine.step(&h.ctx, record).await.unwrap();
    }

    fn counter_op() -> String {
        derive_operation_id("O-101", "Alice", "Bob")
    }

    #[tokio::test]
    async fn test_happy_path_reaches_processed() {
        let h = harness();
        let mut record = settlement_record(vec![]);
        h.store.add(&record).await.unwrap();

        // confirmed -> waitingForHold, hold placed on the local chain
        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::WaitingForHold);
        assert_eq!(h.local.calls_named("createHold"), 1);

        // counterparty hold not yet there: no progress
        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::WaitingForHold);

        // counterparty leg appears under the swapped-account operation id
        h.foreign
            .push_event("HoldCreated", &[("operationId", &counter_op())]);
        step(&h, &mut record).await;
        assert_eq!(
            record.state,
            InstructionState::WaitingForCrossBlockchainCallExecuted
        );
        assert_eq!(h.foreign.calls_named("performCallFromRemoteChain"), 1);

        // remote execution confirmed on the counterparty chain
        h.foreign.push_event(
            "CrossChainCallExecuted",
            &[("operationId", &record.key.operation_id)],
        );
        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::WaitingForExecuteHoldExecuted);
        assert_eq!(h.local.calls_named("executeHold"), 1);
        assert!(record.result.is_some());

        // local execution observed: done
        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::Processed);
        let result = record.result.unwrap();
        assert_eq!(result["tradeId"], "O-101");
        assert!(result["encodedInfo"].as_str().unwrap().starts_with("0x"));
    }

    #[tokio::test]
    async fn test_corda_counterparty_uses_decoder_for_result_proof() {
        let h = crate::testing::harness_with_foreign_kind(LedgerKind::Corda);
        let mut record = settlement_record(vec![]);
        h.store.add(&record).await.unwrap();

        step(&h, &mut record).await;
        h.foreign
            .push_event("HoldCreated", &[("operationId", &counter_op())]);
        step(&h, &mut record).await;
        h.foreign.push_event(
            "CrossChainCallExecuted",
            &[("operationId", &record.key.operation_id)],
        );
        step(&h, &mut record).await;

        // the result proof came from the decoder, passed through opaquely
        assert_eq!(record.state, InstructionState::WaitingForExecuteHoldExecuted);
        assert_eq!(
            record.result.as_ref().unwrap()["encodedInfo"],
            "0xdec0ded"
        );
        assert!(!h.decoder.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delayed_hold_times_out() {
        let h = harness();
        let mut record = settlement_record(vec![]);
        h.store.add(&record).await.unwrap();
        h.local.auto_emit.store(false, Ordering::SeqCst);

        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::WaitingForHold);

        // ten minutes with no hold event
        h.store
            .backdate_last_update(&record.key, chrono::Duration::minutes(10));
        let mut stale = h.store.find_by_key(&record.key).await.unwrap().unwrap();
        step(&h, &mut stale).await;
        assert_eq!(stale.state, InstructionState::TimedOut);
        assert!(stale.error.as_ref().unwrap().contains("waitingForHold"));
    }

    #[tokio::test]
    async fn test_permanent_ledger_error_fails_record() {
        let h = harness();
        let mut record = settlement_record(vec![]);
        h.store.add(&record).await.unwrap();
        h.local
            .inject_failure(crate::ledger::LedgerError::Failed("execution reverted".into()));

        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::Failed);
        assert!(record.error.as_ref().unwrap().contains("reverted"));
    }

    #[tokio::test]
    async fn test_transient_ledger_error_keeps_state() {
        let h = harness();
        let mut record = settlement_record(vec![]);
        h.store.add(&record).await.unwrap();
        h.local
            .inject_failure(crate::ledger::LedgerError::Transient("rpc timeout".into()));

        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::Confirmed);

        // next sweep succeeds
        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::WaitingForHold);
    }

    #[tokio::test]
    async fn test_failed_callback_parks_in_communication() {
        let h = harness();
        let mut record = settlement_record(vec![CallbackFilter {
            remote_destination_network_id: FOREIGN_SYSTEM,
            callback_url: Some("https://caller/cb".into()),
        }]);
        h.store.add(&record).await.unwrap();
        h.callbacks.fail_all.store(true, Ordering::SeqCst);

        step(&h, &mut record).await;
        h.foreign
            .push_event("HoldCreated", &[("operationId", &counter_op())]);
        step(&h, &mut record).await;
        h.foreign.push_event(
            "CrossChainCallExecuted",
            &[("operationId", &record.key.operation_id)],
        );
        step(&h, &mut record).await;
        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::WaitingForCommunication);

        // endpoint comes back: delivered and done
        h.callbacks.fail_all.store(false, Ordering::SeqCst);
        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::Processed);
        assert_eq!(h.callbacks.delivery_count(), 1);
    }

    #[tokio::test]
    async fn test_overdue_communication_sweep_still_attempts_delivery() {
        let h = harness();
        let mut record = settlement_record(vec![CallbackFilter {
            remote_destination_network_id: FOREIGN_SYSTEM,
            callback_url: Some("https://caller/cb".into()),
        }]);
        record.state = InstructionState::WaitingForCommunication;
        record.result = Some(serde_json::json!({ "tradeId": "O-101" }));
        h.store.add(&record).await.unwrap();
        h.store
            .backdate_last_update(&record.key, chrono::Duration::minutes(10));

        // budget long spent, but the endpoint is healthy again: delivered
        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::Processed);
        assert_eq!(h.callbacks.delivery_count(), 1);
    }

    #[tokio::test]
    async fn test_undeliverable_result_times_out_after_budget() {
        let h = harness();
        let mut record = settlement_record(vec![CallbackFilter {
            remote_destination_network_id: FOREIGN_SYSTEM,
            callback_url: Some("https://caller/cb".into()),
        }]);
        record.state = InstructionState::WaitingForCommunication;
        h.store.add(&record).await.unwrap();
        h.store
            .backdate_last_update(&record.key, chrono::Duration::minutes(10));
        let mut record = h.store.find_by_key(&record.key).await.unwrap().unwrap();
        h.callbacks.fail_all.store(true, Ordering::SeqCst);

        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::TimedOutCommunication);
        assert!(record.error.unwrap().contains("delivered"));
    }

    #[tokio::test]
    async fn test_cancellation_unwinds_both_holds() {
        let h = harness();
        let mut record = settlement_record(vec![]);
        h.store.add(&record).await.unwrap();

        // place the local hold, then an external cancel arrives
        step(&h, &mut record).await;
        record.state = InstructionState::Cancel;
        h.store.update(&record).await.unwrap();

        // counterparty asked to release first
        step(&h, &mut record).await;
        assert_eq!(
            record.state,
            InstructionState::WaitingForForeignSystemCancellation
        );
        assert_eq!(h.foreign.calls_named("cancelHold"), 1);

        // counterparty released (mock auto-emitted HoldCancelled): our turn
        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::Cancelling);
        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::WaitingForCancelHoldExecuted);
        assert_eq!(h.local.calls_named("cancelHold"), 1);

        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_without_hold_goes_straight_to_cancelled() {
        let h = harness();
        let mut record = settlement_record(vec![]);
        h.store.add(&record).await.unwrap();

        record.state = InstructionState::Cancel;
        h.store.update(&record).await.unwrap();
        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::Cancelled);
        assert_eq!(h.foreign.calls_named("cancelHold"), 0);
    }

    #[tokio::test]
    async fn test_closing_leg_submitted_on_execution() {
        let h = harness();
        let mut record = settlement_record(vec![]);
        if let InstructionPayload::Settlement(p) = &mut record.payload {
            p.closing_leg = Some(crate::store::TradeLeg {
                from_account: "Alice".into(),
                to_account: "Bob".into(),
                amount: "1".into(),
            });
        }
        h.store.add(&record).await.unwrap();

        step(&h, &mut record).await;
        h.foreign
            .push_event("HoldCreated", &[("operationId", &counter_op())]);
        step(&h, &mut record).await;
        h.foreign.push_event(
            "CrossChainCallExecuted",
            &[("operationId", &record.key.operation_id)],
        );
        step(&h, &mut record).await;
        step(&h, &mut record).await;
        assert_eq!(record.state, InstructionState::Processed);

        let closing_key = InstructionKey::new(
            LOCAL_SYSTEM,
            derive_operation_id("O-101", "Alice", "Bob"),
        );
        let closing = h.store.find_by_key(&closing_key).await.unwrap().unwrap();
        assert_eq!(closing.state, InstructionState::Confirmed);
    }
}
