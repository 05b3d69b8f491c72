//! Instruction state machines
//!
//! One machine per instruction kind. A machine's `step` looks at the
//! record's current state, does at most one unit of work (submit a
//! transaction, scan for an event, deliver callbacks) and persists at most
//! one forward transition. Sweeps re-enter `step` until the record reaches
//! a terminal state.
//!
//! Concurrency control is optimistic: before persisting, the stored state
//! is re-read and compared with the state the step started from. A record
//! changed underneath (external patch, racing sweep) is skipped, never
//! overwritten.

use eyre::{eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::callback::{notification_body, CallbackSink};
use crate::ledger::{
    DecodedEvent, DecoderRequest, LedgerConnector, LedgerError, LedgerRegistry, ProofDecoder,
};
use crate::metrics;
use crate::proof::{build_event_proof, EventProofRequest, SignerClient};
use crate::store::{Instruction, InstructionStore};
use crate::types::{
    is_transition_allowed, InstructionKind, InstructionState, LedgerKind, ProofBundle,
};

pub mod settlement;
pub mod swap;
pub mod validator;

pub use settlement::SettlementMachine;
pub use swap::SwapMachine;
pub use validator::ValidatorMachine;

/// Everything a machine step needs: storage, the configured ledgers, the
/// decoder service, callback delivery, signer fan-out and the wall-clock
/// budgets.
pub struct OrchestratorContext {
    pub store: Arc<dyn InstructionStore>,
    pub ledgers: LedgerRegistry,
    pub decoder: Arc<dyn ProofDecoder>,
    pub callbacks: Arc<dyn CallbackSink>,
    pub signers: Arc<dyn SignerClient>,
    /// Budget for each ledger-waiting state before `timedOut`.
    pub state_budget: Duration,
    /// Budget for `waitingForCommunication` before `timedOutCommunication`.
    pub communication_budget: Duration,
}

/// One state machine, driving all records of its kind.
#[async_trait::async_trait]
pub trait InstructionMachine: Send + Sync + 'static {
    fn kind(&self) -> InstructionKind;

    /// Advance one record by at most one transition. Errors returned here
    /// are unexpected faults; ledger-level failures are absorbed into the
    /// record via [`apply_ledger_result`].
    async fn step(&self, ctx: &OrchestratorContext, record: &mut Instruction) -> Result<()>;
}

/// Persist `record` moving to `to`, re-checking the stored state first.
/// Returns false when the record changed underneath this step; the caller
/// must stop working on it for this sweep.
pub async fn transition(
    ctx: &OrchestratorContext,
    record: &mut Instruction,
    to: InstructionState,
) -> Result<bool> {
    if !is_transition_allowed(record.state, to) {
        return Err(eyre!(
            "transition {} -> {} is not in the table",
            record.state,
            to
        ));
    }

    let stored = ctx
        .store
        .find_by_key(&record.key)
        .await?
        .ok_or_else(|| eyre!("record {} vanished mid-step", record.key))?;
    if stored.state != record.state {
        warn!(
            key = %record.key,
            expected = %record.state,
            actual = %stored.state,
            "record changed concurrently, skipping transition"
        );
        return Ok(false);
    }

    let from = record.state;
    record.state = to;
    ctx.store.update(record).await?;
    metrics::TRANSITIONS_TOTAL
        .with_label_values(&[record.kind.as_str(), to.as_str()])
        .inc();
    info!(key = %record.key, kind = %record.kind, %from, %to, "state transition");
    Ok(true)
}

/// Mark a record failed with the given detail, notifying callbacks on a
/// best-effort basis.
pub async fn fail(ctx: &OrchestratorContext, record: &mut Instruction, error: String) -> Result<()> {
    warn!(key = %record.key, %error, "marking record failed");
    record.error = Some(error);
    if is_transition_allowed(record.state, InstructionState::Failed) {
        transition(ctx, record, InstructionState::Failed).await?;
    } else {
        // keep the detail even where `failed` is unreachable (e.g. timedOut)
        ctx.store.update(record).await?;
    }
    notify_best_effort(ctx, record).await;
    Ok(())
}

/// Absorb a ledger operation result into the record: transient errors are
/// logged and retried next sweep, permanent ones fail the record. `None`
/// means the caller must return without further work on this record.
pub async fn apply_ledger_result<T>(
    ctx: &OrchestratorContext,
    record: &mut Instruction,
    system_id: u64,
    result: Result<T, LedgerError>,
) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_transient() => {
            metrics::LEDGER_ERRORS_TOTAL
                .with_label_values(&[&system_id.to_string(), "transient"])
                .inc();
            warn!(key = %record.key, system_id, error = %e, "transient ledger error, will retry");
            Ok(None)
        }
        Err(e) => {
            metrics::LEDGER_ERRORS_TOTAL
                .with_label_values(&[&system_id.to_string(), "failed"])
                .inc();
            fail(ctx, record, e.to_string()).await?;
            Ok(None)
        }
    }
}

/// Time out a record whose waiting-state budget is spent. Returns true when
/// the record was timed out and the step must stop.
pub async fn check_timeout(ctx: &OrchestratorContext, record: &mut Instruction) -> Result<bool> {
    if !record.budget_exceeded(ctx.state_budget) {
        return Ok(false);
    }
    record.error = Some(format!(
        "no progress in state {} within {}s",
        record.state,
        ctx.state_budget.as_secs()
    ));
    if transition(ctx, record, InstructionState::TimedOut).await? {
        notify_best_effort(ctx, record).await;
    }
    Ok(true)
}

/// Deliver `body` to every callback filter. True when every delivery
/// succeeded (vacuously true with no callback filters; blocking callers
/// poll the store instead).
pub async fn deliver_callbacks(
    ctx: &OrchestratorContext,
    record: &Instruction,
    body: &serde_json::Value,
) -> bool {
    let mut all_delivered = true;
    for (filter, url) in record.callback_filters() {
        match ctx.callbacks.deliver(url, body).await {
            Ok(()) => {
                metrics::CALLBACK_DELIVERIES_TOTAL
                    .with_label_values(&["delivered"])
                    .inc();
            }
            Err(e) => {
                metrics::CALLBACK_DELIVERIES_TOTAL
                    .with_label_values(&["failed"])
                    .inc();
                warn!(
                    key = %record.key,
                    destination = filter.remote_destination_network_id,
                    error = %e,
                    "callback delivery failed"
                );
                all_delivered = false;
            }
        }
    }
    all_delivered
}

/// Notify callbacks of the record's current state without letting delivery
/// affect the outcome.
pub async fn notify_best_effort(ctx: &OrchestratorContext, record: &Instruction) {
    let body = notification_body(record);
    deliver_callbacks(ctx, record, &body).await;
}

/// Final delivery step of the happy path: hand the result to the callbacks
/// and land on `processed`, or park in `waitingForCommunication` when any
/// delivery fails.
pub async fn finish_with_communication(
    ctx: &OrchestratorContext,
    record: &mut Instruction,
) -> Result<()> {
    let body = record
        .result
        .clone()
        .unwrap_or_else(|| notification_body(record));
    if deliver_callbacks(ctx, record, &body).await {
        transition(ctx, record, InstructionState::Processed).await?;
    } else {
        transition(ctx, record, InstructionState::WaitingForCommunication).await?;
    }
    Ok(())
}

/// Sweep behavior for `waitingForCommunication`: every sweep retries
/// delivery, including the one that crosses the budget; only a failed
/// attempt past the budget times the record out.
pub async fn communication_step(ctx: &OrchestratorContext, record: &mut Instruction) -> Result<()> {
    let body = record
        .result
        .clone()
        .unwrap_or_else(|| notification_body(record));
    if deliver_callbacks(ctx, record, &body).await {
        transition(ctx, record, InstructionState::Processed).await?;
        return Ok(());
    }
    if record.budget_exceeded(ctx.communication_budget) {
        record.error = Some(format!(
            "result could not be delivered within {}s",
            ctx.communication_budget.as_secs()
        ));
        transition(ctx, record, InstructionState::TimedOutCommunication).await?;
    }
    Ok(())
}

/// Resolve the counterparty network of a record: the originating foreign
/// system when the record arrived cross-chain, otherwise the first
/// destination filter.
pub fn counterparty_network(record: &Instruction) -> Option<u64> {
    record
        .foreign_system_id
        .or_else(|| record.destination_networks().first().copied())
}

/// Drive the cancellation sub-protocol for hold-based kinds. The caller
/// supplies the operation id the counterparty knows the trade under.
pub async fn run_cancellation(
    ctx: &OrchestratorContext,
    record: &mut Instruction,
    counter_operation_id: &str,
) -> Result<()> {
    use crate::ledger::evm::{HOLD_CANCELLED_SIG, HOLD_CREATED_SIG};

    let operation_id = record.key.operation_id.clone();
    let local = ctx.ledgers.get(record.key.system_id)?;

    match record.state {
        InstructionState::Cancel => {
            // already released on chain?
            let cancelled_query =
                crate::ledger::EventQuery::new(HOLD_CANCELLED_SIG).with_param("operationId", &operation_id);
            let cancelled = apply_ledger_result(
                ctx,
                record,
                local.system_id(),
                local.scan_events(&cancelled_query).await,
            )
            .await?;
            let Some(cancelled) = cancelled else {
                return Ok(());
            };
            if !cancelled.is_empty() {
                if transition(ctx, record, InstructionState::Cancelled).await? {
                    notify_best_effort(ctx, record).await;
                }
                return Ok(());
            }

            // a hold that was never placed needs no unwinding
            let held_query =
                crate::ledger::EventQuery::new(HOLD_CREATED_SIG).with_param("operationId", &operation_id);
            let held = apply_ledger_result(
                ctx,
                record,
                local.system_id(),
                local.scan_events(&held_query).await,
            )
            .await?;
            let Some(held) = held else {
                return Ok(());
            };
            if held.is_empty() {
                if transition(ctx, record, InstructionState::Cancelled).await? {
                    notify_best_effort(ctx, record).await;
                }
                return Ok(());
            }

            // counterparty first, then our own hold
            match counterparty_network(record) {
                Some(foreign_id) => {
                    let foreign = ctx.ledgers.get(foreign_id)?;
                    let released = apply_ledger_result(
                        ctx,
                        record,
                        foreign_id,
                        foreign.cancel_hold(counter_operation_id).await,
                    )
                    .await?;
                    if released.is_some() {
                        transition(
                            ctx,
                            record,
                            InstructionState::WaitingForForeignSystemCancellation,
                        )
                        .await?;
                    }
                }
                None => {
                    let released = apply_ledger_result(
                        ctx,
                        record,
                        local.system_id(),
                        local.cancel_hold(&operation_id).await,
                    )
                    .await?;
                    if released.is_some() {
                        transition(ctx, record, InstructionState::WaitingForCancelHoldExecuted)
                            .await?;
                    }
                }
            }
            Ok(())
        }
        InstructionState::WaitingForForeignSystemCancellation => {
            let Some(foreign_id) = counterparty_network(record) else {
                return fail(ctx, record, "no counterparty network configured".into()).await;
            };
            let foreign = ctx.ledgers.get(foreign_id)?;
            let query = crate::ledger::EventQuery::new(HOLD_CANCELLED_SIG)
                .with_param("operationId", counter_operation_id);
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
            if !events.is_empty() {
                transition(ctx, record, InstructionState::Cancelling).await?;
            }
            Ok(())
        }
        InstructionState::Cancelling => {
            let released = apply_ledger_result(
                ctx,
                record,
                local.system_id(),
                local.cancel_hold(&operation_id).await,
            )
            .await?;
            if released.is_some() {
                transition(ctx, record, InstructionState::WaitingForCancelHoldExecuted).await?;
            }
            Ok(())
        }
        InstructionState::WaitingForCancelHoldExecuted => {
            let query = crate::ledger::EventQuery::new(HOLD_CANCELLED_SIG)
                .with_param("operationId", &operation_id);
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
            if !events.is_empty() && transition(ctx, record, InstructionState::Cancelled).await? {
                notify_best_effort(ctx, record).await;
            }
            Ok(())
        }
        other => Err(eyre!("run_cancellation called in state {other}")),
    }
}

/// Build the proof bundle for an observed event: rebuilt locally from block
/// evidence for EVM sources, fetched from the decoder service for Corda.
pub async fn proof_for_event(
    ctx: &OrchestratorContext,
    source: &Arc<dyn LedgerConnector>,
    destination_system_id: u64,
    event_signature: &str,
    event: &DecodedEvent,
) -> Result<ProofBundle, LedgerError> {
    match source.kind() {
        LedgerKind::Evm => {
            let timer = metrics::PROOF_BUILD_DURATION_SECONDS.start_timer();
            let evidence = source.block_evidence(event.block_number).await?;
            let request = EventProofRequest {
                source_system_id: source.system_id(),
                destination_system_id,
                source_contract: source.contract_address(),
                event_signature: event_signature.to_string(),
                transaction_index: event.transaction_index as usize,
            };
            let bundle = build_event_proof(&request, &evidence)
                .map_err(|e| LedgerError::Failed(e.to_string()))?;
            timer.observe_duration();
            Ok(bundle)
        }
        LedgerKind::Corda => {
            let parameters = serde_json::to_value(&event.params)
                .map_err(|e| LedgerError::Configuration(format!("bad event params: {e}")))?;
            let proof = ctx
                .decoder
                .request_proof(&DecoderRequest::new(
                    source.system_id(),
                    source.contract_address(),
                    event_signature,
                    parameters,
                ))
                .await?;
            Ok(proof.into_bundle(source.system_id(), destination_system_id))
        }
    }
}
