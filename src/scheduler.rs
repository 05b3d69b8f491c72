//! Per-kind polling scheduler
//!
//! One scheduler task per instruction kind. Each iteration drains the
//! external update inbox first, then sweeps every non-terminal record of
//! its kind through the kind's state machine, stepping records
//! concurrently. Shutdown is cooperative via a watch flag; `stop` flips it
//! and awaits the task.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::machine::{transition, InstructionMachine, OrchestratorContext};
use crate::metrics;
use crate::store::{Instruction, InstructionKey};
use crate::types::{is_transition_allowed, InstructionState};

const INBOX_CAPACITY: usize = 256;
/// Liveness log line once per this many sweep cycles.
const HEARTBEAT_EVERY: u64 = 60;

/// Externally requested state change, queued by the patch endpoint after
/// its own validation and re-validated here against the current record.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub key: InstructionKey,
    pub requested_state: InstructionState,
}

/// Running scheduler task for one kind.
pub struct SchedulerHandle {
    inbox: mpsc::Sender<UpdateRequest>,
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl SchedulerHandle {
    /// Queue an external update. Fails when the inbox is full or the
    /// scheduler has stopped.
    pub fn queue_update(&self, request: UpdateRequest) -> Result<()> {
        self.inbox
            .try_send(request)
            .map_err(|e| eyre::eyre!("update inbox unavailable: {e}"))
    }

    /// Sender half of the inbox, for the patch endpoint.
    pub fn update_sender(&self) -> mpsc::Sender<UpdateRequest> {
        self.inbox.clone()
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "scheduler task panicked");
        }
    }
}

/// Spawn the polling loop for `machine`'s kind.
pub fn spawn(
    ctx: Arc<OrchestratorContext>,
    machine: Arc<dyn InstructionMachine>,
    poll_interval: Duration,
) -> SchedulerHandle {
    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run(ctx, machine, poll_interval, inbox_rx, stop_rx));
    SchedulerHandle {
        inbox: inbox_tx,
        stop: stop_tx,
        task,
    }
}

async fn run(
    ctx: Arc<OrchestratorContext>,
    machine: Arc<dyn InstructionMachine>,
    poll_interval: Duration,
    mut inbox: mpsc::Receiver<UpdateRequest>,
    mut stop: watch::Receiver<bool>,
) {
    let kind = machine.kind();
    info!(%kind, interval_ms = poll_interval.as_millis() as u64, "scheduler started");
    let mut cycles: u64 = 0;

    loop {
        while let Ok(request) = inbox.try_recv() {
            if let Err(e) = apply_update(&ctx, &request).await {
                error!(%kind, key = %request.key, error = %e, "update request errored");
            }
        }

        if let Err(e) = sweep(&ctx, machine.as_ref()).await {
            error!(%kind, error = %e, "sweep failed");
        }
        cycles += 1;
        if cycles % HEARTBEAT_EVERY == 0 {
            info!(%kind, cycles, "scheduler heartbeat");
        }

        tokio::select! {
            changed = stop.changed() => {
                // a dropped handle counts as a stop request
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(poll_interval) => {}
            // wake early for a queued update instead of waiting out the tick
            request = inbox.recv() => {
                if let Some(request) = request {
                    if let Err(e) = apply_update(&ctx, &request).await {
                        error!(%kind, key = %request.key, error = %e, "update request errored");
                    }
                }
            }
        }
    }
    info!(%kind, "scheduler stopped");
}

/// Validate and persist an external state change against the record as it
/// is now, not as it was when the request was queued.
async fn apply_update(ctx: &OrchestratorContext, request: &UpdateRequest) -> Result<()> {
    let Some(mut record) = ctx.store.find_by_key(&request.key).await? else {
        metrics::UPDATE_REQUESTS_TOTAL
            .with_label_values(&["rejected"])
            .inc();
        warn!(key = %request.key, "update request for unknown record");
        return Ok(());
    };

    if !is_transition_allowed(record.state, request.requested_state) {
        metrics::UPDATE_REQUESTS_TOTAL
            .with_label_values(&["rejected"])
            .inc();
        warn!(
            key = %record.key,
            from = %record.state,
            to = %request.requested_state,
            "update request not in the transition table"
        );
        return Ok(());
    }

    // cancellation needs a counterparty to unwind against
    if request.requested_state == InstructionState::Cancel && record.foreign_system_id.is_none() {
        metrics::UPDATE_REQUESTS_TOTAL
            .with_label_values(&["rejected"])
            .inc();
        warn!(key = %record.key, "cancel requested for a record with no foreign system");
        return Ok(());
    }

    // a retry wipes the previous failure detail
    if request.requested_state == InstructionState::WaitingForHold {
        record.error = None;
    }
    if transition(ctx, &mut record, request.requested_state).await? {
        metrics::UPDATE_REQUESTS_TOTAL
            .with_label_values(&["applied"])
            .inc();
    } else {
        metrics::UPDATE_REQUESTS_TOTAL
            .with_label_values(&["rejected"])
            .inc();
    }
    Ok(())
}

/// Step every non-terminal record of the machine's kind once, concurrently.
pub async fn sweep(ctx: &OrchestratorContext, machine: &dyn InstructionMachine) -> Result<()> {
    let kind = machine.kind();
    let records = ctx.store.find_all_to_process(kind).await?;
    metrics::RECORDS_IN_FLIGHT
        .with_label_values(&[kind.as_str()])
        .set(records.len() as i64);
    if records.is_empty() {
        return Ok(());
    }
    debug!(%kind, records = records.len(), "sweeping");

    let timer = metrics::SWEEP_DURATION_SECONDS
        .with_label_values(&[kind.as_str()])
        .start_timer();
    let steps = records.into_iter().map(|mut record| async move {
        if let Err(e) = machine.step(ctx, &mut record).await {
            error!(key = %record.key, error = %e, "machine step errored");
            absorb_step_fault(ctx, &mut record, &e).await;
        }
    });
    join_all(steps).await;
    timer.observe_duration();
    Ok(())
}

/// A step fault is unexpected; park the record in `failed` where the table
/// allows so it stops churning every sweep.
async fn absorb_step_fault(ctx: &OrchestratorContext, record: &mut Instruction, fault: &eyre::Report) {
    if let Err(e) = crate::machine::fail(ctx, record, fault.to_string()).await {
        error!(key = %record.key, error = %e, "could not mark faulted record failed");
    }
}
