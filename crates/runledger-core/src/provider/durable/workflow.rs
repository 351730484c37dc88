// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The workflow task behind one durable run.
//!
//! Continue-as-new ends the current execution and starts a fresh one with a
//! new execution run id. The fresh execution rebuilds its pause/resume state
//! from the event log; only the set of seen signal keys is handed over in
//! memory. The workflow id, and so the stored provider ref, stays the same.
//!
//! Checkpoint appends that fail transiently are retried with the step retry
//! policy. When the workflow gives up on an infrastructure error it records
//! `RunFailed` best-effort, so the projection does not stay RUNNING.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::scheduler::should_trigger_continue_as_new;
use super::{RetryPolicy, StepDispatcher, StepError, StepErrorKind, StepOutcome};
use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::events::{EventScope, EventType, RunEvent};
use crate::persistence::RunStateStore;
use crate::plan::PlanStep;
use crate::projector::RunStatus;
use crate::provider::{SignalEnvelope, SignalKind};

pub(super) enum WorkflowCommand {
    Signal(SignalEnvelope),
    Cancel,
}

/// Observable progress of a durable workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowProgress {
    /// Run id (the workflow id).
    pub run_id: String,
    /// 1 for the first execution, bumped on every continue-as-new.
    pub execution_number: u32,
    /// Id of the current execution. Fresh on every continue-as-new.
    pub execution_run_id: String,
    /// Index of the next layer to run.
    pub next_layer: usize,
    /// Number of layers in the plan.
    pub total_layers: usize,
    /// Workflow-local status. The authoritative status is the projection.
    pub status: RunStatus,
    /// Infrastructure error that stopped the workflow, if any.
    pub error: Option<String>,
}

impl WorkflowProgress {
    pub(super) fn new(run_id: &str, execution_run_id: &str, total_layers: usize) -> Self {
        Self {
            run_id: run_id.to_string(),
            execution_number: 1,
            execution_run_id: execution_run_id.to_string(),
            next_layer: 0,
            total_layers,
            status: RunStatus::Pending,
            error: None,
        }
    }
}

enum StepEnd {
    Done,
    Failed(StepError),
}

/// Signal state of the current execution.
#[derive(Default)]
struct Carried {
    seen_signals: HashSet<String>,
    paused: bool,
    pauses: u32,
    resumes: u32,
    cancel_requested: bool,
}

impl Carried {
    /// State a fresh execution starts from: counters and the pause flag come
    /// from the log, signal keys and a pending cancel from the old execution.
    fn continued(previous: &mut Carried, events: &[RunEvent]) -> Self {
        let count = |ty: EventType| events.iter().filter(|e| e.event_type == ty).count() as u32;
        let pauses = count(EventType::RunPaused);
        let resumes = count(EventType::RunResumed);
        Self {
            seen_signals: std::mem::take(&mut previous.seen_signals),
            paused: pauses > resumes,
            pauses,
            resumes,
            cancel_requested: previous.cancel_requested,
        }
    }
}

/// Append failures worth another attempt from inside the workflow.
fn retry_append(err: &CoreError) -> bool {
    err.is_retryable() || matches!(err, CoreError::RateLimited { .. })
}

pub(super) struct Workflow {
    pub(super) scope: EventScope,
    pub(super) layers: Vec<Vec<PlanStep>>,
    pub(super) store: Arc<dyn RunStateStore>,
    pub(super) dispatcher: Arc<dyn StepDispatcher>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) retry: RetryPolicy,
    pub(super) continue_as_new_after_layers: u32,
    pub(super) commands: mpsc::UnboundedReceiver<WorkflowCommand>,
    pub(super) progress: watch::Sender<WorkflowProgress>,
}

impl Workflow {
    /// Drive the run to a terminal status and return the final progress.
    pub(super) async fn run(mut self) -> WorkflowProgress {
        let mut carried = Carried::default();
        match self.execute(&mut carried).await {
            Ok(status) => {
                info!(run_id = %self.scope.run_id, ?status, "Durable workflow finished");
                self.progress.send_modify(|p| p.status = status);
            }
            Err(e) => {
                error!(run_id = %self.scope.run_id, error = %e, "Durable workflow aborted");
                let detail = json!({"error": e.to_string(), "errorCode": e.error_code()});
                if let Err(record) = self
                    .append(EventType::RunFailed, None, 1, 1, Some(detail))
                    .await
                {
                    error!(
                        run_id = %self.scope.run_id,
                        error = %record,
                        "Could not record workflow failure"
                    );
                }
                self.progress.send_modify(|p| {
                    p.status = RunStatus::Failed;
                    p.error = Some(e.to_string());
                });
            }
        }
        self.progress.borrow().clone()
    }

    async fn execute(&mut self, carried: &mut Carried) -> Result<RunStatus> {
        self.append(EventType::RunStarted, None, 1, 1, None).await?;
        self.progress.send_modify(|p| p.status = RunStatus::Running);

        let total = self.layers.len();
        let mut processed_in_execution = 0u32;
        for index in 0..total {
            if should_trigger_continue_as_new(
                self.continue_as_new_after_layers,
                processed_in_execution,
                index,
                total,
            ) {
                processed_in_execution = 0;
                self.continue_as_new(carried, index).await?;
            }

            let layer = self.layers[index].clone();
            for step in &layer {
                if self.checkpoint(carried).await? {
                    return self.cancelled().await;
                }
                if let StepEnd::Failed(err) = self.execute_step(step).await? {
                    self.append(
                        EventType::RunFailed,
                        None,
                        1,
                        1,
                        Some(json!({"stepId": step.step_id, "error": err.message})),
                    )
                    .await?;
                    return Ok(RunStatus::Failed);
                }
            }
            processed_in_execution += 1;
            self.progress.send_modify(|p| p.next_layer = index + 1);
        }

        if self.checkpoint(carried).await? {
            return self.cancelled().await;
        }
        self.append(EventType::RunCompleted, None, 1, 1, None).await?;
        Ok(RunStatus::Completed)
    }

    async fn continue_as_new(&mut self, carried: &mut Carried, next_layer: usize) -> Result<()> {
        let events = self.store.list_events(&self.scope.run_id).await?;
        *carried = Carried::continued(carried, &events);
        let execution_run_id = Uuid::new_v4().to_string();
        self.progress.send_modify(|p| {
            p.execution_number += 1;
            p.execution_run_id = execution_run_id.clone();
        });
        info!(
            run_id = %self.scope.run_id,
            execution_number = self.progress.borrow().execution_number,
            %execution_run_id,
            next_layer,
            "Continuing as new"
        );
        Ok(())
    }

    /// Apply queued commands, blocking while paused. Returns whether a cancel
    /// was requested.
    async fn checkpoint(&mut self, carried: &mut Carried) -> Result<bool> {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command, carried).await?;
        }
        while carried.paused && !carried.cancel_requested {
            match self.commands.recv().await {
                Some(command) => self.apply(command, carried).await?,
                None => {
                    warn!(run_id = %self.scope.run_id, "Command channel closed while paused");
                    carried.cancel_requested = true;
                }
            }
        }
        Ok(carried.cancel_requested)
    }

    async fn apply(&mut self, command: WorkflowCommand, carried: &mut Carried) -> Result<()> {
        let envelope = match command {
            WorkflowCommand::Cancel => {
                carried.cancel_requested = true;
                return Ok(());
            }
            WorkflowCommand::Signal(envelope) => envelope,
        };
        if !carried.seen_signals.insert(envelope.signal_key.clone()) {
            debug!(run_id = %self.scope.run_id, signal_id = %envelope.request.signal_id, "Duplicate signal dropped");
            return Ok(());
        }

        let detail = Some(json!({"signalId": envelope.request.signal_id}));
        match envelope.request.kind {
            SignalKind::Pause if !carried.paused => {
                carried.pauses += 1;
                self.append(EventType::RunPaused, None, carried.pauses, 1, detail)
                    .await?;
                carried.paused = true;
                self.progress.send_modify(|p| p.status = RunStatus::Paused);
            }
            SignalKind::Resume if carried.paused => {
                carried.resumes += 1;
                self.append(EventType::RunResumed, None, carried.resumes, 1, detail)
                    .await?;
                carried.paused = false;
                self.progress.send_modify(|p| p.status = RunStatus::Running);
            }
            SignalKind::Cancel => carried.cancel_requested = true,
            kind => {
                debug!(run_id = %self.scope.run_id, ?kind, "Signal has no effect in current state");
            }
        }
        Ok(())
    }

    async fn cancelled(&self) -> Result<RunStatus> {
        self.append(EventType::RunCancelled, None, 1, 1, None).await?;
        Ok(RunStatus::Cancelled)
    }

    async fn execute_step(&self, step: &PlanStep) -> Result<StepEnd> {
        let step_id = step.step_id.as_str();
        let timeout = step
            .extra
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis);

        let mut engine_attempt = 1;
        loop {
            // Same logical attempt, so infrastructure retries replay the same key.
            self.append(EventType::StepStarted, Some(step_id), 1, engine_attempt, None)
                .await?;

            let dispatched = self
                .dispatcher
                .dispatch(&self.scope.run_id, step, engine_attempt);
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, dispatched).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(StepError::retryable(format!(
                        "timed out after {}ms",
                        limit.as_millis()
                    ))),
                },
                None => dispatched.await,
            };

            match outcome {
                Ok(StepOutcome::Completed(output)) => {
                    self.append(EventType::StepCompleted, Some(step_id), 1, engine_attempt, output)
                        .await?;
                    return Ok(StepEnd::Done);
                }
                Ok(StepOutcome::Skipped(reason)) => {
                    self.append(
                        EventType::StepSkipped,
                        Some(step_id),
                        1,
                        engine_attempt,
                        Some(json!({"reason": reason})),
                    )
                    .await?;
                    return Ok(StepEnd::Done);
                }
                Err(err)
                    if err.kind == StepErrorKind::NonRetryable
                        || engine_attempt >= self.retry.max_attempts =>
                {
                    warn!(
                        run_id = %self.scope.run_id,
                        step_id,
                        engine_attempt,
                        error = %err,
                        "Step failed permanently"
                    );
                    self.append(
                        EventType::StepFailed,
                        Some(step_id),
                        1,
                        engine_attempt,
                        Some(json!({"error": err.message, "attempts": engine_attempt})),
                    )
                    .await?;
                    return Ok(StepEnd::Failed(err));
                }
                Err(err) => {
                    let delay = self.retry.backoff(engine_attempt);
                    warn!(
                        run_id = %self.scope.run_id,
                        step_id,
                        engine_attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "Step attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    engine_attempt += 1;
                }
            }
        }
    }

    async fn append(
        &self,
        event_type: EventType,
        step_id: Option<&str>,
        logical_attempt_id: u32,
        engine_attempt_id: u32,
        payload: Option<Value>,
    ) -> Result<()> {
        let mut event = self.scope.event(
            self.clock.as_ref(),
            event_type,
            step_id,
            logical_attempt_id,
            engine_attempt_id,
        )?;
        event.payload = payload;

        // The same event is resent, so an attempt that did commit dedupes.
        let mut attempt = 1;
        loop {
            match self
                .store
                .append_and_enqueue_tx(&self.scope.run_id, std::slice::from_ref(&event))
                .await
            {
                Ok(result) => {
                    if !result.deduped.is_empty() {
                        debug!(
                            run_id = %self.scope.run_id,
                            event_type = %event.event_type,
                            "Event already recorded"
                        );
                    }
                    return Ok(());
                }
                Err(e) if retry_append(&e) && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        run_id = %self.scope.run_id,
                        event_type = %event.event_type,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Checkpoint append failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
