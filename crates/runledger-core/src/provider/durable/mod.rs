// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process durable workflow adapter.
//!
//! Each run becomes one long-running workflow task keyed by
//! `(namespace, task_queue, workflow_id)`. The workflow walks the plan's
//! execution layers, checkpoints every transition as an event through the
//! idempotent append path, and reacts to pause/resume/cancel signals between
//! steps.
//!
//! Step work itself is delegated to a [`StepDispatcher`]. Dispatch failures are
//! retried with bounded exponential backoff unless the dispatcher reports
//! [`StepErrorKind::NonRetryable`].

pub mod scheduler;
mod workflow;

pub use self::scheduler::{plan_execution_layers, should_trigger_continue_as_new};
pub use self::workflow::WorkflowProgress;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use self::workflow::{Workflow, WorkflowCommand};
use super::{EngineRunRef, ProviderAdapter, ProviderName, SignalEnvelope, ref_mismatch};
use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, Result};
use crate::events::{EventScope, RunMetadata};
use crate::persistence::RunStateStore;
use crate::plan::{ExecutionPlan, PlanStep};
use crate::projector::{self, RunSnapshot};

const STEP_FIELDS: &[&str] = &["kind", "dependsOn", "input", "timeoutMs"];
const CAPABILITIES: &[&str] = &[
    "cancel",
    "continue_as_new",
    "dependencies",
    "pause",
    "retry",
    "signals",
];

/// Bounded exponential backoff for step dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Dispatch attempts per step, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Durable adapter settings.
#[derive(Debug, Clone)]
pub struct DurableConfig {
    /// Backend namespace.
    pub namespace: String,
    /// Task queue.
    pub task_queue: String,
    /// Layers per execution before continue-as-new. 0 disables it.
    pub continue_as_new_after_layers: u32,
    /// Step retry policy.
    pub retry: RetryPolicy,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            task_queue: "runledger".to_string(),
            continue_as_new_after_layers: 0,
            retry: RetryPolicy::default(),
        }
    }
}

/// How a dispatch failure is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepErrorKind {
    /// Transient; retried within the policy.
    Retryable,
    /// Permanent; fails the step and the run immediately.
    NonRetryable,
}

/// Failure reported by a [`StepDispatcher`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    /// Retry classification.
    pub kind: StepErrorKind,
    /// Human-readable reason.
    pub message: String,
}

impl StepError {
    /// Transient failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::Retryable,
            message: message.into(),
        }
    }

    /// Permanent failure.
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::NonRetryable,
            message: message.into(),
        }
    }
}

/// Successful dispatch result.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step did its work; the value is recorded as the event payload.
    Completed(Option<Value>),
    /// Step chose not to run.
    Skipped(String),
}

/// Executes individual steps for the durable workflow.
#[async_trait]
pub trait StepDispatcher: Send + Sync {
    /// Run one attempt of `step`. `engine_attempt` starts at 1.
    async fn dispatch(
        &self,
        run_id: &str,
        step: &PlanStep,
        engine_attempt: u32,
    ) -> std::result::Result<StepOutcome, StepError>;
}

/// Dispatcher that completes every step immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStepDispatcher;

#[async_trait]
impl StepDispatcher for NoopStepDispatcher {
    async fn dispatch(
        &self,
        _run_id: &str,
        _step: &PlanStep,
        _engine_attempt: u32,
    ) -> std::result::Result<StepOutcome, StepError> {
        Ok(StepOutcome::Completed(None))
    }
}

/// Finished workflows remembered for status queries and restarts.
const FINISHED_RETAINED: usize = 1024;

struct WorkflowHandle {
    run_ref: EngineRunRef,
    commands: mpsc::UnboundedSender<WorkflowCommand>,
    progress: watch::Receiver<WorkflowProgress>,
}

struct FinishedWorkflow {
    run_ref: EngineRunRef,
    progress: WorkflowProgress,
}

/// Live workflow handles plus a bounded tail of finished ones.
#[derive(Default)]
struct Workflows {
    running: HashMap<String, WorkflowHandle>,
    finished: VecDeque<FinishedWorkflow>,
}

impl Workflows {
    fn finished(&self, workflow_id: &str) -> Option<&FinishedWorkflow> {
        self.finished
            .iter()
            .rev()
            .find(|f| f.progress.run_id == workflow_id)
    }

    fn retire(&mut self, workflow_id: &str, progress: WorkflowProgress) {
        let Some(handle) = self.running.remove(workflow_id) else {
            return;
        };
        if self.finished.len() >= FINISHED_RETAINED {
            self.finished.pop_front();
        }
        self.finished.push_back(FinishedWorkflow {
            run_ref: handle.run_ref,
            progress,
        });
    }
}

/// Adapter running each plan as an in-process checkpointed workflow.
pub struct DurableAdapter {
    store: Arc<dyn RunStateStore>,
    dispatcher: Arc<dyn StepDispatcher>,
    clock: Arc<dyn Clock>,
    config: DurableConfig,
    workflows: Arc<Mutex<Workflows>>,
}

impl DurableAdapter {
    /// Adapter appending to `store` and dispatching through `dispatcher`.
    ///
    /// Checkpoint events are the backend's own bookkeeping; give the adapter a
    /// store without the tenant rate limit so a busy tenant cannot stall runs
    /// that are already executing.
    pub fn new(
        store: Arc<dyn RunStateStore>,
        dispatcher: Arc<dyn StepDispatcher>,
        config: DurableConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock: Arc::new(SystemClock::new()),
            config,
            workflows: Arc::new(Mutex::new(Workflows::default())),
        }
    }

    /// Use `clock` for event timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Adapter settings.
    pub fn config(&self) -> &DurableConfig {
        &self.config
    }

    /// Number of workflows still executing.
    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Workflows> {
        self.workflows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Latest progress of a workflow, running or recently finished.
    pub fn progress(&self, run_ref: &EngineRunRef) -> Result<WorkflowProgress> {
        let workflow_id = workflow_id(run_ref)?;
        let workflows = self.lock();
        if let Some(handle) = workflows.running.get(workflow_id) {
            return Ok(handle.progress.borrow().clone());
        }
        workflows
            .finished(workflow_id)
            .map(|f| f.progress.clone())
            .ok_or_else(|| unknown_workflow(workflow_id))
    }

    /// Wait until the workflow reaches a terminal status.
    pub async fn wait(&self, run_ref: &EngineRunRef) -> Result<WorkflowProgress> {
        let mut progress = self.subscribe(run_ref)?;
        let done = progress
            .wait_for(|p| p.status.is_terminal())
            .await
            .map_err(|e| CoreError::ProviderError {
                provider: ProviderName::Durable.to_string(),
                run_id: None,
                reason: format!("workflow progress lost: {}", e),
            })?;
        Ok(done.clone())
    }

    /// Progress updates of a workflow. A finished workflow yields a receiver
    /// that already holds its final progress.
    fn subscribe(&self, run_ref: &EngineRunRef) -> Result<watch::Receiver<WorkflowProgress>> {
        let workflow_id = workflow_id(run_ref)?;
        let workflows = self.lock();
        if let Some(handle) = workflows.running.get(workflow_id) {
            return Ok(handle.progress.clone());
        }
        let finished = workflows
            .finished(workflow_id)
            .ok_or_else(|| unknown_workflow(workflow_id))?;
        let (_, progress) = watch::channel(finished.progress.clone());
        Ok(progress)
    }

    fn send(&self, run_ref: &EngineRunRef, command: WorkflowCommand) -> Result<()> {
        let workflow_id = workflow_id(run_ref)?;
        let workflows = self.lock();
        if let Some(handle) = workflows.running.get(workflow_id) {
            if handle.commands.send(command).is_ok() {
                return Ok(());
            }
        } else if workflows.finished(workflow_id).is_none() {
            return Err(unknown_workflow(workflow_id));
        }
        debug!(workflow_id, "Workflow already finished; command dropped");
        Ok(())
    }
}

fn workflow_id(run_ref: &EngineRunRef) -> Result<&str> {
    match run_ref {
        EngineRunRef::Durable { workflow_id, .. } => Ok(workflow_id),
        other => Err(ref_mismatch(ProviderName::Durable, other)),
    }
}

fn unknown_workflow(workflow_id: &str) -> CoreError {
    CoreError::ProviderError {
        provider: ProviderName::Durable.to_string(),
        run_id: Some(workflow_id.to_string()),
        reason: "no workflow with this id".to_string(),
    }
}

#[async_trait]
impl ProviderAdapter for DurableAdapter {
    fn provider(&self) -> ProviderName {
        ProviderName::Durable
    }

    fn step_fields(&self) -> BTreeSet<&'static str> {
        STEP_FIELDS.iter().copied().collect()
    }

    fn capabilities(&self) -> BTreeSet<&'static str> {
        CAPABILITIES.iter().copied().collect()
    }

    fn validate_plan(&self, plan: &ExecutionPlan) -> Result<()> {
        plan_execution_layers(&plan.steps).map(|_| ())
    }

    async fn start_run(&self, plan: &ExecutionPlan, ctx: &RunMetadata) -> Result<EngineRunRef> {
        let layer_ids = plan_execution_layers(&plan.steps)?;
        let by_id: HashMap<&str, &PlanStep> = plan
            .steps
            .iter()
            .map(|s| (s.step_id.as_str(), s))
            .collect();
        let layers: Vec<Vec<PlanStep>> = layer_ids
            .iter()
            .map(|layer| {
                layer
                    .iter()
                    .filter_map(|id| by_id.get(id.as_str()).map(|s| (*s).clone()))
                    .collect()
            })
            .collect();

        let mut workflows = self.lock();
        let existing = workflows
            .running
            .get(&ctx.run_id)
            .map(|h| &h.run_ref)
            .or_else(|| workflows.finished(&ctx.run_id).map(|f| &f.run_ref));
        if let Some(existing) = existing {
            info!(run_id = %ctx.run_id, "Workflow already started; returning existing reference");
            return Ok(existing.clone());
        }

        let execution_run_id = Uuid::new_v4().to_string();
        let run_ref = EngineRunRef::Durable {
            namespace: self.config.namespace.clone(),
            task_queue: self.config.task_queue.clone(),
            workflow_id: ctx.run_id.clone(),
            execution_run_id: execution_run_id.clone(),
        };
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(WorkflowProgress::new(
            &ctx.run_id,
            &execution_run_id,
            layers.len(),
        ));
        workflows.running.insert(
            ctx.run_id.clone(),
            WorkflowHandle {
                run_ref: run_ref.clone(),
                commands: commands_tx,
                progress: progress_rx,
            },
        );

        let workflow = Workflow {
            scope: EventScope::for_run(ctx),
            layers,
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            clock: self.clock.clone(),
            retry: self.config.retry,
            continue_as_new_after_layers: self.config.continue_as_new_after_layers,
            commands: commands_rx,
            progress: progress_tx,
        };
        let registry = self.workflows.clone();
        let run_id = ctx.run_id.clone();
        tokio::spawn(async move {
            let last = workflow.run().await;
            registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retire(&run_id, last);
        });

        info!(
            run_id = %ctx.run_id,
            namespace = %self.config.namespace,
            task_queue = %self.config.task_queue,
            "Durable workflow started"
        );
        Ok(run_ref)
    }

    async fn cancel_run(&self, run_ref: &EngineRunRef) -> Result<()> {
        self.send(run_ref, WorkflowCommand::Cancel)
    }

    async fn get_run_status(&self, run_ref: &EngineRunRef) -> Result<RunSnapshot> {
        let workflow_id = workflow_id(run_ref)?;
        let events = self.store.list_events(workflow_id).await?;
        projector::rebuild(workflow_id, &events)
    }

    async fn signal(&self, run_ref: &EngineRunRef, signal: &SignalEnvelope) -> Result<()> {
        self.send(run_ref, WorkflowCommand::Signal(signal.clone()))
    }
}
