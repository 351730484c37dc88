// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider adapters.
//!
//! An adapter turns an [`ExecutionPlan`] into work on a specific backend. The
//! backend only dispatches intent; the authoritative run status is always
//! rebuilt from the event log.
//!
//! Every adapter declares a closed set of step fields it understands and the
//! capabilities it supports. Both are checked before the adapter is invoked.

pub mod durable;
pub mod mock;
pub mod registry;

pub use self::durable::{DurableAdapter, DurableConfig, NoopStepDispatcher, StepDispatcher};
pub use self::mock::MockAdapter;
pub use self::registry::AdapterRegistry;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::events::RunMetadata;
use crate::plan::ExecutionPlan;
use crate::projector::RunSnapshot;

/// Known provider names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    /// In-process checkpointed workflow backend.
    Durable,
    /// Call-recording backend for tests and local development.
    Mock,
}

impl ProviderName {
    /// Fallback order when neither an override nor a default picks an adapter.
    pub const PRIORITY: [ProviderName; 2] = [ProviderName::Durable, ProviderName::Mock];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Durable => "durable",
            Self::Mock => "mock",
        }
    }
}

impl FromStr for ProviderName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "durable" => Ok(Self::Durable),
            "mock" => Ok(Self::Mock),
            _ => Err(CoreError::EngineProviderInvalid {
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend handle for a started run, tagged by provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum EngineRunRef {
    /// Durable workflow execution.
    Durable {
        /// Backend namespace.
        namespace: String,
        /// Task queue the workflow runs on.
        task_queue: String,
        /// Workflow id (equal to the run id).
        workflow_id: String,
        /// Id of the first execution of the workflow.
        execution_run_id: String,
    },
    /// Mock run.
    Mock {
        /// Run id.
        run_id: String,
    },
}

impl EngineRunRef {
    /// Provider that issued this reference.
    pub fn provider(&self) -> ProviderName {
        match self {
            Self::Durable { .. } => ProviderName::Durable,
            Self::Mock { .. } => ProviderName::Mock,
        }
    }
}

/// Signal kinds understood by adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Pause before the next step.
    Pause,
    /// Resume a paused run.
    Resume,
    /// Cancel the run cooperatively.
    Cancel,
}

/// Externally issued signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    /// Caller-chosen id; resending the same id is a no-op.
    pub signal_id: String,
    /// What the signal asks for.
    pub kind: SignalKind,
    /// Optional detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// A signal after the engine has authorized it and derived its dedup key.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    /// Run being signalled.
    pub run_id: String,
    /// `signal_key(tenant, run, signal_id)`.
    pub signal_key: String,
    /// The original request.
    pub request: SignalRequest,
}

/// A backend that can execute plans.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name; unique within a registry.
    fn provider(&self) -> ProviderName;

    /// Optional step fields this adapter understands, besides `stepId`.
    fn step_fields(&self) -> BTreeSet<&'static str>;

    /// Capabilities this adapter supports.
    fn capabilities(&self) -> BTreeSet<&'static str>;

    /// Reject a plan this adapter could never run, before the run is recorded.
    fn validate_plan(&self, _plan: &ExecutionPlan) -> Result<()> {
        Ok(())
    }

    /// Start executing `plan` for the run described by `ctx`.
    async fn start_run(&self, plan: &ExecutionPlan, ctx: &RunMetadata) -> Result<EngineRunRef>;

    /// Request cancellation. Best effort; the run is only cancelled once the
    /// backend appends `RunCancelled`.
    async fn cancel_run(&self, run_ref: &EngineRunRef) -> Result<()>;

    /// Status rebuilt from the event log.
    async fn get_run_status(&self, run_ref: &EngineRunRef) -> Result<RunSnapshot>;

    /// Deliver a signal. Already-seen signal keys are dropped.
    async fn signal(&self, run_ref: &EngineRunRef, signal: &SignalEnvelope) -> Result<()>;
}

pub(crate) fn ref_mismatch(expected: ProviderName, run_ref: &EngineRunRef) -> CoreError {
    CoreError::ProviderError {
        provider: expected.to_string(),
        run_id: None,
        reason: format!("cannot handle a '{}' run reference", run_ref.provider()),
    }
}
