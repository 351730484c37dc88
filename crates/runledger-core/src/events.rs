// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run events and run metadata.
//!
//! Events are immutable facts about a run. A run's status is never stored; it
//! is recomputed by folding its events (see [`crate::projector`]).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Clock;
use crate::error::Result;
use crate::idempotency::{new_event_id, run_event_key};
use crate::provider::EngineRunRef;

/// Lifecycle event types.
///
/// `Unknown` holds event types written by newer versions of the engine. They
/// round-trip through storage unchanged and are skipped by the projector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    /// Run accepted and queued for dispatch.
    RunQueued,
    /// Backend started executing the run.
    RunStarted,
    /// Run paused by signal.
    RunPaused,
    /// Run resumed by signal.
    RunResumed,
    /// Run cancelled (terminal).
    RunCancelled,
    /// Run completed successfully (terminal).
    RunCompleted,
    /// Run failed (terminal).
    RunFailed,
    /// Step attempt started.
    StepStarted,
    /// Step completed.
    StepCompleted,
    /// Step failed permanently.
    StepFailed,
    /// Step was skipped by its dispatcher.
    StepSkipped,
    /// Event type not known to this version.
    Unknown(String),
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::RunQueued => "RunQueued",
            Self::RunStarted => "RunStarted",
            Self::RunPaused => "RunPaused",
            Self::RunResumed => "RunResumed",
            Self::RunCancelled => "RunCancelled",
            Self::RunCompleted => "RunCompleted",
            Self::RunFailed => "RunFailed",
            Self::StepStarted => "StepStarted",
            Self::StepCompleted => "StepCompleted",
            Self::StepFailed => "StepFailed",
            Self::StepSkipped => "StepSkipped",
            Self::Unknown(other) => other,
        }
    }

    /// Parse a wire name. Never fails; unrecognized names become `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "RunQueued" => Self::RunQueued,
            "RunStarted" => Self::RunStarted,
            "RunPaused" => Self::RunPaused,
            "RunResumed" => Self::RunResumed,
            "RunCancelled" => Self::RunCancelled,
            "RunCompleted" => Self::RunCompleted,
            "RunFailed" => Self::RunFailed,
            "StepStarted" => Self::StepStarted,
            "StepCompleted" => Self::StepCompleted,
            "StepFailed" => Self::StepFailed,
            "StepSkipped" => Self::StepSkipped,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Step-scoped events require a step id.
    pub fn is_step_scoped(&self) -> bool {
        matches!(
            self,
            Self::StepStarted | Self::StepCompleted | Self::StepFailed | Self::StepSkipped
        )
    }

    /// Terminal run events.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCancelled | Self::RunCompleted | Self::RunFailed
        )
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, totally ordered fact about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    /// Random id for log correlation.
    pub event_id: String,
    /// Event type.
    pub event_type: EventType,
    /// Run this event belongs to.
    pub run_id: String,
    /// Step for step-scoped events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// ISO-8601 UTC emission time.
    pub emitted_at: String,
    /// Infrastructure-level attempt (e.g. backend activity retry).
    pub engine_attempt_id: u32,
    /// Business-level attempt. Drives the idempotency key.
    pub logical_attempt_id: u32,
    /// Plan id.
    pub plan_id: String,
    /// Plan version.
    pub plan_version: String,
    /// Dedup key, unique within the run.
    pub idempotency_key: String,
    /// Per-run sequence number, assigned once by the store on first acceptance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_seq: Option<i64>,
    /// Optional detail (error message, skip reason, etc).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Identity fields shared by every event of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventScope {
    /// Run id.
    pub run_id: String,
    /// Plan id.
    pub plan_id: String,
    /// Plan version.
    pub plan_version: String,
}

impl EventScope {
    /// Scope for an existing run.
    pub fn for_run(metadata: &RunMetadata) -> Self {
        Self {
            run_id: metadata.run_id.clone(),
            plan_id: metadata.plan_id.clone(),
            plan_version: metadata.plan_version.clone(),
        }
    }

    /// Build a new, unsequenced event with its idempotency key.
    pub fn event(
        &self,
        clock: &dyn Clock,
        event_type: EventType,
        step_id: Option<&str>,
        logical_attempt_id: u32,
        engine_attempt_id: u32,
    ) -> Result<RunEvent> {
        let idempotency_key = run_event_key(
            &event_type,
            &self.run_id,
            logical_attempt_id,
            &self.plan_id,
            &self.plan_version,
            step_id,
        )?;
        let step_id = if event_type.is_step_scoped() {
            step_id.map(str::to_string)
        } else {
            None
        };

        Ok(RunEvent {
            event_id: new_event_id(),
            event_type,
            run_id: self.run_id.clone(),
            step_id,
            emitted_at: clock.now_iso(),
            engine_attempt_id,
            logical_attempt_id,
            plan_id: self.plan_id.clone(),
            plan_version: self.plan_version.clone(),
            idempotency_key,
            run_seq: None,
            payload: None,
        })
    }
}

impl RunEvent {
    /// Attach a payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// One execution of a plan for a tenant/project/environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    /// Run id.
    pub run_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Project within the tenant.
    pub project_id: String,
    /// Environment within the project.
    pub environment_id: String,
    /// Plan id.
    pub plan_id: String,
    /// Plan version.
    pub plan_version: String,
    /// Backend reference, set once when the backend starts the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<EngineRunRef>,
    /// When the run was bootstrapped.
    pub created_at: String,
}
