// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Snapshot projector.
//!
//! A pure fold from a run's ordered events to its current state, followed by a
//! canonical content hash of the logical part of that state. Two replays of the
//! same events always produce the same hash; that hash is what callers compare
//! to detect nondeterminism.
//!
//! Folding rules:
//! - initial status is `PENDING`
//! - `RunStarted` moves to `RUNNING` and sets `startedAt` only if unset
//! - `RunPaused` / `RunResumed` toggle the pause flag and status
//! - `RunCancelled` / `RunCompleted` / `RunFailed` are terminal and set
//!   `completedAt`; once terminal, later run-level events are ignored
//! - step events update the step's sub-record; `attempts` counts `StepStarted`
//! - unknown event types, and step events without a step id, are skipped

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::canonical::canonical_sha256;
use crate::error::Result;
use crate::events::{EventType, RunEvent};

/// Derived run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Accepted, not yet started by the backend.
    Pending,
    /// Executing.
    Running,
    /// Paused by signal.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled.
    Cancelled,
}

impl RunStatus {
    /// Whether no further run-level transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Derived step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Latest attempt in flight.
    Running,
    /// Completed.
    Completed,
    /// Failed permanently.
    Failed,
    /// Skipped by its dispatcher.
    Skipped,
}

/// Per-step sub-record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSnapshot {
    /// Step status.
    pub status: StepStatus,
    /// First `StepStarted` time.
    pub started_at: Option<String>,
    /// Time the latest attempt finished.
    pub completed_at: Option<String>,
    /// Number of `StepStarted` events seen.
    pub attempts: u32,
}

/// Current state of a run, rebuilt from its event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    /// Run id.
    pub run_id: String,
    /// Derived status.
    pub status: RunStatus,
    /// Pause flag.
    pub paused: bool,
    /// First `RunStarted` time.
    pub started_at: Option<String>,
    /// Terminal event time.
    pub completed_at: Option<String>,
    /// Per-step records, keyed by step id.
    pub steps: BTreeMap<String, StepSnapshot>,
    /// Highest `runSeq` folded, if the events were sequenced.
    pub last_seq: Option<i64>,
    /// SHA-256 hex of the canonical logical state.
    pub hash: String,
}

/// The hashed part of a snapshot. Excludes transport fields (run id, sequence).
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogicalState<'a> {
    status: RunStatus,
    paused: bool,
    started_at: &'a Option<String>,
    completed_at: &'a Option<String>,
    steps: &'a BTreeMap<String, StepSnapshot>,
}

#[derive(Default)]
struct Fold {
    status: Option<RunStatus>,
    paused: bool,
    started_at: Option<String>,
    completed_at: Option<String>,
    steps: BTreeMap<String, StepSnapshot>,
    last_seq: Option<i64>,
}

impl Fold {
    fn status(&self) -> RunStatus {
        self.status.unwrap_or(RunStatus::Pending)
    }

    fn apply(&mut self, event: &RunEvent) {
        if let Some(seq) = event.run_seq {
            self.last_seq = Some(self.last_seq.map_or(seq, |last| last.max(seq)));
        }

        let ts = &event.emitted_at;
        match &event.event_type {
            EventType::RunQueued => {}
            EventType::RunStarted => self.run_transition(|f| {
                f.status = Some(RunStatus::Running);
                if f.started_at.is_none() {
                    f.started_at = Some(ts.clone());
                }
            }),
            EventType::RunPaused => self.run_transition(|f| {
                f.paused = true;
                f.status = Some(RunStatus::Paused);
            }),
            EventType::RunResumed => self.run_transition(|f| {
                f.paused = false;
                f.status = Some(RunStatus::Running);
            }),
            EventType::RunCancelled => self.terminal(RunStatus::Cancelled, ts),
            EventType::RunCompleted => self.terminal(RunStatus::Completed, ts),
            EventType::RunFailed => self.terminal(RunStatus::Failed, ts),
            EventType::StepStarted => {
                if let Some(step) = self.step(event) {
                    step.status = StepStatus::Running;
                    step.attempts += 1;
                    if step.started_at.is_none() {
                        step.started_at = Some(ts.clone());
                    }
                    step.completed_at = None;
                }
            }
            EventType::StepCompleted => self.step_finished(event, StepStatus::Completed),
            EventType::StepFailed => self.step_finished(event, StepStatus::Failed),
            EventType::StepSkipped => self.step_finished(event, StepStatus::Skipped),
            EventType::Unknown(name) => {
                debug!(event_type = %name, run_id = %event.run_id, "Skipping unknown event type");
            }
        }
    }

    fn run_transition(&mut self, apply: impl FnOnce(&mut Self)) {
        if !self.status().is_terminal() {
            apply(self);
        }
    }

    fn terminal(&mut self, status: RunStatus, ts: &str) {
        self.run_transition(|f| {
            f.status = Some(status);
            f.paused = false;
            f.completed_at = Some(ts.to_string());
        });
    }

    fn step(&mut self, event: &RunEvent) -> Option<&mut StepSnapshot> {
        let step_id = event.step_id.as_deref().filter(|s| !s.is_empty())?;
        Some(
            self.steps
                .entry(step_id.to_string())
                .or_insert_with(|| StepSnapshot {
                    status: StepStatus::Running,
                    started_at: None,
                    completed_at: None,
                    attempts: 0,
                }),
        )
    }

    fn step_finished(&mut self, event: &RunEvent, status: StepStatus) {
        let ts = event.emitted_at.clone();
        if let Some(step) = self.step(event) {
            step.status = status;
            step.completed_at = Some(ts);
        }
    }
}

/// Rebuild a run's snapshot from its events, which must be in `runSeq` order.
pub fn rebuild(run_id: &str, events: &[RunEvent]) -> Result<RunSnapshot> {
    let mut fold = Fold::default();
    for event in events {
        fold.apply(event);
    }

    let status = fold.status();
    let hash = canonical_sha256(&LogicalState {
        status,
        paused: fold.paused,
        started_at: &fold.started_at,
        completed_at: &fold.completed_at,
        steps: &fold.steps,
    })?;

    Ok(RunSnapshot {
        run_id: run_id.to_string(),
        status,
        paused: fold.paused,
        started_at: fold.started_at,
        completed_at: fold.completed_at,
        steps: fold.steps,
        last_seq: fold.last_seq,
        hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventScope;
    use proptest::prelude::*;

    fn scope() -> EventScope {
        EventScope {
            run_id: "run-1".to_string(),
            plan_id: "plan-1".to_string(),
            plan_version: "1".to_string(),
        }
    }

    fn ev(clock: &ManualClock, event_type: EventType, step: Option<&str>) -> RunEvent {
        scope().event(clock, event_type, step, 1, 1).unwrap()
    }

    fn sequenced(mut events: Vec<RunEvent>) -> Vec<RunEvent> {
        for (i, e) in events.iter_mut().enumerate() {
            e.run_seq = Some(i as i64 + 1);
        }
        events
    }

    fn two_step_run(clock: &ManualClock) -> Vec<RunEvent> {
        sequenced(vec![
            ev(clock, EventType::RunQueued, None),
            ev(clock, EventType::RunStarted, None),
            ev(clock, EventType::StepStarted, Some("a")),
            ev(clock, EventType::StepCompleted, Some("a")),
            ev(clock, EventType::StepStarted, Some("b")),
            ev(clock, EventType::StepCompleted, Some("b")),
            ev(clock, EventType::RunCompleted, None),
        ])
    }

    #[test]
    fn test_empty_log_is_pending() {
        let snap = rebuild("run-1", &[]).unwrap();
        assert_eq!(snap.status, RunStatus::Pending);
        assert!(snap.steps.is_empty());
        assert_eq!(snap.last_seq, None);
        assert_eq!(snap.hash.len(), 64);
    }

    #[test]
    fn test_golden_path_fold() {
        let clock = ManualClock::epoch();
        let snap = rebuild("run-1", &two_step_run(&clock)).unwrap();

        assert_eq!(snap.status, RunStatus::Completed);
        assert_eq!(snap.started_at.as_deref(), Some("2025-01-01T00:00:00.001Z"));
        assert_eq!(snap.completed_at.as_deref(), Some("2025-01-01T00:00:00.006Z"));
        assert_eq!(snap.steps["a"].status, StepStatus::Completed);
        assert_eq!(snap.steps["a"].attempts, 1);
        assert_eq!(snap.steps["b"].completed_at.as_deref(), Some("2025-01-01T00:00:00.005Z"));
        assert_eq!(snap.last_seq, Some(7));
    }

    #[test]
    fn test_replay_is_deterministic() {
        let events = two_step_run(&ManualClock::epoch());
        let first = rebuild("run-1", &events).unwrap();
        let second = rebuild("run-1", &events).unwrap();
        assert_eq!(first.hash, second.hash);
        assert_eq!(first, second);
    }

    #[test]
    fn test_hash_excludes_transport_fields() {
        let events = two_step_run(&ManualClock::epoch());
        let mut unsequenced = events.clone();
        for e in unsequenced.iter_mut() {
            e.run_seq = None;
            e.event_id = "different".to_string();
        }
        let a = rebuild("run-1", &events).unwrap();
        let b = rebuild("run-other", &unsequenced).unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn test_started_at_set_once() {
        let clock = ManualClock::epoch();
        let events = vec![
            ev(&clock, EventType::RunStarted, None),
            ev(&clock, EventType::RunStarted, None),
        ];
        let snap = rebuild("run-1", &events).unwrap();
        assert_eq!(snap.started_at.as_deref(), Some("2025-01-01T00:00:00.000Z"));
    }

    #[test]
    fn test_pause_and_resume() {
        let clock = ManualClock::epoch();
        let mut events = vec![
            ev(&clock, EventType::RunStarted, None),
            ev(&clock, EventType::RunPaused, None),
        ];
        let paused = rebuild("run-1", &events).unwrap();
        assert_eq!(paused.status, RunStatus::Paused);
        assert!(paused.paused);

        events.push(ev(&clock, EventType::RunResumed, None));
        let resumed = rebuild("run-1", &events).unwrap();
        assert_eq!(resumed.status, RunStatus::Running);
        assert!(!resumed.paused);
        assert_ne!(paused.hash, resumed.hash);
    }

    #[test]
    fn test_terminal_status_is_absorbing() {
        let clock = ManualClock::epoch();
        let events = vec![
            ev(&clock, EventType::RunStarted, None),
            ev(&clock, EventType::RunCancelled, None),
            ev(&clock, EventType::RunResumed, None),
            ev(&clock, EventType::RunCompleted, None),
        ];
        let snap = rebuild("run-1", &events).unwrap();
        assert_eq!(snap.status, RunStatus::Cancelled);
        assert_eq!(snap.completed_at.as_deref(), Some("2025-01-01T00:00:00.001Z"));
    }

    #[test]
    fn test_step_attempts_count_only_started() {
        let clock = ManualClock::epoch();
        let scope = scope();
        let events = vec![
            scope.event(&clock, EventType::StepStarted, Some("a"), 1, 1).unwrap(),
            scope.event(&clock, EventType::StepFailed, Some("a"), 1, 1).unwrap(),
            scope.event(&clock, EventType::StepStarted, Some("a"), 2, 1).unwrap(),
            scope.event(&clock, EventType::StepCompleted, Some("a"), 2, 1).unwrap(),
            scope.event(&clock, EventType::StepSkipped, Some("b"), 1, 1).unwrap(),
        ];
        let snap = rebuild("run-1", &events).unwrap();
        assert_eq!(snap.steps["a"].attempts, 2);
        assert_eq!(snap.steps["a"].status, StepStatus::Completed);
        assert_eq!(snap.steps["a"].started_at.as_deref(), Some("2025-01-01T00:00:00.000Z"));
        assert_eq!(snap.steps["b"].attempts, 0);
        assert_eq!(snap.steps["b"].status, StepStatus::Skipped);
    }

    #[test]
    fn test_unknown_event_skipped() {
        let clock = ManualClock::epoch();
        let mut events = two_step_run(&clock);
        let baseline = rebuild("run-1", &events).unwrap();

        let mut future = events[1].clone();
        future.event_type = EventType::Unknown("RunArchived".to_string());
        events.insert(3, future);

        let snap = rebuild("run-1", &events).unwrap();
        assert_eq!(snap.hash, baseline.hash);
    }

    #[test]
    fn test_step_event_without_step_id_skipped() {
        let clock = ManualClock::epoch();
        let mut broken = ev(&clock, EventType::StepStarted, Some("a"));
        broken.step_id = None;
        let snap = rebuild("run-1", &[broken]).unwrap();
        assert!(snap.steps.is_empty());
    }

    #[test]
    fn test_status_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&RunStatus::Cancelled).unwrap(), "\"CANCELLED\"");
    }

    proptest! {
        #[test]
        fn prop_replay_hash_stable(kinds in proptest::collection::vec(0usize..8, 0..40)) {
            let clock = ManualClock::epoch();
            let types = [
                EventType::RunStarted,
                EventType::RunPaused,
                EventType::RunResumed,
                EventType::StepStarted,
                EventType::StepCompleted,
                EventType::StepFailed,
                EventType::StepSkipped,
                EventType::RunCompleted,
            ];
            let events: Vec<RunEvent> = kinds
                .iter()
                .enumerate()
                .map(|(i, k)| {
                    let step = format!("s{}", i % 3);
                    scope()
                        .event(&clock, types[*k].clone(), Some(&step), 1, 1)
                        .unwrap()
                })
                .collect();
            let a = rebuild("run-1", &events).unwrap();
            let b = rebuild("run-1", &events).unwrap();
            prop_assert_eq!(a.hash, b.hash);
        }
    }
}
