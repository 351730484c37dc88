// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run state store interfaces and backends.
//!
//! The store is an append-only, per-run event log plus run metadata and a
//! transactional outbox. Every accepted event is sequenced and enqueued for
//! delivery in one atomic unit; callers never observe one without the other.
//!
//! Backends:
//! - [`SqliteRunStateStore`]: durable, `sqlx` transactions
//! - [`InMemoryRunStateStore`]: tests and embedding
//! - [`RateLimitedStore`]: decorator applying the per-tenant token bucket

pub mod memory;
pub mod rate_limited;
pub mod sqlite;

pub use self::memory::InMemoryRunStateStore;
pub use self::rate_limited::RateLimitedStore;
pub use self::sqlite::SqliteRunStateStore;

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::events::{RunEvent, RunMetadata};
use crate::provider::EngineRunRef;

/// Outcome of an append.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppendResult {
    /// Newly accepted events, with their assigned `runSeq`.
    pub appended: Vec<RunEvent>,
    /// Events whose key was already present, echoing the originally stored event.
    pub deduped: Vec<RunEvent>,
}

impl AppendResult {
    /// Whether nothing new was accepted.
    pub fn is_noop(&self) -> bool {
        self.appended.is_empty()
    }
}

/// Pending delivery obligation created together with an accepted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxRecord {
    /// Outbox id, increasing in enqueue order.
    pub id: i64,
    /// Run the event belongs to.
    pub run_id: String,
    /// When the record was enqueued.
    pub created_at: String,
    /// Idempotency key of the event. Consumers dedup on it.
    pub idempotency_key: String,
    /// Serialized event.
    pub payload: Value,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// Error from the last failed attempt.
    pub last_error: Option<String>,
}

/// Outbox record that exhausted its delivery attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    /// Original outbox id.
    pub id: i64,
    /// Run the event belongs to.
    pub run_id: String,
    /// Idempotency key of the event.
    pub idempotency_key: String,
    /// Serialized event.
    pub payload: Value,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Error from the final attempt.
    pub last_error: String,
    /// When the record was dead-lettered.
    pub dead_lettered_at: String,
}

/// Run state store used by the engine, the durable adapter and the outbox worker.
#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// Create run metadata and append its first events.
    ///
    /// Fails with `RUN_ALREADY_EXISTS` if the run is already present.
    async fn bootstrap_run_tx(
        &self,
        metadata: &RunMetadata,
        first_events: &[RunEvent],
    ) -> Result<AppendResult>;

    /// Append events to an existing run, deduplicating by idempotency key and
    /// enqueueing an outbox record for each new event in the same atomic unit.
    async fn append_and_enqueue_tx(&self, run_id: &str, events: &[RunEvent])
    -> Result<AppendResult>;

    /// All events of a run in ascending `runSeq` order. Empty if the run is unknown.
    async fn list_events(&self, run_id: &str) -> Result<Vec<RunEvent>>;

    /// Run metadata, if the run exists.
    async fn get_run_metadata_by_run_id(&self, run_id: &str) -> Result<Option<RunMetadata>>;

    /// Record the backend reference for a run.
    ///
    /// Fails with `RUN_METADATA_NOT_FOUND` if the run does not exist and with
    /// `PROVIDER_REF_ALREADY_SET` if a different reference is already stored.
    /// Saving the same reference again is a no-op.
    async fn save_provider_ref(&self, run_id: &str, provider_ref: &EngineRunRef) -> Result<()>;

    /// Oldest pending outbox records, up to `limit`.
    async fn fetch_pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Remove delivered records from the outbox.
    async fn mark_outbox_delivered(&self, ids: &[i64]) -> Result<()>;

    /// Record a failed delivery. Records reaching `max_attempts` move to the
    /// dead-letter store and are returned.
    async fn mark_outbox_failed(
        &self,
        ids: &[i64],
        error: &str,
        max_attempts: u32,
    ) -> Result<Vec<DeadLetterRecord>>;

    /// Dead-lettered records, oldest first.
    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterRecord>>;

    /// Number of records awaiting delivery.
    async fn count_pending_outbox(&self) -> Result<u64>;
}

/// Checks shared by every backend before an append touches storage.
pub(crate) fn validate_batch(run_id: &str, events: &[RunEvent]) -> Result<()> {
    for event in events {
        if event.run_id != run_id {
            return Err(CoreError::ValidationError {
                field: "runId".to_string(),
                message: format!(
                    "event {} belongs to run '{}', not '{}'",
                    event.event_id, event.run_id, run_id
                ),
            });
        }
        if event.idempotency_key.is_empty() {
            return Err(CoreError::ValidationError {
                field: "idempotencyKey".to_string(),
                message: format!("event {} has no idempotency key", event.event_id),
            });
        }
        if event.event_type.is_step_scoped() && event.step_id.as_deref().is_none_or(str::is_empty)
        {
            return Err(CoreError::MissingStepId {
                event_type: event.event_type.to_string(),
            });
        }
    }
    Ok(())
}

/// Splits a batch into first occurrences and in-batch repeats of a key.
///
/// Repeats are resolved against the first occurrence once it has been stored.
pub(crate) fn split_in_batch_duplicates(events: &[RunEvent]) -> (Vec<&RunEvent>, Vec<&RunEvent>) {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    let mut repeats = Vec::new();
    for event in events {
        if seen.insert(event.idempotency_key.as_str()) {
            unique.push(event);
        } else {
            repeats.push(event);
        }
    }
    (unique, repeats)
}

/// Outbox payload for an accepted event.
pub(crate) fn outbox_payload(event: &RunEvent) -> Result<Value> {
    Ok(serde_json::to_value(event)?)
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Backend-agnostic store contract, run against every implementation.

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::events::{EventScope, EventType};

    pub fn metadata(run_id: &str, clock: &dyn Clock) -> RunMetadata {
        RunMetadata {
            run_id: run_id.to_string(),
            tenant_id: "tenant-a".to_string(),
            project_id: "project-1".to_string(),
            environment_id: "env-1".to_string(),
            plan_id: "plan-1".to_string(),
            plan_version: "1".to_string(),
            provider_ref: None,
            created_at: clock.now_iso(),
        }
    }

    pub fn event(clock: &dyn Clock, run_id: &str, ty: EventType, step: Option<&str>) -> RunEvent {
        let scope = EventScope {
            run_id: run_id.to_string(),
            plan_id: "plan-1".to_string(),
            plan_version: "1".to_string(),
        };
        scope.event(clock, ty, step, 1, 1).unwrap()
    }

    pub async fn bootstrap_then_duplicate_bootstrap(store: &dyn RunStateStore) {
        let clock = ManualClock::epoch();
        let meta = metadata("run-1", &clock);
        let queued = event(&clock, "run-1", EventType::RunQueued, None);

        let result = store.bootstrap_run_tx(&meta, &[queued.clone()]).await.unwrap();
        assert_eq!(result.appended.len(), 1);
        assert_eq!(result.appended[0].run_seq, Some(1));

        let err = store.bootstrap_run_tx(&meta, &[queued]).await.unwrap_err();
        assert_eq!(err.error_code(), "RUN_ALREADY_EXISTS");

        let stored = store.get_run_metadata_by_run_id("run-1").await.unwrap();
        assert_eq!(stored, Some(meta));
        assert_eq!(store.count_pending_outbox().await.unwrap(), 1);
    }

    pub async fn append_dedupes_and_sequences(store: &dyn RunStateStore) {
        let clock = ManualClock::epoch();
        let meta = metadata("run-1", &clock);
        store.bootstrap_run_tx(&meta, &[]).await.unwrap();

        let started = event(&clock, "run-1", EventType::RunStarted, None);
        let step = event(&clock, "run-1", EventType::StepStarted, Some("a"));

        let first = store.append_and_enqueue_tx("run-1", &[started.clone()]).await.unwrap();
        assert_eq!(first.appended.len(), 1);
        assert!(first.deduped.is_empty());

        // Same key, fresh event id: the original is echoed back.
        let mut replay = event(&clock, "run-1", EventType::RunStarted, None);
        replay.engine_attempt_id = 2;
        let second = store
            .append_and_enqueue_tx("run-1", &[replay, step.clone()])
            .await
            .unwrap();
        assert_eq!(second.appended.len(), 1);
        assert_eq!(second.appended[0].idempotency_key, step.idempotency_key);
        assert_eq!(second.appended[0].run_seq, Some(2));
        assert_eq!(second.deduped.len(), 1);
        assert_eq!(second.deduped[0].event_id, started.event_id);
        assert_eq!(second.deduped[0].run_seq, Some(1));

        for _ in 0..100 {
            let again = store.append_and_enqueue_tx("run-1", &[started.clone()]).await.unwrap();
            assert!(again.is_noop());
        }

        let events = store.list_events("run-1").await.unwrap();
        let seqs: Vec<_> = events.iter().map(|e| e.run_seq).collect();
        assert_eq!(seqs, vec![Some(1), Some(2)]);
        assert_eq!(store.count_pending_outbox().await.unwrap(), 2);
    }

    pub async fn duplicate_keys_within_one_batch(store: &dyn RunStateStore) {
        let clock = ManualClock::epoch();
        store.bootstrap_run_tx(&metadata("run-1", &clock), &[]).await.unwrap();
        let started = event(&clock, "run-1", EventType::RunStarted, None);
        let twin = event(&clock, "run-1", EventType::RunStarted, None);

        let result = store
            .append_and_enqueue_tx("run-1", &[started.clone(), twin])
            .await
            .unwrap();
        assert_eq!(result.appended.len(), 1);
        assert_eq!(result.deduped.len(), 1);
        assert_eq!(result.deduped[0].event_id, started.event_id);
        assert_eq!(store.list_events("run-1").await.unwrap().len(), 1);
    }

    pub async fn append_rejects_unknown_or_foreign_run(store: &dyn RunStateStore) {
        let clock = ManualClock::epoch();
        let started = event(&clock, "ghost", EventType::RunStarted, None);
        let err = store.append_and_enqueue_tx("ghost", &[started]).await.unwrap_err();
        assert_eq!(err.error_code(), "RUN_METADATA_NOT_FOUND");

        store.bootstrap_run_tx(&metadata("run-1", &clock), &[]).await.unwrap();
        let foreign = event(&clock, "run-2", EventType::RunStarted, None);
        let err = store.append_and_enqueue_tx("run-1", &[foreign]).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(store.list_events("run-1").await.unwrap().is_empty());
    }

    pub async fn provider_ref_set_once(store: &dyn RunStateStore) {
        let clock = ManualClock::epoch();
        let run_ref = EngineRunRef::Mock {
            run_id: "mock-1".to_string(),
        };

        let err = store.save_provider_ref("run-1", &run_ref).await.unwrap_err();
        assert_eq!(err.error_code(), "RUN_METADATA_NOT_FOUND");

        store.bootstrap_run_tx(&metadata("run-1", &clock), &[]).await.unwrap();
        store.save_provider_ref("run-1", &run_ref).await.unwrap();
        store.save_provider_ref("run-1", &run_ref).await.unwrap();

        let other = EngineRunRef::Mock {
            run_id: "mock-2".to_string(),
        };
        let err = store.save_provider_ref("run-1", &other).await.unwrap_err();
        assert_eq!(err.error_code(), "PROVIDER_REF_ALREADY_SET");

        let meta = store.get_run_metadata_by_run_id("run-1").await.unwrap().unwrap();
        assert_eq!(meta.provider_ref, Some(run_ref));
    }

    pub async fn outbox_lifecycle(store: &dyn RunStateStore) {
        let clock = ManualClock::epoch();
        let meta = metadata("run-1", &clock);
        let events = vec![
            event(&clock, "run-1", EventType::RunQueued, None),
            event(&clock, "run-1", EventType::RunStarted, None),
            event(&clock, "run-1", EventType::RunCompleted, None),
        ];
        store.bootstrap_run_tx(&meta, &events).await.unwrap();

        let pending = store.fetch_pending_outbox(10).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(pending[0].idempotency_key, events[0].idempotency_key);
        assert_eq!(pending[0].payload["eventType"], "RunQueued");
        assert_eq!(pending[0].payload["runSeq"], 1);

        let limited = store.fetch_pending_outbox(2).await.unwrap();
        assert_eq!(limited.len(), 2);

        store.mark_outbox_delivered(&[pending[0].id]).await.unwrap();
        assert_eq!(store.count_pending_outbox().await.unwrap(), 2);

        let ids = [pending[1].id, pending[2].id];
        let dead = store.mark_outbox_failed(&ids, "bus down", 2).await.unwrap();
        assert!(dead.is_empty());
        let retried = store.fetch_pending_outbox(10).await.unwrap();
        assert_eq!(retried[0].attempts, 1);
        assert_eq!(retried[0].last_error.as_deref(), Some("bus down"));

        let dead = store.mark_outbox_failed(&ids, "still down", 2).await.unwrap();
        assert_eq!(dead.len(), 2);
        assert_eq!(dead[0].id, pending[1].id);
        assert_eq!(dead[0].attempts, 2);
        assert_eq!(dead[0].last_error, "still down");
        assert_eq!(store.count_pending_outbox().await.unwrap(), 0);
        assert_eq!(store.list_dead_letters().await.unwrap().len(), 2);
    }
}
