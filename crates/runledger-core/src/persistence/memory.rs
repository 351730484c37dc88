// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory run state store.
//!
//! Each run's log sits behind its own mutex, so appends to one run are
//! serialized while appends to different runs proceed in parallel. The outbox
//! is a single queue; it is always locked after the run, never before.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::{
    AppendResult, DeadLetterRecord, OutboxRecord, RunStateStore, outbox_payload,
    split_in_batch_duplicates, validate_batch,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, Result};
use crate::events::{RunEvent, RunMetadata};
use crate::provider::EngineRunRef;

struct RunLog {
    metadata: RunMetadata,
    events: Vec<RunEvent>,
    key_index: HashMap<String, usize>,
}

impl RunLog {
    fn new(metadata: RunMetadata) -> Self {
        Self {
            metadata,
            events: Vec::new(),
            key_index: HashMap::new(),
        }
    }

    /// Works out what an append would do without mutating the log.
    fn stage(&self, events: &[RunEvent]) -> (Vec<RunEvent>, Vec<RunEvent>) {
        let (unique, repeats) = split_in_batch_duplicates(events);
        let mut appended: Vec<RunEvent> = Vec::new();
        let mut deduped = Vec::new();

        for event in unique {
            if let Some(&idx) = self.key_index.get(&event.idempotency_key) {
                deduped.push(self.events[idx].clone());
                continue;
            }
            let mut accepted = event.clone();
            accepted.run_seq = Some((self.events.len() + appended.len() + 1) as i64);
            appended.push(accepted);
        }

        for event in repeats {
            let original = self
                .key_index
                .get(&event.idempotency_key)
                .map(|&idx| &self.events[idx])
                .or_else(|| {
                    appended
                        .iter()
                        .find(|e| e.idempotency_key == event.idempotency_key)
                });
            if let Some(original) = original {
                deduped.push(original.clone());
            }
        }

        (appended, deduped)
    }

    fn commit(&mut self, appended: &[RunEvent]) {
        for event in appended {
            self.key_index
                .insert(event.idempotency_key.clone(), self.events.len());
            self.events.push(event.clone());
        }
    }
}

#[derive(Default)]
struct OutboxState {
    next_id: i64,
    pending: BTreeMap<i64, OutboxRecord>,
    dead_letters: Vec<DeadLetterRecord>,
}

/// In-memory [`RunStateStore`].
pub struct InMemoryRunStateStore {
    runs: RwLock<HashMap<String, Arc<Mutex<RunLog>>>>,
    outbox: Mutex<OutboxState>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryRunStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRunStateStore {
    /// Create an empty store using the system clock for outbox timestamps.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store with an injected clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            outbox: Mutex::new(OutboxState::default()),
            clock,
        }
    }

    async fn run(&self, run_id: &str) -> Option<Arc<Mutex<RunLog>>> {
        self.runs.read().await.get(run_id).cloned()
    }

    /// Enqueue outbox records for freshly accepted events. Caller holds the run lock.
    async fn enqueue(&self, run_id: &str, appended: &[RunEvent]) -> Result<()> {
        let payloads = appended
            .iter()
            .map(outbox_payload)
            .collect::<Result<Vec<_>>>()?;

        let mut outbox = self.outbox.lock().await;
        for (event, payload) in appended.iter().zip(payloads) {
            outbox.next_id += 1;
            let id = outbox.next_id;
            outbox.pending.insert(
                id,
                OutboxRecord {
                    id,
                    run_id: run_id.to_string(),
                    created_at: self.clock.now_iso(),
                    idempotency_key: event.idempotency_key.clone(),
                    payload,
                    attempts: 0,
                    last_error: None,
                },
            );
        }
        Ok(())
    }
}

#[async_trait]
impl RunStateStore for InMemoryRunStateStore {
    async fn bootstrap_run_tx(
        &self,
        metadata: &RunMetadata,
        first_events: &[RunEvent],
    ) -> Result<AppendResult> {
        validate_batch(&metadata.run_id, first_events)?;

        let mut runs = self.runs.write().await;
        if runs.contains_key(&metadata.run_id) {
            return Err(CoreError::RunAlreadyExists {
                run_id: metadata.run_id.clone(),
            });
        }

        let mut log = RunLog::new(metadata.clone());
        let (appended, deduped) = log.stage(first_events);
        self.enqueue(&metadata.run_id, &appended).await?;
        log.commit(&appended);
        runs.insert(metadata.run_id.clone(), Arc::new(Mutex::new(log)));

        debug!(run_id = %metadata.run_id, appended = appended.len(), "Run bootstrapped");
        Ok(AppendResult { appended, deduped })
    }

    async fn append_and_enqueue_tx(
        &self,
        run_id: &str,
        events: &[RunEvent],
    ) -> Result<AppendResult> {
        validate_batch(run_id, events)?;
        let run = self
            .run(run_id)
            .await
            .ok_or_else(|| CoreError::RunMetadataNotFound {
                run_id: run_id.to_string(),
            })?;

        let mut log = run.lock().await;
        let (appended, deduped) = log.stage(events);
        self.enqueue(run_id, &appended).await?;
        log.commit(&appended);

        Ok(AppendResult { appended, deduped })
    }

    async fn list_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        match self.run(run_id).await {
            Some(run) => Ok(run.lock().await.events.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn get_run_metadata_by_run_id(&self, run_id: &str) -> Result<Option<RunMetadata>> {
        match self.run(run_id).await {
            Some(run) => Ok(Some(run.lock().await.metadata.clone())),
            None => Ok(None),
        }
    }

    async fn save_provider_ref(&self, run_id: &str, provider_ref: &EngineRunRef) -> Result<()> {
        let run = self
            .run(run_id)
            .await
            .ok_or_else(|| CoreError::RunMetadataNotFound {
                run_id: run_id.to_string(),
            })?;

        let mut log = run.lock().await;
        match &log.metadata.provider_ref {
            Some(existing) if existing == provider_ref => Ok(()),
            Some(_) => Err(CoreError::ProviderRefAlreadySet {
                run_id: run_id.to_string(),
            }),
            None => {
                log.metadata.provider_ref = Some(provider_ref.clone());
                Ok(())
            }
        }
    }

    async fn fetch_pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let outbox = self.outbox.lock().await;
        Ok(outbox.pending.values().take(limit).cloned().collect())
    }

    async fn mark_outbox_delivered(&self, ids: &[i64]) -> Result<()> {
        let mut outbox = self.outbox.lock().await;
        for id in ids {
            outbox.pending.remove(id);
        }
        Ok(())
    }

    async fn mark_outbox_failed(
        &self,
        ids: &[i64],
        error: &str,
        max_attempts: u32,
    ) -> Result<Vec<DeadLetterRecord>> {
        let mut outbox = self.outbox.lock().await;
        let mut dead = Vec::new();

        for id in ids {
            let Some(record) = outbox.pending.get_mut(id) else {
                continue;
            };
            record.attempts += 1;
            record.last_error = Some(error.to_string());
            if record.attempts < max_attempts {
                continue;
            }
            if let Some(record) = outbox.pending.remove(id) {
                dead.push(DeadLetterRecord {
                    id: record.id,
                    run_id: record.run_id,
                    idempotency_key: record.idempotency_key,
                    payload: record.payload,
                    attempts: record.attempts,
                    last_error: error.to_string(),
                    dead_lettered_at: self.clock.now_iso(),
                });
            }
        }

        outbox.dead_letters.extend(dead.iter().cloned());
        Ok(dead)
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterRecord>> {
        Ok(self.outbox.lock().await.dead_letters.clone())
    }

    async fn count_pending_outbox(&self) -> Result<u64> {
        Ok(self.outbox.lock().await.pending.len() as u64)
    }
}
