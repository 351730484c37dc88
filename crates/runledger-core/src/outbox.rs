// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbox delivery worker.
//!
//! Drains the store's outbox to an [`EventBus`]. Each [`OutboxWorker::tick`]
//! pulls up to `batch_size` pending records and publishes them:
//!
//! - [`DeliveryGranularity::Batch`] (default): the batch is atomic. On any
//!   publish error every record in it is marked failed and the error is
//!   returned. Already-delivered siblings are redelivered later, so consumers
//!   must dedup on `idempotencyKey`.
//! - [`DeliveryGranularity::PerRecord`]: records are published one by one,
//!   only the failing ones are marked failed, and failures are reported in the
//!   returned [`TickReport`] instead of as an error.
//!
//! Records reaching `max_attempts` are moved to the dead-letter store.
//! Only one tick runs at a time; a tick that finds another in flight returns
//! immediately with [`TickReport::skipped`] set.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};
use crate::persistence::{DeadLetterRecord, OutboxRecord, RunStateStore};

/// Failure reported by an event bus.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct BusError(pub String);

/// Destination for outbox records. Must tolerate redelivery.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish records. Either all are acknowledged or an error is returned.
    async fn publish(&self, records: &[OutboxRecord]) -> std::result::Result<(), BusError>;
}

/// How publish failures are attributed to records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryGranularity {
    /// One publish call per batch; a failure fails the whole batch.
    #[default]
    Batch,
    /// One publish call per record.
    PerRecord,
}

impl std::str::FromStr for DeliveryGranularity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "batch" => Ok(Self::Batch),
            "per_record" | "per-record" | "record" => Ok(Self::PerRecord),
            other => Err(format!("unknown delivery granularity '{}'", other)),
        }
    }
}

/// Outbox worker configuration.
#[derive(Debug, Clone)]
pub struct OutboxWorkerConfig {
    /// Maximum records pulled per tick.
    pub batch_size: usize,
    /// Failed attempts before a record is dead-lettered.
    pub max_attempts: u32,
    /// Delay between ticks in [`OutboxWorker::run`].
    pub poll_interval: Duration,
    /// Failure attribution.
    pub granularity: DeliveryGranularity,
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_attempts: 5,
            poll_interval: Duration::from_secs(1),
            granularity: DeliveryGranularity::Batch,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Records pulled from the outbox.
    pub fetched: usize,
    /// Records acknowledged by the bus and removed.
    pub delivered: usize,
    /// Records marked failed.
    pub failed: usize,
    /// Records moved to the dead-letter store.
    pub dead_lettered: usize,
    /// Another tick was in flight; nothing was done.
    pub skipped: bool,
}

/// Drains the outbox to an event bus.
pub struct OutboxWorker {
    store: Arc<dyn RunStateStore>,
    bus: Arc<dyn EventBus>,
    config: OutboxWorkerConfig,
    in_flight: Mutex<()>,
    shutdown: Arc<Notify>,
}

impl OutboxWorker {
    /// Create a new worker.
    pub fn new(
        store: Arc<dyn RunStateStore>,
        bus: Arc<dyn EventBus>,
        config: OutboxWorkerConfig,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            in_flight: Mutex::new(()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Deliver one batch.
    ///
    /// In batch mode, returns `PUBLISH_FAILED` when the bus rejected the batch;
    /// its records have already been marked (and possibly dead-lettered).
    pub async fn tick(&self) -> Result<TickReport> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Outbox tick already in flight, skipping");
            return Ok(TickReport {
                skipped: true,
                ..TickReport::default()
            });
        };

        let records = self
            .store
            .fetch_pending_outbox(self.config.batch_size)
            .await?;
        if records.is_empty() {
            return Ok(TickReport::default());
        }

        match self.config.granularity {
            DeliveryGranularity::Batch => self.deliver_batch(records).await,
            DeliveryGranularity::PerRecord => self.deliver_each(records).await,
        }
    }

    async fn deliver_batch(&self, records: Vec<OutboxRecord>) -> Result<TickReport> {
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        let mut report = TickReport {
            fetched: records.len(),
            ..TickReport::default()
        };

        match self.bus.publish(&records).await {
            Ok(()) => {
                self.store.mark_outbox_delivered(&ids).await?;
                report.delivered = ids.len();
                debug!(count = ids.len(), "Outbox batch delivered");
                Ok(report)
            }
            Err(e) => {
                self.fail(&ids, &e.0).await?;
                Err(CoreError::PublishFailed {
                    batch_size: ids.len(),
                    reason: e.0,
                })
            }
        }
    }

    async fn deliver_each(&self, records: Vec<OutboxRecord>) -> Result<TickReport> {
        let mut report = TickReport {
            fetched: records.len(),
            ..TickReport::default()
        };
        let mut delivered = Vec::new();

        for record in records {
            match self.bus.publish(std::slice::from_ref(&record)).await {
                Ok(()) => delivered.push(record.id),
                Err(e) => {
                    let dead = self.fail(&[record.id], &e.0).await?;
                    report.failed += 1;
                    report.dead_lettered += dead.len();
                }
            }
        }

        self.store.mark_outbox_delivered(&delivered).await?;
        report.delivered = delivered.len();
        Ok(report)
    }

    async fn fail(&self, ids: &[i64], reason: &str) -> Result<Vec<DeadLetterRecord>> {
        warn!(count = ids.len(), error = %reason, "Outbox publish failed");
        let dead = self
            .store
            .mark_outbox_failed(ids, reason, self.config.max_attempts)
            .await?;
        for record in &dead {
            error!(
                outbox_id = record.id,
                run_id = %record.run_id,
                attempts = record.attempts,
                error = %record.last_error,
                "Outbox record dead-lettered"
            );
        }
        Ok(dead)
    }

    /// Run the delivery loop until shutdown is signalled.
    pub async fn run(self: Arc<Self>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            "Outbox worker started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Outbox worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, code = e.error_code(), "Outbox tick failed");
                    }
                }
            }
        }
    }
}

/// Event bus that keeps published records in memory.
#[derive(Default)]
pub struct InMemoryEventBus {
    published: StdMutex<Vec<OutboxRecord>>,
    fail_next: AtomicU32,
    poisoned_keys: StdMutex<HashSet<String>>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publish calls.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every publish call containing a record with this idempotency key.
    pub fn poison_key(&self, idempotency_key: &str) {
        self.poisoned_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(idempotency_key.to_string());
    }

    /// Records acknowledged so far, in publish order.
    pub fn published(&self) -> Vec<OutboxRecord> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, records: &[OutboxRecord]) -> std::result::Result<(), BusError> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BusError("injected failure".to_string()));
        }

        {
            let poisoned = self.poisoned_keys.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(r) = records.iter().find(|r| poisoned.contains(&r.idempotency_key)) {
                return Err(BusError(format!("rejected record {}", r.id)));
            }
        }

        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(records.iter().cloned());
        Ok(())
    }
}

/// Event bus that logs each record and acknowledges it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventBus;

#[async_trait]
impl EventBus for TracingEventBus {
    async fn publish(&self, records: &[OutboxRecord]) -> std::result::Result<(), BusError> {
        for record in records {
            info!(
                outbox_id = record.id,
                run_id = %record.run_id,
                idempotency_key = %record.idempotency_key,
                event_type = %record.payload["eventType"],
                "Event delivered"
            );
        }
        Ok(())
    }
}
