// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed run state store.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    AppendResult, DeadLetterRecord, OutboxRecord, RunStateStore, outbox_payload,
    split_in_batch_duplicates, validate_batch,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, Result};
use crate::events::{EventType, RunEvent, RunMetadata};
use crate::migrations::SQLITE as MIGRATOR;
use crate::provider::EngineRunRef;

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    tenant_id: String,
    project_id: String,
    environment_id: String,
    plan_id: String,
    plan_version: String,
    provider_ref: Option<String>,
    created_at: String,
}

impl RunRow {
    fn into_metadata(self) -> Result<RunMetadata> {
        let provider_ref = self
            .provider_ref
            .as_deref()
            .map(serde_json::from_str::<EngineRunRef>)
            .transpose()?;
        Ok(RunMetadata {
            run_id: self.run_id,
            tenant_id: self.tenant_id,
            project_id: self.project_id,
            environment_id: self.environment_id,
            plan_id: self.plan_id,
            plan_version: self.plan_version,
            provider_ref,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    run_id: String,
    run_seq: i64,
    event_id: String,
    event_type: String,
    step_id: Option<String>,
    emitted_at: String,
    engine_attempt_id: i64,
    logical_attempt_id: i64,
    plan_id: String,
    plan_version: String,
    idempotency_key: String,
    payload: Option<String>,
}

impl EventRow {
    fn into_event(self) -> Result<RunEvent> {
        let payload = self
            .payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(RunEvent {
            event_id: self.event_id,
            event_type: EventType::parse(&self.event_type),
            run_id: self.run_id,
            step_id: self.step_id,
            emitted_at: self.emitted_at,
            engine_attempt_id: self.engine_attempt_id as u32,
            logical_attempt_id: self.logical_attempt_id as u32,
            plan_id: self.plan_id,
            plan_version: self.plan_version,
            idempotency_key: self.idempotency_key,
            run_seq: Some(self.run_seq),
            payload,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    run_id: String,
    created_at: String,
    idempotency_key: String,
    payload: String,
    attempts: i64,
    last_error: Option<String>,
}

impl OutboxRow {
    fn into_record(self) -> Result<OutboxRecord> {
        Ok(OutboxRecord {
            id: self.id,
            run_id: self.run_id,
            created_at: self.created_at,
            idempotency_key: self.idempotency_key,
            payload: serde_json::from_str(&self.payload)?,
            attempts: self.attempts as u32,
            last_error: self.last_error,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: i64,
    run_id: String,
    idempotency_key: String,
    payload: String,
    attempts: i64,
    last_error: String,
    dead_lettered_at: String,
}

impl DeadLetterRow {
    fn into_record(self) -> Result<DeadLetterRecord> {
        Ok(DeadLetterRecord {
            id: self.id,
            run_id: self.run_id,
            idempotency_key: self.idempotency_key,
            payload: serde_json::from_str(&self.payload)?,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            dead_lettered_at: self.dead_lettered_at,
        })
    }
}

const EVENT_COLUMNS: &str = "run_id, run_seq, event_id, event_type, step_id, emitted_at, \
     engine_attempt_id, logical_attempt_id, plan_id, plan_version, idempotency_key, payload";

/// SQLite-backed [`RunStateStore`].
///
/// SQLite admits one writer at a time. Write transactions are serialized
/// through an in-process write lock taken before their first read, so two
/// deferred transactions never race to upgrade a shared lock (which SQLite
/// fails with `database is locked` instead of waiting). Reads go straight to
/// the pool; with WAL they never block the writer. Every append is
/// committed in a single transaction together with its outbox rows.
#[derive(Clone)]
pub struct SqliteRunStateStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    write_lock: Arc<Mutex<()>>,
}

impl SqliteRunStateStore {
    /// Create a store from an existing, already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock::new()))
    }

    /// Create a store with an injected clock for outbox timestamps.
    pub fn with_clock(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Connect to a SQLite URL (e.g. `sqlite:.data/runledger.db`) and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Invalid SQLite URL {}: {}", url, e),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        MIGRATOR.run(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Create and initialize a store from a file path, creating parent
    /// directories and the database file if needed.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }
        Self::connect(&format!("sqlite:{}", path.to_string_lossy())).await
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_exists(tx: &mut Transaction<'_, Sqlite>, run_id: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.is_some())
    }

    async fn find_by_key(
        tx: &mut Transaction<'_, Sqlite>,
        run_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<RunEvent>> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {} FROM run_events WHERE run_id = ? AND idempotency_key = ?",
            EVENT_COLUMNS
        ))
        .bind(run_id)
        .bind(idempotency_key)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(EventRow::into_event).transpose()
    }

    /// Sequence, insert and enqueue a batch inside an open transaction.
    async fn append_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        run_id: &str,
        events: &[RunEvent],
    ) -> Result<AppendResult> {
        let (max_seq,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(run_seq), 0) FROM run_events WHERE run_id = ?")
                .bind(run_id)
                .fetch_one(&mut **tx)
                .await?;

        let (unique, repeats) = split_in_batch_duplicates(events);
        let mut result = AppendResult::default();
        let mut next_seq = max_seq + 1;

        for event in unique {
            if let Some(existing) = Self::find_by_key(tx, run_id, &event.idempotency_key).await? {
                result.deduped.push(existing);
                continue;
            }

            let mut accepted = event.clone();
            accepted.run_seq = Some(next_seq);
            next_seq += 1;

            let payload = accepted
                .payload
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            sqlx::query(&format!(
                "INSERT INTO run_events ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                EVENT_COLUMNS
            ))
            .bind(run_id)
            .bind(next_seq - 1)
            .bind(&accepted.event_id)
            .bind(accepted.event_type.as_str())
            .bind(&accepted.step_id)
            .bind(&accepted.emitted_at)
            .bind(i64::from(accepted.engine_attempt_id))
            .bind(i64::from(accepted.logical_attempt_id))
            .bind(&accepted.plan_id)
            .bind(&accepted.plan_version)
            .bind(&accepted.idempotency_key)
            .bind(payload)
            .execute(&mut **tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO outbox (run_id, created_at, idempotency_key, payload, attempts)
                VALUES (?, ?, ?, ?, 0)
                "#,
            )
            .bind(run_id)
            .bind(self.clock.now_iso())
            .bind(&accepted.idempotency_key)
            .bind(serde_json::to_string(&outbox_payload(&accepted)?)?)
            .execute(&mut **tx)
            .await?;

            result.appended.push(accepted);
        }

        for event in repeats {
            let original = match result
                .appended
                .iter()
                .chain(result.deduped.iter())
                .find(|e| e.idempotency_key == event.idempotency_key)
            {
                Some(original) => Some(original.clone()),
                None => Self::find_by_key(tx, run_id, &event.idempotency_key).await?,
            };
            if let Some(original) = original {
                result.deduped.push(original);
            }
        }

        Ok(result)
    }
}

#[async_trait]
impl RunStateStore for SqliteRunStateStore {
    async fn bootstrap_run_tx(
        &self,
        metadata: &RunMetadata,
        first_events: &[RunEvent],
    ) -> Result<AppendResult> {
        validate_batch(&metadata.run_id, first_events)?;
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        if Self::run_exists(&mut tx, &metadata.run_id).await? {
            return Err(CoreError::RunAlreadyExists {
                run_id: metadata.run_id.clone(),
            });
        }

        let provider_ref = metadata
            .provider_ref
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, tenant_id, project_id, environment_id, plan_id,
                              plan_version, provider_ref, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&metadata.run_id)
        .bind(&metadata.tenant_id)
        .bind(&metadata.project_id)
        .bind(&metadata.environment_id)
        .bind(&metadata.plan_id)
        .bind(&metadata.plan_version)
        .bind(provider_ref)
        .bind(&metadata.created_at)
        .execute(&mut *tx)
        .await?;

        let result = self
            .append_in_tx(&mut tx, &metadata.run_id, first_events)
            .await?;
        tx.commit().await?;

        debug!(run_id = %metadata.run_id, appended = result.appended.len(), "Run bootstrapped");
        Ok(result)
    }

    async fn append_and_enqueue_tx(
        &self,
        run_id: &str,
        events: &[RunEvent],
    ) -> Result<AppendResult> {
        validate_batch(run_id, events)?;
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        if !Self::run_exists(&mut tx, run_id).await? {
            return Err(CoreError::RunMetadataNotFound {
                run_id: run_id.to_string(),
            });
        }
        let result = self.append_in_tx(&mut tx, run_id, events).await?;
        tx.commit().await?;
        Ok(result)
    }

    async fn list_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {} FROM run_events WHERE run_id = ? ORDER BY run_seq ASC",
            EVENT_COLUMNS
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn get_run_metadata_by_run_id(&self, run_id: &str) -> Result<Option<RunMetadata>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT run_id, tenant_id, project_id, environment_id, plan_id,
                   plan_version, provider_ref, created_at
            FROM runs
            WHERE run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RunRow::into_metadata).transpose()
    }

    async fn save_provider_ref(&self, run_id: &str, provider_ref: &EngineRunRef) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT provider_ref FROM runs WHERE run_id = ?")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?;

        match row {
            None => Err(CoreError::RunMetadataNotFound {
                run_id: run_id.to_string(),
            }),
            Some((Some(existing),)) => {
                let existing: EngineRunRef = serde_json::from_str(&existing)?;
                if &existing == provider_ref {
                    Ok(())
                } else {
                    Err(CoreError::ProviderRefAlreadySet {
                        run_id: run_id.to_string(),
                    })
                }
            }
            Some((None,)) => {
                sqlx::query("UPDATE runs SET provider_ref = ? WHERE run_id = ?")
                    .bind(serde_json::to_string(provider_ref)?)
                    .bind(run_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(())
            }
        }
    }

    async fn fetch_pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT id, run_id, created_at, idempotency_key, payload, attempts, last_error
            FROM outbox
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OutboxRow::into_record).collect()
    }

    async fn mark_outbox_delivered(&self, ids: &[i64]) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM outbox WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_outbox_failed(
        &self,
        ids: &[i64],
        error: &str,
        max_attempts: u32,
    ) -> Result<Vec<DeadLetterRecord>> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut dead = Vec::new();

        for id in ids {
            sqlx::query("UPDATE outbox SET attempts = attempts + 1, last_error = ? WHERE id = ?")
                .bind(error)
                .bind(id)
                .execute(&mut *tx)
                .await?;

            let exhausted = sqlx::query_as::<_, OutboxRow>(
                r#"
                SELECT id, run_id, created_at, idempotency_key, payload, attempts, last_error
                FROM outbox
                WHERE id = ? AND attempts >= ?
                "#,
            )
            .bind(id)
            .bind(i64::from(max_attempts))
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = exhausted else {
                continue;
            };
            let record = DeadLetterRecord {
                id: row.id,
                run_id: row.run_id,
                idempotency_key: row.idempotency_key,
                payload: serde_json::from_str(&row.payload)?,
                attempts: row.attempts as u32,
                last_error: error.to_string(),
                dead_lettered_at: self.clock.now_iso(),
            };

            sqlx::query(
                r#"
                INSERT INTO outbox_dead_letters
                    (id, run_id, idempotency_key, payload, attempts, last_error, dead_lettered_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.id)
            .bind(&record.run_id)
            .bind(&record.idempotency_key)
            .bind(&row.payload)
            .bind(row.attempts)
            .bind(&record.last_error)
            .bind(&record.dead_lettered_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM outbox WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            dead.push(record);
        }

        tx.commit().await?;
        Ok(dead)
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterRecord>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT id, run_id, idempotency_key, payload, attempts, last_error, dead_lettered_at
            FROM outbox_dead_letters
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeadLetterRow::into_record).collect()
    }

    async fn count_pending_outbox(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
