// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store decorator that applies the per-tenant token bucket before any append.
//!
//! Tokens are charged per submitted event, before the inner store is touched,
//! so an over-limit tenant's write is rejected up front rather than queued.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{AppendResult, DeadLetterRecord, OutboxRecord, RunStateStore};
use crate::error::{CoreError, Result};
use crate::events::{RunEvent, RunMetadata};
use crate::provider::EngineRunRef;
use crate::rate_limit::TenantRateLimiter;

/// [`RunStateStore`] wrapper enforcing [`TenantRateLimiter`] on writes.
pub struct RateLimitedStore {
    inner: Arc<dyn RunStateStore>,
    limiter: Arc<TenantRateLimiter>,
}

impl RateLimitedStore {
    /// Wrap `inner` with `limiter`.
    pub fn new(inner: Arc<dyn RunStateStore>, limiter: Arc<TenantRateLimiter>) -> Self {
        Self { inner, limiter }
    }

    fn charge(&self, tenant_id: &str, run_id: &str, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let requested = u32::try_from(count).unwrap_or(u32::MAX);
        if self.limiter.try_acquire(tenant_id, requested) {
            return Ok(());
        }
        warn!(tenant_id = %tenant_id, run_id = %run_id, requested, "Tenant rate limited");
        Err(CoreError::RateLimited {
            tenant_id: tenant_id.to_string(),
            requested,
            run_id: Some(run_id.to_string()),
        })
    }
}

#[async_trait]
impl RunStateStore for RateLimitedStore {
    async fn bootstrap_run_tx(
        &self,
        metadata: &RunMetadata,
        first_events: &[RunEvent],
    ) -> Result<AppendResult> {
        self.charge(&metadata.tenant_id, &metadata.run_id, first_events.len())?;
        self.inner.bootstrap_run_tx(metadata, first_events).await
    }

    async fn append_and_enqueue_tx(
        &self,
        run_id: &str,
        events: &[RunEvent],
    ) -> Result<AppendResult> {
        let metadata = self
            .inner
            .get_run_metadata_by_run_id(run_id)
            .await?
            .ok_or_else(|| CoreError::RunMetadataNotFound {
                run_id: run_id.to_string(),
            })?;
        self.charge(&metadata.tenant_id, run_id, events.len())?;
        self.inner.append_and_enqueue_tx(run_id, events).await
    }

    async fn list_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        self.inner.list_events(run_id).await
    }

    async fn get_run_metadata_by_run_id(&self, run_id: &str) -> Result<Option<RunMetadata>> {
        self.inner.get_run_metadata_by_run_id(run_id).await
    }

    async fn save_provider_ref(&self, run_id: &str, provider_ref: &EngineRunRef) -> Result<()> {
        self.inner.save_provider_ref(run_id, provider_ref).await
    }

    async fn fetch_pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        self.inner.fetch_pending_outbox(limit).await
    }

    async fn mark_outbox_delivered(&self, ids: &[i64]) -> Result<()> {
        self.inner.mark_outbox_delivered(ids).await
    }

    async fn mark_outbox_failed(
        &self,
        ids: &[i64],
        error: &str,
        max_attempts: u32,
    ) -> Result<Vec<DeadLetterRecord>> {
        self.inner.mark_outbox_failed(ids, error, max_attempts).await
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterRecord>> {
        self.inner.list_dead_letters().await
    }

    async fn count_pending_outbox(&self) -> Result<u64> {
        self.inner.count_pending_outbox().await
    }
}
