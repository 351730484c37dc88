// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plan byte fetchers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::PlanRef;
use crate::error::{CoreError, Result};

/// Fetches the raw bytes a [`PlanRef`] points at.
///
/// Errors must surface as `PLAN_FETCH_FAILED`; an empty body is never a
/// stand-in for a failure.
#[async_trait]
pub trait PlanFetcher: Send + Sync {
    /// Fetch the plan bytes.
    async fn fetch(&self, plan_ref: &PlanRef) -> Result<Vec<u8>>;
}

/// Fetcher serving bytes registered up front, keyed by URI.
#[derive(Default)]
pub struct StaticPlanFetcher {
    plans: Mutex<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl StaticPlanFetcher {
    /// Empty fetcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register bytes for a URI.
    pub fn insert(&self, uri: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uri.into(), bytes.into());
    }

    /// Number of fetch calls made so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlanFetcher for StaticPlanFetcher {
    async fn fetch(&self, plan_ref: &PlanRef) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&plan_ref.uri)
            .cloned()
            .ok_or_else(|| CoreError::PlanFetchFailed {
                uri: plan_ref.uri.clone(),
                reason: "no plan registered for URI".to_string(),
            })
    }
}

/// Fetcher for `http(s)` plan URIs.
#[cfg(feature = "http")]
pub struct HttpPlanFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

#[cfg(feature = "http")]
impl HttpPlanFetcher {
    /// Default limit on the response body.
    pub const DEFAULT_MAX_BYTES: u64 = 16 * 1024 * 1024;

    /// Create a fetcher with a request timeout.
    pub fn new(timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| CoreError::PlanFetchFailed {
                uri: String::new(),
                reason: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            max_bytes: Self::DEFAULT_MAX_BYTES,
        })
    }

    /// Override the response size limit.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl PlanFetcher for HttpPlanFetcher {
    async fn fetch(&self, plan_ref: &PlanRef) -> Result<Vec<u8>> {
        let failed = |reason: String| CoreError::PlanFetchFailed {
            uri: plan_ref.uri.clone(),
            reason,
        };

        let response = self
            .client
            .get(&plan_ref.uri)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {}", status)));
        }

        let limit = plan_ref.size_bytes.unwrap_or(self.max_bytes).min(self.max_bytes);
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(failed(format!("response exceeds {} bytes", limit)));
        }

        let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
        if bytes.len() as u64 > limit {
            return Err(failed(format!("response exceeds {} bytes", limit)));
        }
        Ok(bytes.to_vec())
    }
}
