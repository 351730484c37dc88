// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call-recording adapter.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{EngineRunRef, ProviderAdapter, ProviderName, SignalEnvelope, ref_mismatch};
use crate::error::{CoreError, Result};
use crate::events::RunMetadata;
use crate::persistence::RunStateStore;
use crate::plan::ExecutionPlan;
use crate::projector::{self, RunSnapshot};

const STEP_FIELDS: &[&str] = &["kind", "dependsOn", "input"];
const CAPABILITIES: &[&str] = &["cancel", "signals"];

/// Adapter that records calls and executes nothing.
pub struct MockAdapter {
    store: Arc<dyn RunStateStore>,
    capabilities: BTreeSet<&'static str>,
    fail_start: AtomicBool,
    start_delay_ms: AtomicU64,
    starts: AtomicUsize,
    cancels: AtomicUsize,
    signals: Mutex<Vec<SignalEnvelope>>,
    seen_signal_keys: Mutex<HashSet<String>>,
}

impl MockAdapter {
    /// Mock reading status from `store`.
    pub fn new(store: Arc<dyn RunStateStore>) -> Self {
        Self {
            store,
            capabilities: CAPABILITIES.iter().copied().collect(),
            fail_start: AtomicBool::new(false),
            start_delay_ms: AtomicU64::new(0),
            starts: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            signals: Mutex::new(Vec::new()),
            seen_signal_keys: Mutex::new(HashSet::new()),
        }
    }

    /// Replace the advertised capabilities.
    pub fn with_capabilities(mut self, capabilities: &[&'static str]) -> Self {
        self.capabilities = capabilities.iter().copied().collect();
        self
    }

    /// Make subsequent `start_run` calls fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `start_run` calls take `delay` before answering.
    pub fn set_start_delay(&self, delay: Duration) {
        self.start_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `start_run` calls that reached the backend.
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of `cancel_run` calls.
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Signals accepted so far, duplicates excluded.
    pub fn signals(&self) -> Vec<SignalEnvelope> {
        self.signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn provider(&self) -> ProviderName {
        ProviderName::Mock
    }

    fn step_fields(&self) -> BTreeSet<&'static str> {
        STEP_FIELDS.iter().copied().collect()
    }

    fn capabilities(&self) -> BTreeSet<&'static str> {
        self.capabilities.clone()
    }

    async fn start_run(&self, plan: &ExecutionPlan, ctx: &RunMetadata) -> Result<EngineRunRef> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let delay = self.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(CoreError::ProviderError {
                provider: ProviderName::Mock.to_string(),
                run_id: Some(ctx.run_id.clone()),
                reason: "start failure injected".to_string(),
            });
        }
        debug!(run_id = %ctx.run_id, steps = plan.steps.len(), "Mock run started");
        Ok(EngineRunRef::Mock {
            run_id: ctx.run_id.clone(),
        })
    }

    async fn cancel_run(&self, run_ref: &EngineRunRef) -> Result<()> {
        let EngineRunRef::Mock { .. } = run_ref else {
            return Err(ref_mismatch(ProviderName::Mock, run_ref));
        };
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_run_status(&self, run_ref: &EngineRunRef) -> Result<RunSnapshot> {
        let EngineRunRef::Mock { run_id } = run_ref else {
            return Err(ref_mismatch(ProviderName::Mock, run_ref));
        };
        let events = self.store.list_events(run_id).await?;
        projector::rebuild(run_id, &events)
    }

    async fn signal(&self, run_ref: &EngineRunRef, signal: &SignalEnvelope) -> Result<()> {
        let EngineRunRef::Mock { .. } = run_ref else {
            return Err(ref_mismatch(ProviderName::Mock, run_ref));
        };
        let fresh = self
            .seen_signal_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(signal.signal_key.clone());
        if fresh {
            self.signals
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(signal.clone());
        } else {
            debug!(run_id = %signal.run_id, "Duplicate signal dropped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryRunStateStore;
    use crate::provider::{SignalKind, SignalRequest};

    fn envelope(key: &str) -> SignalEnvelope {
        SignalEnvelope {
            run_id: "run-1".to_string(),
            signal_key: key.to_string(),
            request: SignalRequest {
                signal_id: "sig".to_string(),
                kind: SignalKind::Pause,
                payload: None,
            },
        }
    }

    #[tokio::test]
    async fn test_signals_are_deduplicated_by_key() {
        let mock = MockAdapter::new(Arc::new(InMemoryRunStateStore::new()));
        let run_ref = EngineRunRef::Mock {
            run_id: "run-1".to_string(),
        };
        mock.signal(&run_ref, &envelope("k1")).await.unwrap();
        mock.signal(&run_ref, &envelope("k1")).await.unwrap();
        mock.signal(&run_ref, &envelope("k2")).await.unwrap();
        assert_eq!(mock.signals().len(), 2);
    }

    #[tokio::test]
    async fn test_foreign_ref_rejected() {
        let mock = MockAdapter::new(Arc::new(InMemoryRunStateStore::new()));
        let durable = EngineRunRef::Durable {
            namespace: "default".to_string(),
            task_queue: "q".to_string(),
            workflow_id: "run-1".to_string(),
            execution_run_id: "e".to_string(),
        };
        let err = mock.cancel_run(&durable).await.unwrap_err();
        assert_eq!(err.error_code(), "PROVIDER_ERROR");
        assert_eq!(mock.cancel_count(), 0);
    }

    #[tokio::test]
    async fn test_status_of_unknown_run_is_pending() {
        let mock = MockAdapter::new(Arc::new(InMemoryRunStateStore::new()));
        let snapshot = mock
            .get_run_status(&EngineRunRef::Mock {
                run_id: "nope".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(snapshot.status, crate::projector::RunStatus::Pending);
    }
}
