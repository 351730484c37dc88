// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runledger-core integration tests.
//!
//! Provides TestContext wiring an in-memory store, a static plan fetcher, the
//! mock adapter and an allow-list authorizer into a [`WorkflowEngine`].

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value, json};

use runledger_core::authz::{RequestContext, TenantAllowListAuthorizer};
use runledger_core::canonical::sha256_hex;
use runledger_core::clock::Clock;
use runledger_core::engine::{StartRunRequest, WorkflowEngine};
use runledger_core::persistence::{InMemoryRunStateStore, RunStateStore};
use runledger_core::plan::{PlanRef, PlanRefPolicy, StaticPlanFetcher};
use runledger_core::provider::{AdapterRegistry, MockAdapter, ProviderAdapter};

pub const PLAN_URI: &str = "https://plans.example.com/plan-1.json";

/// Test context that owns the engine and the doubles behind it.
pub struct TestContext {
    pub store: Arc<dyn RunStateStore>,
    pub fetcher: Arc<StaticPlanFetcher>,
    pub mock: Arc<MockAdapter>,
    pub engine: WorkflowEngine,
}

impl TestContext {
    /// Context over a fresh in-memory store with only the mock adapter.
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryRunStateStore::new()))
    }

    /// Context over `store` with only the mock adapter.
    pub fn with_store(store: Arc<dyn RunStateStore>) -> Self {
        let mock = Arc::new(MockAdapter::new(store.clone()));
        let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![mock.clone()];
        Self::build(store, mock, adapters, None)
    }

    /// Context with extra adapters registered next to the mock one.
    pub fn with_adapters(
        store: Arc<dyn RunStateStore>,
        extra: Vec<Arc<dyn ProviderAdapter>>,
        clock: Option<Arc<dyn Clock>>,
    ) -> Self {
        let mock = Arc::new(MockAdapter::new(store.clone()));
        let mut adapters: Vec<Arc<dyn ProviderAdapter>> = vec![mock.clone()];
        adapters.extend(extra);
        Self::build(store, mock, adapters, clock)
    }

    fn build(
        store: Arc<dyn RunStateStore>,
        mock: Arc<MockAdapter>,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        clock: Option<Arc<dyn Clock>>,
    ) -> Self {
        let fetcher = Arc::new(StaticPlanFetcher::new());
        let authorizer = TenantAllowListAuthorizer::new()
            .grant("alice", "tenant-a")
            .grant("bob", "tenant-b");

        let mut builder = WorkflowEngine::builder()
            .store(store.clone())
            .registry(AdapterRegistry::new(adapters).expect("registry"))
            .fetcher(fetcher.clone())
            .authorizer(Arc::new(authorizer))
            .policy(PlanRefPolicy::new(["https"]).with_hosts(["plans.example.com"]));
        if let Some(clock) = clock {
            builder = builder.clock(clock);
        }

        Self {
            store,
            fetcher,
            mock,
            engine: builder.build().expect("engine"),
        }
    }

    /// Store `plan` under `uri` and return a matching reference.
    pub fn publish(&self, uri: &str, plan: &Value) -> PlanRef {
        let bytes = serde_json::to_vec(plan).expect("plan json");
        let plan_ref = plan_ref_for(uri, &bytes, plan);
        self.fetcher.insert(uri, bytes);
        plan_ref
    }

    /// Publish `plan` at [`PLAN_URI`] and start it as `run_id` for `ctx`.
    pub async fn start(
        &self,
        ctx: &RequestContext,
        run_id: &str,
        plan: &Value,
    ) -> runledger_core::Result<runledger_core::engine::StartRunResponse> {
        let plan_ref = self.publish(PLAN_URI, plan);
        self.engine
            .start_run(
                ctx,
                StartRunRequest {
                    plan_ref,
                    run_id: Some(run_id.to_string()),
                },
            )
            .await
    }
}

/// Reference pointing at `bytes`, with ids copied from the plan metadata.
pub fn plan_ref_for(uri: &str, bytes: &[u8], plan: &Value) -> PlanRef {
    let metadata = &plan["metadata"];
    PlanRef {
        uri: uri.to_string(),
        sha256: sha256_hex(bytes),
        schema_version: metadata["schemaVersion"].as_str().unwrap_or_default().to_string(),
        plan_id: metadata["planId"].as_str().unwrap_or_default().to_string(),
        plan_version: metadata["planVersion"].as_str().unwrap_or_default().to_string(),
        size_bytes: Some(bytes.len() as u64),
        expires_at: None,
    }
}

/// Two-step plan: `b` depends on `a`.
pub fn two_step_plan() -> Value {
    json!({
        "metadata": {
            "planId": "plan-1",
            "planVersion": "1",
            "schemaVersion": "1.2"
        },
        "steps": [
            {"stepId": "a", "kind": "noop"},
            {"stepId": "b", "kind": "noop", "dependsOn": "a"}
        ]
    })
}

/// [`two_step_plan`] with extra metadata fields merged in.
pub fn plan_with_metadata(extra: Value) -> Value {
    let mut plan = two_step_plan();
    if let (Some(metadata), Some(extra)) = (plan["metadata"].as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            metadata.insert(k.clone(), v.clone());
        }
    }
    plan
}

pub fn alice() -> RequestContext {
    RequestContext::new("tenant-a", "project-1", "env-1", "alice")
}

pub fn bob() -> RequestContext {
    RequestContext::new("tenant-b", "project-1", "env-1", "bob")
}
