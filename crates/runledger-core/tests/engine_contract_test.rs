// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine contract tests: gate ordering, idempotent starts, tenant isolation
//! and rate limiting, all against the mock adapter.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;

use runledger_core::authz::RequestContext;
use runledger_core::clock::ManualClock;
use runledger_core::engine::StartRunRequest;
use runledger_core::events::EventType;
use runledger_core::persistence::{InMemoryRunStateStore, RateLimitedStore, RunStateStore};
use runledger_core::projector::RunStatus;
use runledger_core::provider::{
    DurableAdapter, DurableConfig, EngineRunRef, NoopStepDispatcher, ProviderAdapter, SignalKind,
    SignalRequest,
};
use runledger_core::rate_limit::{RateLimitConfig, TenantRateLimiter};

fn pause(signal_id: &str) -> SignalRequest {
    SignalRequest {
        signal_id: signal_id.to_string(),
        kind: SignalKind::Pause,
        payload: None,
    }
}

async fn assert_nothing_recorded(ctx: &TestContext, run_id: &str) {
    assert_eq!(ctx.mock.start_count(), 0, "adapter must not be called");
    assert!(
        ctx.store
            .get_run_metadata_by_run_id(run_id)
            .await
            .unwrap()
            .is_none(),
        "no run may be bootstrapped"
    );
}

#[tokio::test]
async fn test_unauthorized_start_touches_nothing() {
    let ctx = TestContext::new();
    let mallory = RequestContext::new("tenant-a", "project-1", "env-1", "mallory");

    let err = ctx.start(&mallory, "run-1", &two_step_plan()).await.unwrap_err();

    assert_eq!(err.error_code(), "AUTHZ_DENIED");
    assert_eq!(ctx.fetcher.fetch_count(), 0);
    assert_nothing_recorded(&ctx, "run-1").await;
}

#[tokio::test]
async fn test_disallowed_uris_are_never_fetched() {
    let ctx = TestContext::new();
    let plan = two_step_plan();

    for uri in [
        "file:///etc/passwd",
        "http://plans.example.com/plan.json",
        "https://127.0.0.1/plan.json",
        "https://evil.example.org/plan.json",
    ] {
        let plan_ref = ctx.publish(uri, &plan);
        let err = ctx
            .engine
            .start_run(
                &alice(),
                StartRunRequest {
                    plan_ref,
                    run_id: Some("run-1".to_string()),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "PLAN_URI_NOT_ALLOWED", "uri {}", uri);
    }

    assert_eq!(ctx.fetcher.fetch_count(), 0);
    assert_nothing_recorded(&ctx, "run-1").await;
}

#[tokio::test]
async fn test_digest_mismatch_rejected_before_parse() {
    let ctx = TestContext::new();
    let mut plan_ref = ctx.publish(PLAN_URI, &two_step_plan());
    plan_ref.sha256 = "0".repeat(64);

    let err = ctx
        .engine
        .start_run(
            &alice(),
            StartRunRequest {
                plan_ref,
                run_id: Some("run-1".to_string()),
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "PLAN_INTEGRITY_VALIDATION_FAILED");
    assert_eq!(ctx.fetcher.fetch_count(), 1);
    assert_nothing_recorded(&ctx, "run-1").await;
}

#[tokio::test]
async fn test_expired_reference_rejected_before_fetch() {
    let ctx = TestContext::new();
    let mut plan_ref = ctx.publish(PLAN_URI, &two_step_plan());
    plan_ref.expires_at = Some("2020-01-01T00:00:00Z".to_string());

    let err = ctx
        .engine
        .start_run(
            &alice(),
            StartRunRequest {
                plan_ref,
                run_id: Some("run-1".to_string()),
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "PLAN_REF_EXPIRED");
    assert_eq!(ctx.fetcher.fetch_count(), 0);
    assert_nothing_recorded(&ctx, "run-1").await;
}

#[tokio::test]
async fn test_plan_level_rejections_never_reach_adapter() {
    let cases = [
        (json!({"schemaVersion": "1.9"}), None, "TOO_NEW"),
        (json!({"schemaVersion": "2.0"}), None, "UNSUPPORTED_MAJOR"),
        (
            json!({"targetAdapter": "durable"}),
            Some("mock"),
            "TARGET_ADAPTER_MISMATCH",
        ),
        (
            json!({"targetAdapter": "durable"}),
            None,
            "ADAPTER_NOT_REGISTERED",
        ),
        (
            json!({"requiresCapabilities": ["pause"]}),
            None,
            "CAPABILITY_UNSUPPORTED",
        ),
    ];

    for (metadata, provider, code) in cases {
        let ctx = TestContext::new();
        let caller = match provider {
            Some(p) => alice().with_provider(p),
            None => alice(),
        };
        let err = ctx
            .start(&caller, "run-1", &plan_with_metadata(metadata))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), code);
        assert_nothing_recorded(&ctx, "run-1").await;
    }
}

#[tokio::test]
async fn test_unknown_step_field_rejected() {
    let ctx = TestContext::new();
    let mut plan = two_step_plan();
    plan["steps"][1]["timeoutMs"] = json!(500);

    let err = ctx.start(&alice(), "run-1", &plan).await.unwrap_err();

    assert_eq!(err.error_code(), "INVALID_STEP_SCHEMA");
    assert!(err.to_string().contains("timeoutMs"));
    assert_nothing_recorded(&ctx, "run-1").await;
}

#[tokio::test]
async fn test_degrade_runs_without_capability() {
    let ctx = TestContext::new();
    let plan = plan_with_metadata(json!({
        "requiresCapabilities": ["pause"],
        "fallbackBehavior": "degrade"
    }));

    let started = ctx.start(&alice(), "run-1", &plan).await.unwrap();

    assert!(!started.deduplicated);
    assert_eq!(ctx.mock.start_count(), 1);
}

#[tokio::test]
async fn test_restart_with_same_run_id_is_deduplicated() {
    let ctx = TestContext::new();

    let first = ctx.start(&alice(), "run-1", &two_step_plan()).await.unwrap();
    let second = ctx.start(&alice(), "run-1", &two_step_plan()).await.unwrap();

    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(first.provider_ref, second.provider_ref);
    assert_eq!(
        first.provider_ref,
        EngineRunRef::Mock {
            run_id: "run-1".to_string()
        }
    );
    assert_eq!(ctx.mock.start_count(), 1);

    let events = ctx.store.list_events("run-1").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::RunQueued);
}

#[tokio::test]
async fn test_restart_after_failed_dispatch_dispatches_once() {
    let ctx = TestContext::new();
    ctx.mock.set_fail_start(true);

    let err = ctx.start(&alice(), "run-1", &two_step_plan()).await.unwrap_err();
    assert_eq!(err.error_code(), "PROVIDER_ERROR");
    let metadata = ctx
        .store
        .get_run_metadata_by_run_id("run-1")
        .await
        .unwrap()
        .unwrap();
    assert!(metadata.provider_ref.is_none());

    // Not dispatched yet: cancel has nothing to talk to.
    let err = ctx.engine.cancel_run(&alice(), "run-1").await.unwrap_err();
    assert_eq!(err.error_code(), "RUN_NOT_FOUND");

    ctx.mock.set_fail_start(false);
    let resumed = ctx.start(&alice(), "run-1", &two_step_plan()).await.unwrap();

    assert!(!resumed.deduplicated);
    assert_eq!(ctx.mock.start_count(), 2);
    assert_eq!(ctx.store.list_events("run-1").await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_share_one_reference() {
    let ctx = Arc::new(TestContext::new());
    // A slow backend keeps the first dispatch in flight while the others arrive.
    ctx.mock.set_start_delay(Duration::from_millis(50));
    let plan_ref = ctx.publish(PLAN_URI, &two_step_plan());

    let starts = (0..8).map(|_| {
        let ctx = ctx.clone();
        let plan_ref = plan_ref.clone();
        tokio::spawn(async move {
            ctx.engine
                .start_run(
                    &alice(),
                    StartRunRequest {
                        plan_ref,
                        run_id: Some("run-1".to_string()),
                    },
                )
                .await
        })
    });
    let responses: Vec<_> = futures::future::join_all(starts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let fresh = responses.iter().filter(|r| !r.deduplicated).count();
    assert_eq!(fresh, 1);
    assert!(
        responses
            .iter()
            .all(|r| r.provider_ref == responses[0].provider_ref)
    );
    assert_eq!(ctx.mock.start_count(), 1);
    assert_eq!(ctx.store.list_events("run-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_plan_rejected_by_adapter_check_records_nothing() {
    let store: Arc<dyn RunStateStore> = Arc::new(InMemoryRunStateStore::new());
    let durable = Arc::new(DurableAdapter::new(
        store.clone(),
        Arc::new(NoopStepDispatcher),
        DurableConfig::default(),
    ));
    let ctx = TestContext::with_adapters(
        store,
        vec![durable.clone() as Arc<dyn ProviderAdapter>],
        None,
    );
    let cyclic = json!({
        "metadata": {
            "planId": "plan-1",
            "planVersion": "1",
            "schemaVersion": "1.2",
            "targetAdapter": "durable"
        },
        "steps": [
            {"stepId": "a", "dependsOn": "b"},
            {"stepId": "b", "dependsOn": "a"}
        ]
    });

    let err = ctx.start(&alice(), "run-1", &cyclic).await.unwrap_err();

    assert_eq!(err.error_code(), "INVALID_PLAN_SCHEMA");
    assert_eq!(durable.running_count(), 0);
    assert!(ctx.store.list_events("run-1").await.unwrap().is_empty());
    assert_nothing_recorded(&ctx, "run-1").await;
}

#[tokio::test]
async fn test_run_id_reuse_with_other_plan_rejected() {
    let ctx = TestContext::new();
    ctx.start(&alice(), "run-1", &two_step_plan()).await.unwrap();

    let other = plan_with_metadata(json!({"planVersion": "2"}));
    let err = ctx.start(&alice(), "run-1", &other).await.unwrap_err();

    assert_eq!(err.error_code(), "RUN_ALREADY_EXISTS");
    assert_eq!(ctx.mock.start_count(), 1);
}

#[tokio::test]
async fn test_unknown_runs() {
    let ctx = TestContext::new();

    let err = ctx.engine.cancel_run(&alice(), "nope").await.unwrap_err();
    assert_eq!(err.error_code(), "RUN_METADATA_NOT_FOUND");

    let err = ctx
        .engine
        .signal(&alice(), "nope", pause("s1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "RUN_METADATA_NOT_FOUND");

    let err = ctx.engine.get_run_status(&alice(), "nope").await.unwrap_err();
    assert_eq!(err.error_code(), "RUN_NOT_FOUND");
    assert_eq!(err.run_id(), Some("nope"));
}

#[tokio::test]
async fn test_cross_tenant_access_denied() {
    let ctx = TestContext::new();
    ctx.start(&alice(), "run-1", &two_step_plan()).await.unwrap();

    let err = ctx.start(&bob(), "run-1", &two_step_plan()).await.unwrap_err();
    assert_eq!(err.error_code(), "AUTHZ_DENIED");

    let err = ctx.engine.cancel_run(&bob(), "run-1").await.unwrap_err();
    assert_eq!(err.error_code(), "AUTHZ_DENIED");

    let err = ctx
        .engine
        .signal(&bob(), "run-1", pause("s1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "AUTHZ_DENIED");

    let err = ctx.engine.get_run_status(&bob(), "run-1").await.unwrap_err();
    assert_eq!(err.error_code(), "AUTHZ_DENIED");
    assert_eq!(err.run_id(), Some("run-1"));

    assert_eq!(ctx.mock.start_count(), 1);
    assert_eq!(ctx.mock.cancel_count(), 0);
    assert!(ctx.mock.signals().is_empty());
}

#[tokio::test]
async fn test_cancel_signal_and_status_on_mock() {
    let ctx = TestContext::new();
    ctx.start(&alice(), "run-1", &two_step_plan()).await.unwrap();

    ctx.engine.cancel_run(&alice(), "run-1").await.unwrap();
    assert_eq!(ctx.mock.cancel_count(), 1);

    ctx.engine
        .signal(&alice(), "run-1", pause("s1"))
        .await
        .unwrap();
    ctx.engine
        .signal(&alice(), "run-1", pause("s1"))
        .await
        .unwrap();
    ctx.engine
        .signal(&alice(), "run-1", pause("s2"))
        .await
        .unwrap();
    let signals = ctx.mock.signals();
    assert_eq!(signals.len(), 2);
    assert_ne!(signals[0].signal_key, signals[1].signal_key);

    let snapshot = ctx.engine.get_run_status(&alice(), "run-1").await.unwrap();
    assert_eq!(snapshot.run_id, "run-1");
    assert_eq!(snapshot.status, RunStatus::Pending);
    assert_eq!(snapshot.hash.len(), 64);
}

#[tokio::test]
async fn test_rate_limited_tenant_is_rejected_before_dispatch() {
    let clock = Arc::new(ManualClock::epoch());
    let limiter = Arc::new(TenantRateLimiter::new(
        RateLimitConfig {
            capacity: 2.0,
            refill_per_second: 0.0,
        },
        clock,
    ));
    let store: Arc<dyn RunStateStore> = Arc::new(RateLimitedStore::new(
        Arc::new(InMemoryRunStateStore::new()),
        limiter,
    ));
    let ctx = TestContext::with_store(store);

    ctx.start(&alice(), "run-1", &two_step_plan()).await.unwrap();
    ctx.start(&alice(), "run-2", &two_step_plan()).await.unwrap();
    let err = ctx.start(&alice(), "run-3", &two_step_plan()).await.unwrap_err();

    assert_eq!(err.error_code(), "RATE_LIMITED");
    assert_eq!(err.run_id(), Some("run-3"));
    assert_eq!(ctx.mock.start_count(), 2);

    // Buckets are per tenant.
    ctx.start(&bob(), "run-4", &two_step_plan()).await.unwrap();
    assert_eq!(ctx.mock.start_count(), 3);
}
