// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The workflow engine.
//!
//! [`WorkflowEngine::start_run`] runs a fixed gate sequence and only then
//! touches a backend:
//!
//! ```text
//! authorize -> URI policy -> expiry -> fetch + digest -> schema compat
//!   -> adapter selection -> step fields -> capabilities -> adapter plan check
//!   -> bootstrap (RunQueued) -> adapter.start_run -> save provider ref
//! ```
//!
//! A failure at any gate returns before the run is recorded or the adapter
//! starts anything. Within one engine the bootstrap-to-provider-ref section is
//! serialized per run id, so concurrent retries of one start reach the backend
//! once. Cancel, signal and status follow the same authorize-then-resolve shape.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::authz::{Action, Authorizer, RequestContext};
use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, Result};
use crate::events::{EventScope, EventType, RunMetadata};
use crate::idempotency::signal_key;
use crate::keyed_lock::KeyedLocks;
use crate::persistence::RunStateStore;
use crate::plan::{
    ExecutionPlan, FallbackBehavior, PlanFetcher, PlanRef, PlanRefPolicy, SchemaCompatibility,
    fetch_and_validate,
};
use crate::projector::{self, RunSnapshot};
use crate::provider::{
    AdapterRegistry, EngineRunRef, ProviderAdapter, ProviderName, SignalEnvelope, SignalRequest,
};

/// Input to [`WorkflowEngine::start_run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    /// Plan to run.
    pub plan_ref: PlanRef,
    /// Caller-chosen run id. Reusing it makes the start idempotent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Result of [`WorkflowEngine::start_run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunResponse {
    /// Run id.
    pub run_id: String,
    /// Backend reference.
    pub provider_ref: EngineRunRef,
    /// True when the run already existed and nothing was dispatched.
    pub deduplicated: bool,
}

/// Builder for [`WorkflowEngine`].
#[derive(Default)]
pub struct WorkflowEngineBuilder {
    store: Option<Arc<dyn RunStateStore>>,
    registry: Option<AdapterRegistry>,
    fetcher: Option<Arc<dyn PlanFetcher>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    policy: Option<PlanRefPolicy>,
    compatibility: SchemaCompatibility,
    clock: Option<Arc<dyn Clock>>,
    provider_override: Option<String>,
    default_provider: Option<ProviderName>,
}

impl WorkflowEngineBuilder {
    /// Run state store (required).
    pub fn store(mut self, store: Arc<dyn RunStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Adapter registry (required).
    pub fn registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Plan byte fetcher (required).
    pub fn fetcher(mut self, fetcher: Arc<dyn PlanFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Authorizer (required).
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Plan URI policy.
    ///
    /// Default: schemes `https`, `s3`, `gs` with no hosts or prefixes.
    pub fn policy(mut self, policy: PlanRefPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Accepted schema versions.
    pub fn compatibility(mut self, compatibility: SchemaCompatibility) -> Self {
        self.compatibility = compatibility;
        self
    }

    /// Clock for timestamps and plan expiry.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Provider override applied to every request without its own preference.
    pub fn provider_override(mut self, provider: Option<String>) -> Self {
        self.provider_override = provider;
        self
    }

    /// Default provider tried before the built-in priority list.
    pub fn default_provider(mut self, provider: Option<ProviderName>) -> Self {
        self.default_provider = provider;
        self
    }

    /// Build the engine. Fails if a required component is missing.
    pub fn build(self) -> Result<WorkflowEngine> {
        let missing = |field: &str| CoreError::ValidationError {
            field: field.to_string(),
            message: "is required".to_string(),
        };
        Ok(WorkflowEngine {
            store: self.store.ok_or_else(|| missing("store"))?,
            registry: self.registry.ok_or_else(|| missing("registry"))?,
            fetcher: self.fetcher.ok_or_else(|| missing("fetcher"))?,
            authorizer: self.authorizer.ok_or_else(|| missing("authorizer"))?,
            policy: self
                .policy
                .unwrap_or_else(|| PlanRefPolicy::new(["https", "s3", "gs"])),
            compatibility: self.compatibility,
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(SystemClock::new())),
            provider_override: self.provider_override,
            default_provider: self.default_provider,
            dispatching: KeyedLocks::default(),
        })
    }
}

/// Orchestrates runs across the store, the plan gate and the adapters.
pub struct WorkflowEngine {
    store: Arc<dyn RunStateStore>,
    registry: AdapterRegistry,
    fetcher: Arc<dyn PlanFetcher>,
    authorizer: Arc<dyn Authorizer>,
    policy: PlanRefPolicy,
    compatibility: SchemaCompatibility,
    clock: Arc<dyn Clock>,
    provider_override: Option<String>,
    default_provider: Option<ProviderName>,
    dispatching: KeyedLocks,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .field("provider_override", &self.provider_override)
            .field("default_provider", &self.default_provider)
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// Start building an engine.
    pub fn builder() -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::default()
    }

    /// The run state store.
    pub fn store(&self) -> &Arc<dyn RunStateStore> {
        &self.store
    }

    /// The adapter registry.
    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Verify a plan reference and dispatch it to an adapter.
    ///
    /// Restarting with an existing `run_id` of the same tenant and plan
    /// returns the stored backend reference with `deduplicated = true`. If the
    /// earlier attempt never reached the backend, it is dispatched now.
    #[instrument(skip(self, ctx, request), fields(tenant_id = %ctx.tenant_id, plan_uri = %request.plan_ref.uri))]
    pub async fn start_run(
        &self,
        ctx: &RequestContext,
        request: StartRunRequest,
    ) -> Result<StartRunResponse> {
        let StartRunRequest { plan_ref, run_id } = request;

        self.authorizer
            .authorize(ctx, Action::StartRun, run_id.as_deref())
            .await?;
        self.policy.validate_or_throw(&plan_ref.uri)?;
        plan_ref.check_not_expired(self.clock.now())?;

        let plan = fetch_and_validate(&plan_ref, self.fetcher.as_ref()).await?;
        self.compatibility.check(&plan.metadata.schema_version)?;

        let adapter = self.resolve_adapter(&plan, ctx)?;
        let provider = adapter.provider();
        plan.check_step_fields(provider.as_str(), &adapter.step_fields())?;
        check_capabilities(&plan, adapter.as_ref())?;
        adapter.validate_plan(&plan)?;

        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let metadata = RunMetadata {
            run_id: run_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            project_id: ctx.project_id.clone(),
            environment_id: ctx.environment_id.clone(),
            plan_id: plan.metadata.plan_id.clone(),
            plan_version: plan.metadata.plan_version.clone(),
            provider_ref: None,
            created_at: self.clock.now_iso(),
        };
        let queued = EventScope::for_run(&metadata)
            .event(self.clock.as_ref(), EventType::RunQueued, None, 1, 1)?
            .with_payload(json!({"planUri": plan_ref.uri, "provider": provider}));

        // Held until the provider ref is saved; later starts of this run id
        // find the ref instead of dispatching again.
        let _dispatch = self.dispatching.lock(&run_id).await;
        let metadata = match self.store.bootstrap_run_tx(&metadata, &[queued]).await {
            Ok(_) => metadata,
            Err(CoreError::RunAlreadyExists { .. }) => {
                let existing = self.existing_run(ctx, &metadata).await?;
                if let Some(provider_ref) = existing.provider_ref {
                    info!(run_id = %run_id, "Run already started; returning existing reference");
                    return Ok(StartRunResponse {
                        run_id,
                        provider_ref,
                        deduplicated: true,
                    });
                }
                info!(run_id = %run_id, "Run bootstrapped earlier but never dispatched; dispatching");
                existing
            }
            Err(e) => return Err(e),
        };

        let provider_ref = adapter.start_run(&plan, &metadata).await?;
        match self.store.save_provider_ref(&run_id, &provider_ref).await {
            Ok(()) => {}
            Err(CoreError::ProviderRefAlreadySet { .. }) => {
                let stored = self
                    .store
                    .get_run_metadata_by_run_id(&run_id)
                    .await?
                    .and_then(|m| m.provider_ref)
                    .ok_or_else(|| CoreError::RunNotFound {
                        run_id: run_id.clone(),
                    })?;
                return Ok(StartRunResponse {
                    run_id,
                    provider_ref: stored,
                    deduplicated: true,
                });
            }
            Err(e) => return Err(e),
        }

        info!(run_id = %run_id, provider = %provider, "Run started");
        Ok(StartRunResponse {
            run_id,
            provider_ref,
            deduplicated: false,
        })
    }

    /// Request cancellation of a run.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn cancel_run(&self, ctx: &RequestContext, run_id: &str) -> Result<()> {
        self.authorizer
            .authorize(ctx, Action::CancelRun, Some(run_id))
            .await?;
        let (adapter, provider_ref) = self.dispatched_run(ctx, run_id).await?;
        adapter.cancel_run(&provider_ref).await?;
        info!(run_id = %run_id, "Cancellation requested");
        Ok(())
    }

    /// Deliver a signal to a run. Resending a `signal_id` is a no-op.
    #[instrument(skip(self, ctx, request), fields(tenant_id = %ctx.tenant_id, signal_id = %request.signal_id))]
    pub async fn signal(
        &self,
        ctx: &RequestContext,
        run_id: &str,
        request: SignalRequest,
    ) -> Result<()> {
        self.authorizer
            .authorize(ctx, Action::Signal, Some(run_id))
            .await?;
        let (adapter, provider_ref) = self.dispatched_run(ctx, run_id).await?;
        let envelope = SignalEnvelope {
            run_id: run_id.to_string(),
            signal_key: signal_key(&ctx.tenant_id, run_id, &request.signal_id)?,
            request,
        };
        adapter.signal(&provider_ref, &envelope).await
    }

    /// Authoritative status, rebuilt from the event log.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn get_run_status(&self, ctx: &RequestContext, run_id: &str) -> Result<RunSnapshot> {
        self.authorizer
            .authorize(ctx, Action::ReadStatus, Some(run_id))
            .await?;
        let metadata = self
            .store
            .get_run_metadata_by_run_id(run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        check_owner(ctx, &metadata)?;
        let events = self.store.list_events(run_id).await?;
        projector::rebuild(run_id, &events)
    }

    fn resolve_adapter(
        &self,
        plan: &ExecutionPlan,
        ctx: &RequestContext,
    ) -> Result<Arc<dyn ProviderAdapter>> {
        let requested = ctx
            .provider
            .as_deref()
            .or(self.provider_override.as_deref());
        let target = plan.metadata.target_adapter.as_deref();

        if let (Some(target), Some(requested)) = (target, requested)
            && !target.trim().eq_ignore_ascii_case(requested.trim())
        {
            return Err(CoreError::TargetAdapterMismatch {
                plan_target: target.to_string(),
                requested: requested.to_string(),
            });
        }
        self.registry
            .select(target.or(requested), self.default_provider)
    }

    async fn existing_run(&self, ctx: &RequestContext, wanted: &RunMetadata) -> Result<RunMetadata> {
        let existing = self
            .store
            .get_run_metadata_by_run_id(&wanted.run_id)
            .await?
            .ok_or_else(|| CoreError::RunMetadataNotFound {
                run_id: wanted.run_id.clone(),
            })?;
        check_owner(ctx, &existing)?;
        if existing.plan_id != wanted.plan_id || existing.plan_version != wanted.plan_version {
            return Err(CoreError::RunAlreadyExists {
                run_id: wanted.run_id.clone(),
            });
        }
        Ok(existing)
    }

    async fn dispatched_run(
        &self,
        ctx: &RequestContext,
        run_id: &str,
    ) -> Result<(Arc<dyn ProviderAdapter>, EngineRunRef)> {
        let metadata = self
            .store
            .get_run_metadata_by_run_id(run_id)
            .await?
            .ok_or_else(|| CoreError::RunMetadataNotFound {
                run_id: run_id.to_string(),
            })?;
        check_owner(ctx, &metadata)?;
        let provider_ref = metadata.provider_ref.ok_or_else(|| CoreError::RunNotFound {
            run_id: run_id.to_string(),
        })?;
        let adapter = self.registry.get(provider_ref.provider())?;
        Ok((adapter, provider_ref))
    }
}

fn check_owner(ctx: &RequestContext, metadata: &RunMetadata) -> Result<()> {
    if metadata.tenant_id == ctx.tenant_id {
        return Ok(());
    }
    warn!(
        run_id = %metadata.run_id,
        tenant_id = %ctx.tenant_id,
        principal = %ctx.principal,
        code = "AUTHZ_DENIED",
        "Cross-tenant run access denied"
    );
    Err(ctx.denied(Some(&metadata.run_id)))
}

fn check_capabilities(plan: &ExecutionPlan, adapter: &dyn ProviderAdapter) -> Result<()> {
    let supported = adapter.capabilities();
    let missing: Vec<&str> = plan
        .metadata
        .requires_capabilities
        .iter()
        .map(String::as_str)
        .filter(|c| !supported.contains(c))
        .collect();
    let Some(first) = missing.first() else {
        return Ok(());
    };

    match plan.metadata.fallback_behavior.unwrap_or_default() {
        FallbackBehavior::Degrade => {
            warn!(
                provider = %adapter.provider(),
                missing = ?missing,
                plan_id = %plan.metadata.plan_id,
                "Adapter lacks required capabilities; running degraded"
            );
            Ok(())
        }
        FallbackBehavior::Reject => Err(CoreError::CapabilityUnsupported {
            provider: adapter.provider().to_string(),
            capability: first.to_string(),
        }),
    }
}
