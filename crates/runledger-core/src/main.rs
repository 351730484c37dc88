// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runledger - event-sourced workflow orchestration
//!
//! The binary is responsible for:
//! - Opening the SQLite run state store (migrations included)
//! - Wiring the plan gate, adapter registry and engine
//! - Draining the transactional outbox to the event bus
//!
//! Requests enter through the library API ([`WorkflowEngine`]); the process
//! keeps the outbox and any durable workflows alive until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use runledger_core::authz::AllowAllAuthorizer;
use runledger_core::clock::SystemClock;
use runledger_core::config::Config;
use runledger_core::engine::WorkflowEngine;
use runledger_core::outbox::TracingEventBus;
use runledger_core::persistence::{RateLimitedStore, RunStateStore, SqliteRunStateStore};
use runledger_core::plan::PlanFetcher;
use runledger_core::provider::{
    AdapterRegistry, DurableAdapter, DurableConfig, MockAdapter, NoopStepDispatcher,
    ProviderAdapter,
};
use runledger_core::rate_limit::TenantRateLimiter;
use runledger_core::runtime::EngineRuntime;

const PLAN_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("runledger_core=info".parse()?),
        )
        .init();

    info!("Starting Runledger");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        database_url = %config.database_url,
        engine_provider = config.engine_provider.as_deref().unwrap_or("auto"),
        granularity = ?config.outbox.granularity,
        rate_limit_capacity = config.rate_limit.capacity,
        "Configuration loaded"
    );

    info!("Opening run state store...");
    let sqlite = SqliteRunStateStore::connect(&config.database_url).await?;
    info!("Run state store ready");

    let clock = Arc::new(SystemClock::new());
    let limiter = Arc::new(TenantRateLimiter::new(config.rate_limit, clock.clone()));
    let sqlite: Arc<dyn RunStateStore> = Arc::new(sqlite);
    // Client-initiated writes are rate limited per tenant. Adapters checkpoint
    // runs that are already executing and write to the store directly.
    let store: Arc<dyn RunStateStore> = Arc::new(RateLimitedStore::new(sqlite.clone(), limiter));

    let durable = DurableAdapter::new(
        sqlite.clone(),
        Arc::new(NoopStepDispatcher),
        DurableConfig {
            continue_as_new_after_layers: config.continue_as_new_after_layers,
            ..Default::default()
        },
    );
    let adapters: Vec<Arc<dyn ProviderAdapter>> =
        vec![Arc::new(durable), Arc::new(MockAdapter::new(sqlite))];
    let registry = AdapterRegistry::new(adapters)?;
    info!(providers = ?registry.providers(), "Adapters registered");

    let engine = WorkflowEngine::builder()
        .store(store.clone())
        .registry(registry)
        .fetcher(plan_fetcher()?)
        .authorizer(Arc::new(AllowAllAuthorizer))
        .policy(config.plan_policy())
        .clock(clock)
        .provider_override(config.engine_provider.clone())
        .default_provider(config.default_provider)
        .build()?;

    let runtime = EngineRuntime::builder()
        .store(store)
        .bus(Arc::new(TracingEventBus))
        .engine(Arc::new(engine))
        .outbox(config.outbox.clone())
        .build()?
        .start()
        .await?;

    info!("Runledger initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}

#[cfg(feature = "http")]
fn plan_fetcher() -> Result<Arc<dyn PlanFetcher>> {
    Ok(Arc::new(runledger_core::plan::HttpPlanFetcher::new(
        PLAN_FETCH_TIMEOUT,
    )?))
}

#[cfg(not(feature = "http"))]
fn plan_fetcher() -> Result<Arc<dyn PlanFetcher>> {
    let _ = PLAN_FETCH_TIMEOUT;
    Ok(Arc::new(runledger_core::plan::StaticPlanFetcher::new()))
}
