// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for runledger-core.
//!
//! This module provides [`EngineRuntime`] which owns the run state store, the
//! event bus and the outbox worker task, so the engine can be embedded into an
//! existing tokio application instead of running the `runledger` binary.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runledger_core::outbox::TracingEventBus;
//! use runledger_core::persistence::SqliteRunStateStore;
//! use runledger_core::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteRunStateStore::connect("sqlite://runs.db").await?);
//!
//!     let runtime = EngineRuntime::builder()
//!         .store(store)
//!         .bus(Arc::new(TracingEventBus))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     // Graceful shutdown
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::engine::WorkflowEngine;
use crate::outbox::{EventBus, OutboxWorker, OutboxWorkerConfig};
use crate::persistence::RunStateStore;

/// Builder for creating an [`EngineRuntime`].
#[derive(Default)]
pub struct EngineRuntimeBuilder {
    store: Option<Arc<dyn RunStateStore>>,
    bus: Option<Arc<dyn EventBus>>,
    engine: Option<Arc<WorkflowEngine>>,
    outbox: OutboxWorkerConfig,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("bus", &self.bus.as_ref().map(|_| "..."))
            .field("engine", &self.engine.as_ref().map(|_| "..."))
            .field("outbox", &self.outbox)
            .finish()
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the run state store (required).
    pub fn store(mut self, store: Arc<dyn RunStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the event bus the outbox drains to (required).
    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Attach an engine so callers can reach it through the runtime.
    pub fn engine(mut self, engine: Arc<WorkflowEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the outbox worker settings.
    ///
    /// Default: batch size 100, 5 attempts, 1s poll interval, batch granularity.
    pub fn outbox(mut self, config: OutboxWorkerConfig) -> Self {
        self.outbox = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let bus = self.bus.ok_or_else(|| anyhow::anyhow!("bus is required"))?;

        Ok(EngineRuntimeConfig {
            store,
            bus,
            engine: self.engine,
            outbox: self.outbox,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    store: Arc<dyn RunStateStore>,
    bus: Arc<dyn EventBus>,
    engine: Option<Arc<WorkflowEngine>>,
    outbox: OutboxWorkerConfig,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("store", &"...")
            .field("bus", &"...")
            .field("outbox", &self.outbox)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Start the runtime, spawning the outbox worker task.
    pub async fn start(self) -> Result<EngineRuntime> {
        let worker = Arc::new(OutboxWorker::new(
            self.store.clone(),
            self.bus,
            self.outbox,
        ));
        let shutdown = worker.shutdown_handle();
        let worker_handle = tokio::spawn(worker.clone().run());

        info!("EngineRuntime started");

        Ok(EngineRuntime {
            worker_handle,
            shutdown,
            worker,
            store: self.store,
            engine: self.engine,
        })
    }
}

/// A running runledger instance embedded in an application.
///
/// The runtime manages:
/// - the outbox worker loop delivering committed events to the bus
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    worker_handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
    worker: Arc<OutboxWorker>,
    store: Arc<dyn RunStateStore>,
    engine: Option<Arc<WorkflowEngine>>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// The run state store.
    pub fn store(&self) -> &Arc<dyn RunStateStore> {
        &self.store
    }

    /// The attached engine, if any.
    pub fn engine(&self) -> Option<&Arc<WorkflowEngine>> {
        self.engine.as_ref()
    }

    /// The outbox worker, e.g. to force a tick.
    pub fn worker(&self) -> &Arc<OutboxWorker> {
        &self.worker
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the outbox worker to stop and waits for the in-flight tick.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        self.shutdown.notify_one();

        match self.worker_handle.await {
            Ok(()) => {
                info!("EngineRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Outbox worker task panicked: {}", e);
                Err(anyhow::anyhow!("outbox worker task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.worker_handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventType;
    use crate::outbox::InMemoryEventBus;
    use crate::persistence::InMemoryRunStateStore;
    use crate::persistence::test_support::{event, metadata};
    use std::time::Duration;

    #[test]
    fn test_builder_build_missing_store() {
        let result = EngineRuntime::builder()
            .bus(Arc::new(InMemoryEventBus::new()))
            .build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("store is required"));
    }

    #[test]
    fn test_builder_build_missing_bus() {
        let result = EngineRuntime::builder()
            .store(Arc::new(InMemoryRunStateStore::new()))
            .build();
        assert!(result.unwrap_err().to_string().contains("bus is required"));
    }

    #[test]
    fn test_builder_debug() {
        let builder = EngineRuntime::builder().store(Arc::new(InMemoryRunStateStore::new()));
        let debug_str = format!("{:?}", builder);
        assert!(debug_str.contains("EngineRuntimeBuilder"));
        assert!(debug_str.contains("..."));
        assert!(debug_str.contains("batch_size: 100"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_delivers_and_shuts_down() {
        let clock = ManualClock::epoch();
        let store = Arc::new(InMemoryRunStateStore::new());
        store
            .bootstrap_run_tx(
                &metadata("run-1", &clock),
                &[event(&clock, "run-1", EventType::RunQueued, None)],
            )
            .await
            .unwrap();

        let bus = Arc::new(InMemoryEventBus::new());
        let runtime = EngineRuntime::builder()
            .store(store.clone())
            .bus(bus.clone())
            .outbox(OutboxWorkerConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            })
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        assert!(runtime.is_running());
        assert!(runtime.engine().is_none());

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(bus.published().len(), 1);
        assert_eq!(runtime.store().count_pending_outbox().await.unwrap(), 0);

        runtime.shutdown().await.unwrap();
    }
}
