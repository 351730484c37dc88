// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runledger Core - Event-Sourced Workflow Orchestration
//!
//! This crate accepts content-addressed execution plans, dispatches them to a
//! pluggable execution backend, and records every run as an append-only event
//! log. Run status is never stored; it is always projected from the log.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Callers                                     │
//! │              (RequestContext: tenant, project, principal)                │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          WorkflowEngine                                  │
//! │   authz → URI policy → expiry → fetch + SHA-256 → schema → adapter      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                              │
//!           │ bootstrap / provider ref                     │ start / cancel / signal
//!           ▼                                              ▼
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │    RunStateStore      │◄───────────────────│     ProviderAdapter         │
//! │  events + outbox      │   appended events  │   (durable, mock)           │
//! │  (SQLite / memory)    │                    │                             │
//! └───────────────────────┘                    └─────────────────────────────┘
//!           │
//!           ▼
//! ┌───────────────────────┐         ┌───────────────────────┐
//! │     OutboxWorker      │────────▶│       EventBus        │
//! │  retry, dead letters  │         │                       │
//! └───────────────────────┘         └───────────────────────┘
//! ```
//!
//! # Engine Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `start_run` | Validate a plan reference, bootstrap the run, dispatch to an adapter |
//! | `cancel_run` | Ask the owning adapter to cancel a dispatched run |
//! | `signal` | Deliver pause/resume/cancel, deduplicated by signal key |
//! | `get_run_status` | Rebuild a snapshot from the event log |
//!
//! ## Start Semantics
//!
//! Starting is idempotent per run id:
//!
//! 1. **First call**: the run is bootstrapped (metadata + `RunQueued`) in one transaction
//! 2. **Repeat call, already dispatched**: the stored provider ref is returned, `deduplicated = true`
//! 3. **Repeat call, crashed before dispatch**: dispatch resumes; the provider ref is set at most once
//!
//! No adapter is contacted before every gate check has passed.
//!
//! # Run Status State Machine
//!
//! ```text
//!                     ┌─────────┐
//!                     │ PENDING │
//!                     └────┬────┘
//!                          │ RunStarted
//!                          ▼
//!                     ┌─────────┐   RunPaused     ┌────────┐
//!          ┌──────────│ RUNNING │────────────────▶│ PAUSED │
//!          │          └────┬────┘◀────────────────└────────┘
//!          │               │        RunResumed
//!   RunFailed         RunCompleted     RunCancelled
//!          │               │               │
//!          ▼               ▼               ▼
//!     ┌────────┐    ┌───────────┐   ┌───────────┐
//!     │ FAILED │    │ COMPLETED │   │ CANCELLED │
//!     └────────┘    └───────────┘   └───────────┘
//! ```
//!
//! Terminal statuses absorb every later run-level event.
//!
//! # Configuration
//!
//! The `runledger` binary loads configuration from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `RUNLEDGER_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `RUNLEDGER_ENGINE_PROVIDER` | No | - | Provider override (`durable`, `mock`) |
//! | `RUNLEDGER_DEFAULT_PROVIDER` | No | - | Preferred fallback provider |
//! | `RUNLEDGER_OUTBOX_BATCH_SIZE` | No | `100` | Outbox records per tick |
//! | `RUNLEDGER_OUTBOX_MAX_ATTEMPTS` | No | `5` | Attempts before dead-lettering |
//! | `RUNLEDGER_OUTBOX_POLL_INTERVAL_MS` | No | `1000` | Outbox poll interval |
//! | `RUNLEDGER_OUTBOX_GRANULARITY` | No | `batch` | `batch` or `per_record` |
//! | `RUNLEDGER_RATE_LIMIT_CAPACITY` | No | `1000` | Token bucket size per tenant |
//! | `RUNLEDGER_RATE_LIMIT_REFILL_PER_SEC` | No | `100` | Tokens refilled per second |
//! | `RUNLEDGER_PLAN_ALLOWED_SCHEMES` | No | `https,s3,gs` | Plan URI schemes |
//! | `RUNLEDGER_PLAN_ALLOWED_HOSTS` | No | - | Plan URI host allow-list |
//! | `RUNLEDGER_PLAN_ALLOWED_PREFIXES` | No | - | Plan URI prefix allow-list |
//! | `RUNLEDGER_CONTINUE_AS_NEW_AFTER_LAYERS` | No | `0` | Durable history rollover (0 = off) |
//!
//! # Modules
//!
//! - [`engine`]: The orchestration facade
//! - [`plan`]: Plan references, URI policy, fetching and integrity checks
//! - [`provider`]: Adapter trait, registry, durable and mock backends
//! - [`persistence`]: Run state store trait with SQLite and in-memory backends
//! - [`projector`]: Snapshot projection from the event log
//! - [`outbox`]: Outbox worker and event bus
//! - [`runtime`]: Embeddable runtime owning the outbox worker

#![deny(missing_docs)]

/// Authorization gate and request context.
pub mod authz;

/// Canonical JSON encoding and hashing.
pub mod canonical;

/// Injectable time source.
pub mod clock;

/// Configuration loaded from environment variables.
pub mod config;

/// The workflow engine facade.
pub mod engine;

/// Error types with stable error codes.
pub mod error;

/// Run event model.
pub mod events;

/// Idempotency key derivation.
pub mod idempotency;

mod keyed_lock;

/// Embedded SQL migrations.
pub mod migrations;

/// Transactional outbox worker and event bus.
pub mod outbox;

/// Run state storage backends.
pub mod persistence;

/// Execution plans, reference policy and integrity checks.
pub mod plan;

/// Snapshot projection from the event log.
pub mod projector;

/// Execution backend adapters.
pub mod provider;

/// Per-tenant token bucket rate limiting.
pub mod rate_limit;

/// Embeddable runtime.
pub mod runtime;

pub use error::{CoreError, Result};
