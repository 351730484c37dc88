// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::outbox::{DeliveryGranularity, OutboxWorkerConfig};
use crate::plan::PlanRefPolicy;
use crate::provider::ProviderName;
use crate::rate_limit::RateLimitConfig;

/// Runledger configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL for the run state store
    pub database_url: String,
    /// Provider override; must name a registered adapter when set
    pub engine_provider: Option<String>,
    /// Provider tried before the built-in priority list
    pub default_provider: Option<ProviderName>,
    /// Outbox worker settings
    pub outbox: OutboxWorkerConfig,
    /// Per-tenant token bucket
    pub rate_limit: RateLimitConfig,
    /// Schemes accepted for plan URIs
    pub plan_allowed_schemes: Vec<String>,
    /// Hosts accepted for http(s) plan URIs
    pub plan_allowed_hosts: Vec<String>,
    /// Prefixes accepted for object-storage plan URIs
    pub plan_allowed_prefixes: Vec<String>,
    /// Layers per durable execution before continue-as-new (0 = off)
    pub continue_as_new_after_layers: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `RUNLEDGER_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `RUNLEDGER_ENGINE_PROVIDER`: provider override (unset)
    /// - `RUNLEDGER_DEFAULT_PROVIDER`: fallback provider (unset)
    /// - `RUNLEDGER_OUTBOX_BATCH_SIZE` (100), `RUNLEDGER_OUTBOX_MAX_ATTEMPTS` (5),
    ///   `RUNLEDGER_OUTBOX_POLL_INTERVAL_MS` (1000), `RUNLEDGER_OUTBOX_GRANULARITY` (batch)
    /// - `RUNLEDGER_RATE_LIMIT_CAPACITY` (1000), `RUNLEDGER_RATE_LIMIT_REFILL_PER_SEC` (100)
    /// - `RUNLEDGER_PLAN_ALLOWED_SCHEMES` (https,s3,gs), `RUNLEDGER_PLAN_ALLOWED_HOSTS`,
    ///   `RUNLEDGER_PLAN_ALLOWED_PREFIXES` (comma lists)
    /// - `RUNLEDGER_CONTINUE_AS_NEW_AFTER_LAYERS` (0)
    ///
    /// The override is validated only when an adapter is selected, so an
    /// unknown name surfaces as `ENGINE_PROVIDER_INVALID` at that point.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("RUNLEDGER_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("RUNLEDGER_DATABASE_URL"))?;

        let engine_provider = optional("RUNLEDGER_ENGINE_PROVIDER");
        let default_provider = optional("RUNLEDGER_DEFAULT_PROVIDER")
            .map(|raw| raw.parse::<ProviderName>())
            .transpose()
            .map_err(|_| {
                ConfigError::Invalid("RUNLEDGER_DEFAULT_PROVIDER", "must be 'durable' or 'mock'")
            })?;

        let batch_size: usize = parsed(
            "RUNLEDGER_OUTBOX_BATCH_SIZE",
            "100",
            "must be a positive integer",
        )?;
        let max_attempts: u32 = parsed(
            "RUNLEDGER_OUTBOX_MAX_ATTEMPTS",
            "5",
            "must be a positive integer",
        )?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid(
                "RUNLEDGER_OUTBOX_BATCH_SIZE",
                "must be a positive integer",
            ));
        }
        if max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "RUNLEDGER_OUTBOX_MAX_ATTEMPTS",
                "must be a positive integer",
            ));
        }
        let poll_interval_ms: u64 = parsed(
            "RUNLEDGER_OUTBOX_POLL_INTERVAL_MS",
            "1000",
            "must be a number of milliseconds",
        )?;
        let granularity: DeliveryGranularity = parsed(
            "RUNLEDGER_OUTBOX_GRANULARITY",
            "batch",
            "must be 'batch' or 'per_record'",
        )?;

        let capacity: f64 = parsed(
            "RUNLEDGER_RATE_LIMIT_CAPACITY",
            "1000",
            "must be a positive number",
        )?;
        let refill_per_second: f64 = parsed(
            "RUNLEDGER_RATE_LIMIT_REFILL_PER_SEC",
            "100",
            "must be a non-negative number",
        )?;
        if !(capacity.is_finite() && capacity > 0.0) {
            return Err(ConfigError::Invalid(
                "RUNLEDGER_RATE_LIMIT_CAPACITY",
                "must be a positive number",
            ));
        }
        if !(refill_per_second.is_finite() && refill_per_second >= 0.0) {
            return Err(ConfigError::Invalid(
                "RUNLEDGER_RATE_LIMIT_REFILL_PER_SEC",
                "must be a non-negative number",
            ));
        }

        let plan_allowed_schemes = list("RUNLEDGER_PLAN_ALLOWED_SCHEMES", "https,s3,gs");
        if plan_allowed_schemes.is_empty() {
            return Err(ConfigError::Invalid(
                "RUNLEDGER_PLAN_ALLOWED_SCHEMES",
                "must list at least one scheme",
            ));
        }

        Ok(Self {
            database_url,
            engine_provider,
            default_provider,
            outbox: OutboxWorkerConfig {
                batch_size,
                max_attempts,
                poll_interval: Duration::from_millis(poll_interval_ms),
                granularity,
            },
            rate_limit: RateLimitConfig {
                capacity,
                refill_per_second,
            },
            plan_allowed_schemes,
            plan_allowed_hosts: list("RUNLEDGER_PLAN_ALLOWED_HOSTS", ""),
            plan_allowed_prefixes: list("RUNLEDGER_PLAN_ALLOWED_PREFIXES", ""),
            continue_as_new_after_layers: parsed(
                "RUNLEDGER_CONTINUE_AS_NEW_AFTER_LAYERS",
                "0",
                "must be a non-negative integer",
            )?,
        })
    }

    /// Plan URI policy built from the allow-lists.
    pub fn plan_policy(&self) -> PlanRefPolicy {
        PlanRefPolicy::new(&self.plan_allowed_schemes)
            .with_hosts(&self.plan_allowed_hosts)
            .with_prefixes(&self.plan_allowed_prefixes)
    }
}

fn optional(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: FromStr>(
    var: &'static str,
    default: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    optional(var)
        .unwrap_or_else(|| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(var, reason))
}

fn list(var: &str, default: &str) -> Vec<String> {
    std::env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
