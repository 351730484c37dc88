// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runledger-core.
//!
//! Every error carries a stable string code (see [`CoreError::error_code`]).
//! Callers and the HTTP front door match on the code or the variant, never on
//! the human-readable message.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Broad error categories used for retry and status-code mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input from the caller; surfaced as-is, never retried.
    Validation,
    /// Security gate rejection; fatal for the operation and audit-worthy.
    Security,
    /// A referenced run does not exist (or already exists).
    NotFound,
    /// Infrastructure failure; retried locally up to a bounded attempt count.
    Transient,
    /// Startup or selection-time misconfiguration.
    Configuration,
}

/// Core errors that can occur during engine, store and adapter operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// The execution plan body is malformed or its step graph is invalid.
    #[error("Invalid plan schema: {message}")]
    InvalidPlanSchema {
        /// What is wrong with the plan.
        message: String,
    },

    /// A step carries a field the selected adapter does not recognize.
    #[error("Step '{step_id}' has field '{field}' not supported by adapter '{provider}'")]
    InvalidStepSchema {
        /// Offending step.
        step_id: String,
        /// Unrecognized field name.
        field: String,
        /// Adapter that rejected the field.
        provider: String,
    },

    /// The plan's schema version could not be parsed.
    #[error("Unknown plan schema version '{schema_version}'")]
    PlanSchemaVersionUnknown {
        /// Raw schema version string.
        schema_version: String,
    },

    /// The plan's schema major version differs from the supported one.
    #[error("Plan schema version '{schema_version}' has unsupported major (supported: {supported})")]
    UnsupportedMajor {
        /// Declared schema version.
        schema_version: String,
        /// Supported schema version.
        supported: String,
    },

    /// The plan's schema minor version is newer than the engine understands.
    #[error("Plan schema version '{schema_version}' is newer than supported {supported}")]
    TooNew {
        /// Declared schema version.
        schema_version: String,
        /// Supported schema version.
        supported: String,
    },

    /// The plan's schema minor version is older than the backward window.
    #[error("Plan schema version '{schema_version}' is older than the supported window of {supported}")]
    TooOld {
        /// Declared schema version.
        schema_version: String,
        /// Supported schema version.
        supported: String,
    },

    /// A step-scoped event was keyed without a step id.
    #[error("Event type '{event_type}' requires a step id")]
    MissingStepId {
        /// Event type that needed the step id.
        event_type: String,
    },

    /// An idempotency key input is empty or contains the key delimiter.
    #[error("Invalid idempotency key field '{field}': {reason}")]
    IdempotencyFieldInvalid {
        /// Field name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// Plan URI failed the allow-list policy.
    #[error("Plan URI '{uri}' is not allowed: {reason}")]
    PlanUriNotAllowed {
        /// Rejected URI.
        uri: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Fetched plan bytes do not match the declared digest.
    #[error("Plan integrity validation failed for '{uri}': expected {expected}, got {actual}")]
    PlanIntegrityValidationFailed {
        /// URI the bytes came from.
        uri: String,
        /// Declared digest (or size).
        expected: String,
        /// Computed digest (or size).
        actual: String,
    },

    /// Plan body and plan reference describe different artifacts.
    #[error("Plan reference mismatch on '{field}': reference says '{expected}', plan says '{actual}'")]
    PlanRefMismatch {
        /// Field that disagrees.
        field: &'static str,
        /// Value from the reference.
        expected: String,
        /// Value from the plan body.
        actual: String,
    },

    /// Plan reference is past its expiry.
    #[error("Plan reference for '{uri}' expired at {expires_at}")]
    PlanRefExpired {
        /// Plan URI.
        uri: String,
        /// Declared expiry.
        expires_at: String,
    },

    /// The byte fetcher failed.
    #[error("Failed to fetch plan '{uri}': {reason}")]
    PlanFetchFailed {
        /// Plan URI.
        uri: String,
        /// Fetcher error.
        reason: String,
    },

    /// The caller is not allowed to act on the tenant (or run).
    #[error("Access denied for principal '{principal}' on tenant '{tenant_id}'")]
    AuthzDenied {
        /// Tenant the request targeted.
        tenant_id: String,
        /// Principal that made the request.
        principal: String,
        /// Run involved, if any.
        run_id: Option<String>,
    },

    /// Run has no backend execution.
    #[error("Run '{run_id}' not found")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// Run metadata is absent from the state store.
    #[error("Run metadata for '{run_id}' not found")]
    RunMetadataNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// Run metadata already exists (duplicate bootstrap).
    #[error("Run '{run_id}' already exists")]
    RunAlreadyExists {
        /// The run ID that already exists.
        run_id: String,
    },

    /// Run already has a different provider reference.
    #[error("Run '{run_id}' already has a provider reference")]
    ProviderRefAlreadySet {
        /// The run ID.
        run_id: String,
    },

    /// The tenant's token bucket cannot cover the request.
    #[error("Tenant '{tenant_id}' is rate limited (requested {requested})")]
    RateLimited {
        /// Throttled tenant.
        tenant_id: String,
        /// Tokens requested.
        requested: u32,
        /// Run the write was for.
        run_id: Option<String>,
    },

    /// The plan's target adapter disagrees with the caller's choice.
    #[error("Plan targets adapter '{plan_target}' but request asked for '{requested}'")]
    TargetAdapterMismatch {
        /// Adapter named by the plan metadata.
        plan_target: String,
        /// Adapter named by the request context.
        requested: String,
    },

    /// The plan requires a capability the adapter does not have.
    #[error("Adapter '{provider}' does not support capability '{capability}'")]
    CapabilityUnsupported {
        /// Selected adapter.
        provider: String,
        /// Missing capability.
        capability: String,
    },

    /// Two adapters were registered under the same provider name.
    #[error("Duplicate adapter registered for provider: {provider}")]
    AdapterDuplicateProvider {
        /// Duplicated provider.
        provider: String,
    },

    /// A provider name could not be parsed.
    #[error("Invalid engine provider: '{value}'")]
    EngineProviderInvalid {
        /// Raw value.
        value: String,
    },

    /// Explicitly requested provider has no registered adapter.
    #[error("No adapter registered for provider: {provider}")]
    AdapterNotRegistered {
        /// Requested provider.
        provider: String,
    },

    /// Registry is empty.
    #[error("No adapters registered")]
    NoAdaptersRegistered,

    /// Event bus rejected an outbox batch.
    #[error("Failed to publish {batch_size} outbox record(s): {reason}")]
    PublishFailed {
        /// Records in the failed publish.
        batch_size: usize,
        /// Bus error.
        reason: String,
    },

    /// Backend dispatch/query/cancel/signal failed.
    #[error("Provider '{provider}' error: {reason}")]
    ProviderError {
        /// Provider name.
        provider: String,
        /// Run involved, if any.
        run_id: Option<String>,
        /// Backend error.
        reason: String,
    },

    /// A step failed permanently inside a durable execution.
    #[error("Step '{step_id}' of run '{run_id}' failed: {reason}")]
    StepFailed {
        /// Run ID.
        run_id: String,
        /// Step ID.
        step_id: String,
        /// Failure description.
        reason: String,
    },

    /// A value cannot be represented in canonical JSON.
    #[error("Value is not canonicalizable: {reason}")]
    NonCanonicalValue {
        /// Why.
        reason: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// JSON (de)serialization failed.
    #[error("Serialization error: {details}")]
    SerializationError {
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the stable error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidPlanSchema { .. } => "INVALID_PLAN_SCHEMA",
            Self::InvalidStepSchema { .. } => "INVALID_STEP_SCHEMA",
            Self::PlanSchemaVersionUnknown { .. } => "PLAN_SCHEMA_VERSION_UNKNOWN",
            Self::UnsupportedMajor { .. } => "UNSUPPORTED_MAJOR",
            Self::TooNew { .. } => "TOO_NEW",
            Self::TooOld { .. } => "TOO_OLD",
            Self::MissingStepId { .. } => "MISSING_STEP_ID",
            Self::IdempotencyFieldInvalid { .. } => "IDEMPOTENCY_FIELD_INVALID",
            Self::PlanUriNotAllowed { .. } => "PLAN_URI_NOT_ALLOWED",
            Self::PlanIntegrityValidationFailed { .. } => "PLAN_INTEGRITY_VALIDATION_FAILED",
            Self::PlanRefMismatch { .. } => "PLAN_REF_MISMATCH",
            Self::PlanRefExpired { .. } => "PLAN_REF_EXPIRED",
            Self::PlanFetchFailed { .. } => "PLAN_FETCH_FAILED",
            Self::AuthzDenied { .. } => "AUTHZ_DENIED",
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::RunMetadataNotFound { .. } => "RUN_METADATA_NOT_FOUND",
            Self::RunAlreadyExists { .. } => "RUN_ALREADY_EXISTS",
            Self::ProviderRefAlreadySet { .. } => "PROVIDER_REF_ALREADY_SET",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::TargetAdapterMismatch { .. } => "TARGET_ADAPTER_MISMATCH",
            Self::CapabilityUnsupported { .. } => "CAPABILITY_UNSUPPORTED",
            Self::AdapterDuplicateProvider { .. } => "ADAPTER_DUPLICATE_PROVIDER",
            Self::EngineProviderInvalid { .. } => "ENGINE_PROVIDER_INVALID",
            Self::AdapterNotRegistered { .. } => "ADAPTER_NOT_REGISTERED",
            Self::NoAdaptersRegistered => "NO_ADAPTERS_REGISTERED",
            Self::PublishFailed { .. } => "PUBLISH_FAILED",
            Self::ProviderError { .. } => "PROVIDER_ERROR",
            Self::StepFailed { .. } => "STEP_FAILED",
            Self::NonCanonicalValue { .. } => "NON_CANONICAL_VALUE",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::SerializationError { .. } => "SERIALIZATION_ERROR",
        }
    }

    /// Category used for retry decisions and status-code mapping.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidPlanSchema { .. }
            | Self::InvalidStepSchema { .. }
            | Self::PlanSchemaVersionUnknown { .. }
            | Self::UnsupportedMajor { .. }
            | Self::TooNew { .. }
            | Self::TooOld { .. }
            | Self::MissingStepId { .. }
            | Self::IdempotencyFieldInvalid { .. }
            | Self::PlanRefMismatch { .. }
            | Self::PlanRefExpired { .. }
            | Self::TargetAdapterMismatch { .. }
            | Self::CapabilityUnsupported { .. }
            | Self::RateLimited { .. }
            | Self::StepFailed { .. }
            | Self::NonCanonicalValue { .. }
            | Self::ValidationError { .. } => ErrorCategory::Validation,
            Self::PlanUriNotAllowed { .. }
            | Self::PlanIntegrityValidationFailed { .. }
            | Self::AuthzDenied { .. } => ErrorCategory::Security,
            Self::RunNotFound { .. }
            | Self::RunMetadataNotFound { .. }
            | Self::RunAlreadyExists { .. }
            | Self::ProviderRefAlreadySet { .. } => ErrorCategory::NotFound,
            Self::PlanFetchFailed { .. }
            | Self::PublishFailed { .. }
            | Self::ProviderError { .. }
            | Self::DatabaseError { .. }
            | Self::SerializationError { .. } => ErrorCategory::Transient,
            Self::AdapterDuplicateProvider { .. }
            | Self::EngineProviderInvalid { .. }
            | Self::AdapterNotRegistered { .. }
            | Self::NoAdaptersRegistered => ErrorCategory::Configuration,
        }
    }

    /// Whether a local retry may succeed.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Run this error relates to, when known.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::RunNotFound { run_id }
            | Self::RunMetadataNotFound { run_id }
            | Self::RunAlreadyExists { run_id }
            | Self::ProviderRefAlreadySet { run_id }
            | Self::StepFailed { run_id, .. } => Some(run_id),
            Self::AuthzDenied { run_id, .. }
            | Self::RateLimited { run_id, .. }
            | Self::ProviderError { run_id, .. } => run_id.as_deref(),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError {
            details: err.to_string(),
        }
    }
}
