// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idempotency key derivation.
//!
//! Keys are SHA-256 hex digests over a `|`-joined preimage:
//!
//! ```text
//! run events:  eventType|runId|logicalAttemptId|planId|planVersion|stepSlot
//! signals:     SIGNAL|tenantId|runId|signalId
//! ```
//!
//! `stepSlot` is the step id for step-scoped events and `RUN` otherwise. Keys
//! are derived from the logical (business) attempt only. An infrastructure
//! retry of the same logical attempt replays the same key; an operator re-run
//! bumps the logical attempt and mints a new one.
//!
//! The output is a published contract. Golden vectors live in the tests below
//! and must not change.

use uuid::Uuid;

use crate::canonical::sha256_hex;
use crate::error::{CoreError, Result};
use crate::events::EventType;

/// Joins preimage fields. Field values may never contain it.
pub const KEY_DELIMITER: char = '|';

/// Step slot used for run-scoped events.
pub const RUN_SCOPE_SENTINEL: &str = "RUN";

const SIGNAL_PREFIX: &str = "SIGNAL";

fn checked<'a>(field: &'static str, value: &'a str) -> Result<&'a str> {
    if value.is_empty() {
        return Err(CoreError::IdempotencyFieldInvalid {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    if value.contains(KEY_DELIMITER) {
        return Err(CoreError::IdempotencyFieldInvalid {
            field,
            reason: format!("must not contain '{}'", KEY_DELIMITER),
        });
    }
    Ok(value)
}

fn digest(parts: &[&str]) -> String {
    let preimage = parts.join(&KEY_DELIMITER.to_string());
    sha256_hex(preimage.as_bytes())
}

/// Derive the dedup key for a lifecycle event.
///
/// Fails with `MISSING_STEP_ID` when a step-scoped event has no step id, and
/// with `IDEMPOTENCY_FIELD_INVALID` when any field is empty or contains the
/// delimiter. For run-scoped events any supplied step id is ignored.
pub fn run_event_key(
    event_type: &EventType,
    run_id: &str,
    logical_attempt_id: u32,
    plan_id: &str,
    plan_version: &str,
    step_id: Option<&str>,
) -> Result<String> {
    let step_slot = if event_type.is_step_scoped() {
        match step_id {
            Some(step) if !step.is_empty() => checked("stepId", step)?,
            _ => {
                return Err(CoreError::MissingStepId {
                    event_type: event_type.as_str().to_string(),
                });
            }
        }
    } else {
        RUN_SCOPE_SENTINEL
    };

    let attempt = logical_attempt_id.to_string();
    Ok(digest(&[
        checked("eventType", event_type.as_str())?,
        checked("runId", run_id)?,
        &attempt,
        checked("planId", plan_id)?,
        checked("planVersion", plan_version)?,
        step_slot,
    ]))
}

/// Derive the dedup key for an externally issued signal.
pub fn signal_key(tenant_id: &str, run_id: &str, signal_id: &str) -> Result<String> {
    Ok(digest(&[
        SIGNAL_PREFIX,
        checked("tenantId", tenant_id)?,
        checked("runId", run_id)?,
        checked("signalId", signal_id)?,
    ]))
}

/// Mint a random event id. Not idempotent; used only for log correlation.
pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}
