// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plan integrity validation.

use tracing::{debug, warn};

use super::{ExecutionPlan, PlanFetcher, PlanRef};
use crate::canonical::sha256_hex;
use crate::error::{CoreError, Result};

/// Fetch the referenced bytes, verify them, then parse and cross-check.
///
/// Order matters: the digest (then the declared size) is checked before the
/// bytes are parsed, and the parsed plan must agree with the reference on
/// `planId`, `planVersion` and `schemaVersion`.
pub async fn fetch_and_validate(
    plan_ref: &PlanRef,
    fetcher: &dyn PlanFetcher,
) -> Result<ExecutionPlan> {
    let bytes = fetcher.fetch(plan_ref).await?;

    let actual = sha256_hex(&bytes);
    if !actual.eq_ignore_ascii_case(plan_ref.sha256.trim()) {
        warn!(
            uri = %plan_ref.uri,
            expected = %plan_ref.sha256,
            actual = %actual,
            "Plan integrity validation failed"
        );
        return Err(CoreError::PlanIntegrityValidationFailed {
            uri: plan_ref.uri.clone(),
            expected: plan_ref.sha256.clone(),
            actual,
        });
    }

    if let Some(expected_size) = plan_ref.size_bytes
        && expected_size != bytes.len() as u64
    {
        warn!(uri = %plan_ref.uri, expected_size, actual_size = bytes.len(), "Plan size mismatch");
        return Err(CoreError::PlanIntegrityValidationFailed {
            uri: plan_ref.uri.clone(),
            expected: format!("{} bytes", expected_size),
            actual: format!("{} bytes", bytes.len()),
        });
    }

    let plan = ExecutionPlan::from_slice(&bytes)?;
    let checks: [(&'static str, &str, &str); 3] = [
        ("planId", &plan_ref.plan_id, &plan.metadata.plan_id),
        ("planVersion", &plan_ref.plan_version, &plan.metadata.plan_version),
        (
            "schemaVersion",
            &plan_ref.schema_version,
            &plan.metadata.schema_version,
        ),
    ];
    for (field, expected, actual) in checks {
        if expected != actual {
            return Err(CoreError::PlanRefMismatch {
                field,
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }

    debug!(uri = %plan_ref.uri, plan_id = %plan.metadata.plan_id, steps = plan.steps.len(), "Plan verified");
    Ok(plan)
}
