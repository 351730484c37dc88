// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution plans and plan references.
//!
//! A [`PlanRef`] is untrusted input. Before a plan is used:
//!
//! 1. [`PlanRefPolicy::validate_or_throw`] allow-lists the URI (no fetch yet)
//! 2. [`fetch_and_validate`] fetches the bytes and checks their SHA-256
//! 3. only then are the bytes parsed into an [`ExecutionPlan`] and cross-checked
//!    against the reference
//! 4. [`SchemaCompatibility::check`] gates the plan's schema version

pub mod fetch;
pub mod integrity;
pub mod policy;

pub use self::fetch::{PlanFetcher, StaticPlanFetcher};
#[cfg(feature = "http")]
pub use self::fetch::HttpPlanFetcher;
pub use self::integrity::fetch_and_validate;
pub use self::policy::PlanRefPolicy;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::parse_timestamp;
use crate::error::{CoreError, Result};

/// Content-addressed pointer to an execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRef {
    /// Where the plan bytes live.
    pub uri: String,
    /// Expected SHA-256 hex digest of the bytes.
    pub sha256: String,
    /// Declared schema version.
    pub schema_version: String,
    /// Declared plan id.
    pub plan_id: String,
    /// Declared plan version.
    pub plan_version: String,
    /// Expected byte length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Instant after which the reference must not be used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl PlanRef {
    /// Fail with `PLAN_REF_EXPIRED` if `expires_at` is in the past.
    ///
    /// An unparseable expiry is treated as expired.
    pub fn check_not_expired(&self, now: DateTime<Utc>) -> Result<()> {
        let Some(raw) = &self.expires_at else {
            return Ok(());
        };
        match parse_timestamp(raw) {
            Some(expires) if expires > now => Ok(()),
            _ => Err(CoreError::PlanRefExpired {
                uri: self.uri.clone(),
                expires_at: raw.clone(),
            }),
        }
    }
}

/// What to do when the selected adapter lacks a required capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackBehavior {
    /// Refuse the run.
    #[default]
    Reject,
    /// Log the missing capability and run anyway.
    Degrade,
}

/// Plan-level metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlanMetadata {
    /// Plan id.
    pub plan_id: String,
    /// Plan version.
    pub plan_version: String,
    /// Schema version the plan is written against.
    pub schema_version: String,
    /// Capabilities the executing adapter must support.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires_capabilities: Vec<String>,
    /// Behaviour when a required capability is missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_behavior: Option<FallbackBehavior>,
    /// Provider the plan must run on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_adapter: Option<String>,
}

/// One opaque unit of work.
///
/// `dependsOn` is kept as raw JSON so that malformed values reach the layer
/// scheduler and are reported there with a precise message. Fields beyond
/// `stepId`, `kind` and `dependsOn` land in `extra` and are checked against the
/// selected adapter's allow-list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    /// Step id, unique within the plan.
    pub step_id: String,
    /// Step kind, interpreted by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// A step id or an array of step ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Value>,
    /// Any other fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl PlanStep {
    /// Step with no dependencies or extra fields.
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            kind: None,
            depends_on: None,
            extra: BTreeMap::new(),
        }
    }

    /// Set `dependsOn`.
    pub fn depends_on(mut self, value: Value) -> Self {
        self.depends_on = Some(value);
        self
    }

    /// Names of the optional fields present on this step.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        let kind = self.kind.as_ref().map(|_| "kind");
        let depends_on = self.depends_on.as_ref().map(|_| "dependsOn");
        kind.into_iter()
            .chain(depends_on)
            .chain(self.extra.keys().map(String::as_str))
    }
}

/// A parsed, integrity-checked execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    /// Plan metadata.
    pub metadata: PlanMetadata,
    /// Steps in declaration order.
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    /// Parse plan bytes. Any structural problem is `INVALID_PLAN_SCHEMA`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let plan: Self =
            serde_json::from_slice(bytes).map_err(|e| CoreError::InvalidPlanSchema {
                message: e.to_string(),
            })?;
        plan.validate_shape()?;
        Ok(plan)
    }

    fn validate_shape(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(CoreError::InvalidPlanSchema {
                message: "plan has no steps".to_string(),
            });
        }
        if let Some(step) = self.steps.iter().find(|s| s.step_id.trim().is_empty()) {
            return Err(CoreError::InvalidPlanSchema {
                message: format!("step with empty stepId (kind {:?})", step.kind),
            });
        }
        Ok(())
    }

    /// Reject step fields outside `allowed`.
    pub fn check_step_fields(&self, provider: &str, allowed: &BTreeSet<&str>) -> Result<()> {
        for step in &self.steps {
            if let Some(field) = step.field_names().find(|f| !allowed.contains(f)) {
                return Err(CoreError::InvalidStepSchema {
                    step_id: step.step_id.clone(),
                    field: field.to_string(),
                    provider: provider.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// A `major.minor` schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaVersion {
    /// Major component; must match exactly.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
}

impl SchemaVersion {
    /// Parse `major.minor` or `major.minor.patch`. The patch is ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        let unknown = || CoreError::PlanSchemaVersionUnknown {
            schema_version: raw.to_string(),
        };
        let mut parts = raw.trim().split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(unknown)?;
        let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(unknown)?;
        match (parts.next(), parts.next()) {
            (None, None) => {}
            (Some(patch), None) if patch.parse::<u32>().is_ok() => {}
            _ => return Err(unknown()),
        }
        Ok(Self { major, minor })
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Accepted plan schema versions: same major, minor within a backward window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaCompatibility {
    /// Newest supported version.
    pub supported: SchemaVersion,
    /// How many minors below `supported` are still accepted.
    pub backward_window: u32,
}

impl Default for SchemaCompatibility {
    fn default() -> Self {
        Self {
            supported: SchemaVersion { major: 1, minor: 2 },
            backward_window: 2,
        }
    }
}

impl SchemaCompatibility {
    /// Check a declared schema version.
    pub fn check(&self, schema_version: &str) -> Result<SchemaVersion> {
        let version = SchemaVersion::parse(schema_version)?;
        let supported = self.supported.to_string();

        if version.major != self.supported.major {
            return Err(CoreError::UnsupportedMajor {
                schema_version: schema_version.to_string(),
                supported,
            });
        }
        if version.minor > self.supported.minor {
            return Err(CoreError::TooNew {
                schema_version: schema_version.to_string(),
                supported,
            });
        }
        if version.minor + self.backward_window < self.supported.minor {
            return Err(CoreError::TooOld {
                schema_version: schema_version.to_string(),
                supported,
            });
        }
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan_json() -> Value {
        json!({
            "metadata": {
                "planId": "plan-1",
                "planVersion": "3",
                "schemaVersion": "1.2",
                "requiresCapabilities": ["signals"],
                "fallbackBehavior": "degrade",
                "targetAdapter": "durable"
            },
            "steps": [
                {"stepId": "fetch", "kind": "http"},
                {"stepId": "store", "dependsOn": "fetch", "timeoutMs": 500}
            ]
        })
    }

    #[test]
    fn test_parse_plan() {
        let bytes = serde_json::to_vec(&plan_json()).unwrap();
        let plan = ExecutionPlan::from_slice(&bytes).unwrap();
        assert_eq!(plan.metadata.plan_id, "plan-1");
        assert_eq!(plan.metadata.fallback_behavior, Some(FallbackBehavior::Degrade));
        assert_eq!(plan.steps[1].depends_on, Some(json!("fetch")));
        assert_eq!(plan.steps[1].extra["timeoutMs"], json!(500));

        let fields: Vec<_> = plan.steps[1].field_names().collect();
        assert_eq!(fields, vec!["dependsOn", "timeoutMs"]);
    }

    #[test]
    fn test_invalid_plans_rejected() {
        for bad in [
            json!({"steps": []}),
            json!({"metadata": {"planId": "p", "planVersion": "1", "schemaVersion": "1.2"}, "steps": []}),
            json!({"metadata": {"planId": "p", "planVersion": "1", "schemaVersion": "1.2"}, "steps": [{"stepId": ""}]}),
            json!({"metadata": {"planId": "p", "planVersion": "1", "schemaVersion": "1.2", "fallbackBehavior": "pray"}, "steps": [{"stepId": "a"}]}),
        ] {
            let err = ExecutionPlan::from_slice(&serde_json::to_vec(&bad).unwrap()).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_PLAN_SCHEMA", "{}", bad);
        }
        let err = ExecutionPlan::from_slice(b"not json").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PLAN_SCHEMA");
    }

    #[test]
    fn test_step_field_allow_list() {
        let plan = ExecutionPlan::from_slice(&serde_json::to_vec(&plan_json()).unwrap()).unwrap();
        let allowed: BTreeSet<&str> = ["kind", "dependsOn"].into_iter().collect();
        let err = plan.check_step_fields("mock", &allowed).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STEP_SCHEMA");
        assert!(err.to_string().contains("timeoutMs"));

        let allowed: BTreeSet<&str> = ["kind", "dependsOn", "timeoutMs"].into_iter().collect();
        plan.check_step_fields("durable", &allowed).unwrap();
    }

    #[test]
    fn test_schema_compatibility() {
        let compat = SchemaCompatibility::default();
        assert!(compat.check("1.2").is_ok());
        assert!(compat.check("1.0").is_ok());
        assert!(compat.check("1.1.7").is_ok());
        assert_eq!(compat.check("2.0").unwrap_err().error_code(), "UNSUPPORTED_MAJOR");
        assert_eq!(compat.check("0.9").unwrap_err().error_code(), "UNSUPPORTED_MAJOR");
        assert_eq!(compat.check("1.3").unwrap_err().error_code(), "TOO_NEW");

        let narrow = SchemaCompatibility {
            supported: SchemaVersion { major: 1, minor: 5 },
            backward_window: 1,
        };
        assert_eq!(narrow.check("1.3").unwrap_err().error_code(), "TOO_OLD");
        assert!(narrow.check("1.4").is_ok());

        for raw in ["", "1", "one.two", "1.2.x", "1.2.3.4"] {
            assert_eq!(
                compat.check(raw).unwrap_err().error_code(),
                "PLAN_SCHEMA_VERSION_UNKNOWN",
                "{}",
                raw
            );
        }
    }

    #[test]
    fn test_plan_ref_expiry() {
        let now = parse_timestamp("2025-06-01T00:00:00.000Z").unwrap();
        let mut plan_ref = PlanRef {
            uri: "s3://plans/p.json".to_string(),
            sha256: "00".repeat(32),
            schema_version: "1.2".to_string(),
            plan_id: "p".to_string(),
            plan_version: "1".to_string(),
            size_bytes: None,
            expires_at: None,
        };
        plan_ref.check_not_expired(now).unwrap();

        plan_ref.expires_at = Some("2025-07-01T00:00:00Z".to_string());
        plan_ref.check_not_expired(now).unwrap();

        plan_ref.expires_at = Some("2025-05-01T00:00:00Z".to_string());
        assert_eq!(
            plan_ref.check_not_expired(now).unwrap_err().error_code(),
            "PLAN_REF_EXPIRED"
        );

        plan_ref.expires_at = Some("soon".to_string());
        assert!(plan_ref.check_not_expired(now).is_err());
    }
}
