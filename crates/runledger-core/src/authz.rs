// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authorization gate for engine operations.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tracing::warn;

use crate::error::{CoreError, Result};

/// Engine operations subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Start a run.
    StartRun,
    /// Cancel a run.
    CancelRun,
    /// Signal a run.
    Signal,
    /// Read a run's status.
    ReadStatus,
}

/// Caller identity and scope for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Tenant the request acts on.
    pub tenant_id: String,
    /// Project within the tenant.
    pub project_id: String,
    /// Environment within the project.
    pub environment_id: String,
    /// Authenticated principal.
    pub principal: String,
    /// Provider explicitly requested by the caller.
    pub provider: Option<String>,
}

impl RequestContext {
    /// Context without a provider preference.
    pub fn new(
        tenant_id: impl Into<String>,
        project_id: impl Into<String>,
        environment_id: impl Into<String>,
        principal: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
            environment_id: environment_id.into(),
            principal: principal.into(),
            provider: None,
        }
    }

    /// Request a specific provider.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub(crate) fn denied(&self, run_id: Option<&str>) -> CoreError {
        CoreError::AuthzDenied {
            tenant_id: self.tenant_id.clone(),
            principal: self.principal.clone(),
            run_id: run_id.map(str::to_string),
        }
    }
}

/// Decides whether a request may proceed.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Fail with `AUTHZ_DENIED` to reject.
    async fn authorize(&self, ctx: &RequestContext, action: Action, run_id: Option<&str>)
    -> Result<()>;
}

/// Authorizer that admits everything. For local development and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAuthorizer;

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
    async fn authorize(
        &self,
        _ctx: &RequestContext,
        _action: Action,
        _run_id: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Admits a principal only on tenants it has been granted.
#[derive(Debug, Clone, Default)]
pub struct TenantAllowListAuthorizer {
    grants: HashMap<String, HashSet<String>>,
    read_only: HashSet<(String, String)>,
}

impl TenantAllowListAuthorizer {
    /// Authorizer with no grants.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `principal` every action on `tenant_id`.
    pub fn grant(mut self, principal: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        self.grants
            .entry(principal.into())
            .or_default()
            .insert(tenant_id.into());
        self
    }

    /// Grant `principal` only [`Action::ReadStatus`] on `tenant_id`.
    pub fn grant_read_only(
        mut self,
        principal: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        self.read_only.insert((principal.into(), tenant_id.into()));
        self
    }

    fn allows(&self, ctx: &RequestContext, action: Action) -> bool {
        let full = self
            .grants
            .get(&ctx.principal)
            .is_some_and(|tenants| tenants.contains(&ctx.tenant_id));
        full || (action == Action::ReadStatus
            && self
                .read_only
                .contains(&(ctx.principal.clone(), ctx.tenant_id.clone())))
    }
}

#[async_trait]
impl Authorizer for TenantAllowListAuthorizer {
    async fn authorize(
        &self,
        ctx: &RequestContext,
        action: Action,
        run_id: Option<&str>,
    ) -> Result<()> {
        if self.allows(ctx, action) {
            return Ok(());
        }
        warn!(
            tenant_id = %ctx.tenant_id,
            principal = %ctx.principal,
            ?action,
            run_id = run_id.unwrap_or(""),
            code = "AUTHZ_DENIED",
            "Authorization denied"
        );
        Err(ctx.denied(run_id))
    }
}
