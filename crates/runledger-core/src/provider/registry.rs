// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Adapter registry and selection.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::{ProviderAdapter, ProviderName};
use crate::error::{CoreError, Result};

/// Registered adapters, at most one per provider.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<ProviderName, Arc<dyn ProviderAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

impl AdapterRegistry {
    /// Build a registry. Fails with `ADAPTER_DUPLICATE_PROVIDER` if two
    /// adapters claim the same provider.
    pub fn new(adapters: impl IntoIterator<Item = Arc<dyn ProviderAdapter>>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for adapter in adapters {
            let provider = adapter.provider();
            if map.insert(provider, adapter).is_some() {
                return Err(CoreError::AdapterDuplicateProvider {
                    provider: provider.to_string(),
                });
            }
        }
        Ok(Self { adapters: map })
    }

    /// Registered providers in name order.
    pub fn providers(&self) -> Vec<ProviderName> {
        self.adapters.keys().copied().collect()
    }

    /// Adapter for `provider`, failing with `ADAPTER_NOT_REGISTERED`.
    pub fn get(&self, provider: ProviderName) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| CoreError::AdapterNotRegistered {
                provider: provider.to_string(),
            })
    }

    /// Pick an adapter.
    ///
    /// An explicit `requested` provider must parse and be registered; it is
    /// never silently replaced. Without one, the first registered adapter in
    /// `configured_default` then [`ProviderName::PRIORITY`] wins.
    pub fn select(
        &self,
        requested: Option<&str>,
        configured_default: Option<ProviderName>,
    ) -> Result<Arc<dyn ProviderAdapter>> {
        if let Some(raw) = requested {
            let provider: ProviderName = raw.parse()?;
            return self.get(provider);
        }

        configured_default
            .into_iter()
            .chain(ProviderName::PRIORITY)
            .find_map(|provider| self.adapters.get(&provider).cloned())
            .inspect(|adapter| debug!(provider = %adapter.provider(), "Selected fallback adapter"))
            .ok_or(CoreError::NoAdaptersRegistered)
    }
}
