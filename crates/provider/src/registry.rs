//! Explicit provider registry
//!
//! Maps each `ProviderKind` to at most one client. Registration is validated
//! up front so lookups never have to guess which implementation applies.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::{CloudProvider, ProviderKind};

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("provider already registered: {0}")]
    AlreadyRegistered(ProviderKind),
}

/// Registered provider clients, keyed by kind.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn CloudProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under its own `kind()`. Rejects duplicates.
    pub fn register(
        &mut self,
        provider: Arc<dyn CloudProvider>,
    ) -> Result<(), RegistryError> {
        let kind = provider.kind();
        if self.providers.contains_key(&kind) {
            return Err(RegistryError::AlreadyRegistered(kind));
        }
        info!(provider = %kind, "provider registered");
        self.providers.insert(kind, provider);
        Ok(())
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn CloudProvider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    /// Registered kinds in stable order.
    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
