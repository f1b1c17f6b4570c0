//! Provider adapters — pluggable CRUD against a remote control plane.
//!
//! One adapter serves one or more resource kinds; the registry keys lookups
//! by kind string. Adapters hold no state beyond a single call and receive
//! their credentials as an opaque [`ProviderConfig`] that the core never
//! parses or logs.

pub mod memory;

use crate::core::error::ProviderError;
use crate::core::types::Observed;
use crate::core::types::AttrValue;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque provider configuration (region, access keys, tokens). Passed
/// through to adapter construction; deliberately not `Debug`-printed by any
/// engine log path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub region: Option<String>,

    /// Provider-specific settings and credentials, uninterpreted.
    #[serde(default)]
    pub settings: IndexMap<String, String>,
}

/// CRUD contract for one resource kind. Side effects are confined to the
/// remote control plane; `delete` must succeed idempotently if the resource
/// is already absent.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Read current state. `Ok(None)` means the resource does not exist.
    async fn read(&self, kind: &str, provider_id: &str)
        -> Result<Option<Observed>, ProviderError>;

    /// Create a resource from resolved attributes, returning the confirmed
    /// state including the provider-assigned identifier and computed outputs.
    async fn create(
        &self,
        kind: &str,
        node_id: &str,
        attributes: &IndexMap<String, AttrValue>,
    ) -> Result<Observed, ProviderError>;

    /// Update mutable attributes in place.
    async fn update(
        &self,
        kind: &str,
        provider_id: &str,
        attributes: &IndexMap<String, AttrValue>,
        changed: &[String],
    ) -> Result<Observed, ProviderError>;

    /// Delete a resource. Already-absent resources are not an error.
    async fn delete(&self, kind: &str, provider_id: &str) -> Result<(), ProviderError>;
}

/// Adapter lookup keyed by resource kind.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: &str, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(kind.to_string(), adapter);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(kind).cloned()
    }

    /// Registry serving every catalog kind from one in-memory backend.
    pub fn memory_backed(
        catalog: &crate::core::schema::Catalog,
        backend: Arc<memory::MemoryProvider>,
    ) -> Self {
        let mut registry = Self::new();
        for kind in catalog.kinds() {
            registry.register(kind, backend.clone());
        }
        registry
    }
}
