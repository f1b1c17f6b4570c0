//! In-memory control plane implementing the whole example catalog.
//!
//! Serves as the local backend for the CLI (optionally persisted to a file so
//! repeated runs see the same control plane) and as the test double for the
//! engine. Supports fault injection: permanent failures per node and
//! transient failure counters, plus a mutation log so tests can assert that
//! planning never mutates.

use super::ProviderAdapter;
use crate::core::error::ProviderError;
use crate::core::schema::Catalog;
use crate::core::types::{attrs_from_yaml, attrs_to_yaml, AttrValue, Observed};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct StoredObject {
    kind: String,
    node_id: String,
    attributes: IndexMap<String, AttrValue>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: IndexMap<String, StoredObject>,
    // provider id -> node id, kept after deletion so fault injection stays
    // keyed on the node id for the whole life of an id.
    labels: HashMap<String, String>,
    counter: u64,
    fail_permanent: HashSet<String>,
    fail_transient: HashMap<String, u32>,
    mutation_log: Vec<String>,
}

/// Persisted image of the control plane, one YAML file.
#[derive(Debug, Serialize, Deserialize, Default)]
struct PersistedPlane {
    counter: u64,
    objects: IndexMap<String, PersistedObject>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedObject {
    kind: String,
    node_id: String,
    attributes: IndexMap<String, serde_yaml_ng::Value>,
}

pub struct MemoryProvider {
    catalog: Catalog,
    inner: Mutex<Inner>,
    persist_path: Option<PathBuf>,
}

impl MemoryProvider {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            inner: Mutex::new(Inner::default()),
            persist_path: None,
        }
    }

    /// Backend whose objects survive process restarts.
    pub fn with_persistence(catalog: Catalog, path: PathBuf) -> Result<Self, ProviderError> {
        let mut inner = Inner::default();
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| ProviderError::Other(format!("cannot read {}: {}", path.display(), e)))?;
            let plane: PersistedPlane = serde_yaml_ng::from_str(&content)
                .map_err(|e| ProviderError::Other(format!("corrupt {}: {}", path.display(), e)))?;
            inner.counter = plane.counter;
            for (id, obj) in plane.objects {
                let attributes = attrs_from_yaml(&obj.attributes)
                    .map_err(ProviderError::Other)?;
                inner.labels.insert(id.clone(), obj.node_id.clone());
                inner.objects.insert(
                    id,
                    StoredObject {
                        kind: obj.kind,
                        node_id: obj.node_id,
                        attributes,
                    },
                );
            }
        }
        Ok(Self {
            catalog,
            inner: Mutex::new(inner),
            persist_path: Some(path),
        })
    }

    /// Make mutating calls on `node_id` fail permanently.
    pub async fn fail_node(&self, node_id: &str) {
        self.inner
            .lock()
            .await
            .fail_permanent
            .insert(node_id.to_string());
    }

    /// Make the next `times` mutating calls on `node_id` time out.
    pub async fn fail_transient(&self, node_id: &str, times: u32) {
        self.inner
            .lock()
            .await
            .fail_transient
            .insert(node_id.to_string(), times);
    }

    /// Mutating calls seen so far, e.g. `"create registry"`.
    pub async fn mutation_log(&self) -> Vec<String> {
        self.inner.lock().await.mutation_log.clone()
    }

    pub async fn object_count(&self) -> usize {
        self.inner.lock().await.objects.len()
    }

    /// Overwrite attributes behind the engine's back, for drift tests.
    pub async fn tamper(&self, provider_id: &str, attribute: &str, value: AttrValue) {
        let mut inner = self.inner.lock().await;
        if let Some(obj) = inner.objects.get_mut(provider_id) {
            obj.attributes.insert(attribute.to_string(), value);
        }
    }

    fn check_faults(inner: &mut Inner, node_id: &str) -> Result<(), ProviderError> {
        if inner.fail_permanent.contains(node_id) {
            return Err(ProviderError::AccessDenied(format!(
                "injected failure for {}",
                node_id
            )));
        }
        if let Some(remaining) = inner.fail_transient.get_mut(node_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProviderError::Timeout(format!(
                    "injected transient failure for {}",
                    node_id
                )));
            }
        }
        Ok(())
    }

    fn persist(&self, inner: &Inner) -> Result<(), ProviderError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let mut plane = PersistedPlane {
            counter: inner.counter,
            objects: IndexMap::new(),
        };
        for (id, obj) in &inner.objects {
            plane.objects.insert(
                id.clone(),
                PersistedObject {
                    kind: obj.kind.clone(),
                    node_id: obj.node_id.clone(),
                    attributes: attrs_to_yaml(&obj.attributes),
                },
            );
        }
        let yaml = serde_yaml_ng::to_string(&plane)
            .map_err(|e| ProviderError::Other(format!("serialize: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProviderError::Other(format!("mkdir: {}", e)))?;
        }
        std::fs::write(path, yaml)
            .map_err(|e| ProviderError::Other(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Computed, output-only attributes per kind. Derived from the immutable
    /// name and the assigned id, so they are stable across updates.
    fn computed_outputs(
        kind: &str,
        node_id: &str,
        provider_id: &str,
        attributes: &IndexMap<String, AttrValue>,
    ) -> IndexMap<String, AttrValue> {
        let name = attributes
            .get("name")
            .and_then(AttrValue::as_str)
            .unwrap_or(node_id);
        let mut out = IndexMap::new();
        let mut put = |key: &str, value: String| {
            out.insert(key.to_string(), AttrValue::Str(value));
        };
        match kind {
            "registry" => put("repository_url", format!("registry.stratus.local/{}", name)),
            "secret" => put("secret_ref", format!("secret://{}/{}", provider_id, name)),
            "identity" => put("identity_ref", format!("identity://{}", provider_id)),
            "cluster" => put("cluster_ref", format!("cluster://{}", provider_id)),
            "task_definition" => put("task_ref", format!("task://{}", provider_id)),
            "service" => put("service_ref", format!("service://{}", provider_id)),
            "load_balancer" => {
                put("lb_ref", format!("lb://{}", provider_id));
                put("dns_name", format!("{}.lb.stratus.local", name));
            }
            "security_group" => put("group_ref", format!("sg://{}", provider_id)),
            "instance" => {
                put("instance_ref", format!("vm://{}", provider_id));
                let suffix: String = provider_id
                    .chars()
                    .rev()
                    .take_while(char::is_ascii_digit)
                    .collect();
                let octet: u64 = suffix
                    .chars()
                    .rev()
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0);
                put("address", format!("10.0.0.{}", 10 + octet % 200));
            }
            _other => {}
        }
        out
    }

    fn observed(obj: &StoredObject, provider_id: &str) -> Observed {
        Observed {
            provider_id: provider_id.to_string(),
            attributes: obj.attributes.clone(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for MemoryProvider {
    async fn read(
        &self,
        _kind: &str,
        provider_id: &str,
    ) -> Result<Option<Observed>, ProviderError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .objects
            .get(provider_id)
            .map(|obj| Self::observed(obj, provider_id)))
    }

    async fn create(
        &self,
        kind: &str,
        node_id: &str,
        attributes: &IndexMap<String, AttrValue>,
    ) -> Result<Observed, ProviderError> {
        if self.catalog.get(kind).is_none() {
            return Err(ProviderError::Other(format!("unknown kind '{}'", kind)));
        }
        let mut inner = self.inner.lock().await;
        inner.mutation_log.push(format!("create {}", node_id));
        Self::check_faults(&mut inner, node_id)?;

        if inner.objects.values().any(|o| o.node_id == node_id && o.kind == kind) {
            return Err(ProviderError::Conflict(format!(
                "{} '{}' already exists",
                kind, node_id
            )));
        }

        inner.counter += 1;
        let provider_id = format!("{}-{:04}", kind, inner.counter);

        let mut stored = attributes.clone();
        stored.extend(Self::computed_outputs(kind, node_id, &provider_id, attributes));

        let obj = StoredObject {
            kind: kind.to_string(),
            node_id: node_id.to_string(),
            attributes: stored,
        };
        let observed = Self::observed(&obj, &provider_id);
        inner.labels.insert(provider_id.clone(), node_id.to_string());
        inner.objects.insert(provider_id, obj);
        self.persist(&inner)?;
        Ok(observed)
    }

    async fn update(
        &self,
        kind: &str,
        provider_id: &str,
        attributes: &IndexMap<String, AttrValue>,
        _changed: &[String],
    ) -> Result<Observed, ProviderError> {
        let mut inner = self.inner.lock().await;
        let node_id = match inner.objects.get(provider_id) {
            Some(obj) => obj.node_id.clone(),
            None => {
                return Err(ProviderError::NotFound(format!(
                    "{} {}",
                    kind, provider_id
                )))
            }
        };
        inner.mutation_log.push(format!("update {}", node_id));
        Self::check_faults(&mut inner, &node_id)?;

        let mut stored = attributes.clone();
        stored.extend(Self::computed_outputs(kind, &node_id, provider_id, attributes));

        let Some(obj) = inner.objects.get_mut(provider_id) else {
            return Err(ProviderError::NotFound(format!("{} {}", kind, provider_id)));
        };
        obj.attributes = stored;
        let observed = Self::observed(obj, provider_id);
        self.persist(&inner)?;
        Ok(observed)
    }

    async fn delete(&self, _kind: &str, provider_id: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        match inner.labels.get(provider_id).cloned() {
            Some(label) => {
                inner.mutation_log.push(format!("delete {}", label));
                Self::check_faults(&mut inner, &label)?;
            }
            // An id we never issued: no node to key faults on.
            None => inner.mutation_log.push(format!("delete {}", provider_id)),
        }
        inner.objects.shift_remove(provider_id);
        self.persist(&inner)?;
        Ok(())
    }
}
