//! Plan engine — diff the desired graph against recorded state.
//!
//! Pure over its inputs: the only provider calls are read-only refreshes.
//! Two-phase attribute resolution: structural (topological) ordering first,
//! then lazy value substitution node by node, since later nodes' inputs
//! depend on earlier nodes' resolved outputs. References to outputs of nodes
//! pending Create/Replace stay symbolic and are substituted at apply time.

use super::error::{EngineError, ValidationError};
use super::graph::Dag;
use super::schema::{AttrRole, Catalog, KindSchema};
use super::types::{
    attrs_from_yaml, Action, ActionKind, AttrValue, DriftFinding, NodeState, Observed, Plan,
    RecordStatus, ResourceGraph, ResourceNode,
};
use crate::provider::AdapterRegistry;
use crate::trace::fingerprint;
use indexmap::IndexMap;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// Refresh observed state via provider `read` before diffing. Records in
    /// `Applying` status are refreshed regardless (crash re-entry).
    pub refresh: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self { refresh: true }
    }
}

/// Compute a plan converging recorded state toward the desired graph.
pub async fn plan(
    graph: &ResourceGraph,
    catalog: &Catalog,
    states: &IndexMap<String, NodeState>,
    adapters: &AdapterRegistry,
    options: &PlanOptions,
) -> Result<Plan, EngineError> {
    // Structural phase: topological order over explicit+implicit edges.
    let mut dag = Dag::new(graph.nodes.keys().cloned());
    for (id, node) in &graph.nodes {
        for dep in &node.depends_on {
            dag.add_edge(dep, id).map_err(EngineError::Parse)?;
        }
    }
    let order = dag.toposort().map_err(|members| {
        EngineError::from(ValidationError::Cyclic {
            nodes: members.join(", "),
        })
    })?;

    // Permission edges constrain the graph before anything else may run.
    validate_permission_edges(graph, catalog)?;

    // Refresh phase: build the observed view, collecting drift findings.
    let mut observed: HashMap<String, Option<Observed>> = HashMap::new();
    let mut drift: Vec<DriftFinding> = Vec::new();
    for id in &order {
        let Some(record) = states.get(id) else {
            continue;
        };
        refresh_record(record, adapters, options, &mut observed, &mut drift).await?;
    }

    // Value phase: resolve references lazily in topological order, then diff.
    let mut actions: IndexMap<String, Action> = IndexMap::new();
    for id in &order {
        let node = &graph.nodes[id];
        let schema = catalog
            .get(&node.kind)
            .ok_or_else(|| ValidationError::UnknownKind {
                node: id.clone(),
                kind: node.kind.clone(),
            })?;

        let resolved = resolve_attrs(&node.attributes, &actions, &observed);
        let obs = observed.get(id).and_then(|o| o.as_ref());
        let action = diff_node(node, schema, resolved, obs, states.get(id));
        actions.insert(id.clone(), action);
    }

    // Nodes recorded but no longer desired are deleted, dependents first.
    let deletes = plan_deletes(graph, states, &actions)?;

    // A Replace tears down the old resource; recorded dependents that this
    // plan would leave untouched still point at it.
    check_replacement_conflicts(graph, states, &actions)?;

    let mut all_actions: Vec<Action> = actions.into_values().collect();
    all_actions.extend(deletes);

    let mut plan = Plan {
        name: graph.name.clone(),
        actions: all_actions,
        drift,
        to_create: 0,
        to_update: 0,
        to_replace: 0,
        to_delete: 0,
        unchanged: 0,
    };
    for action in &plan.actions {
        match action.action {
            ActionKind::Create => plan.to_create += 1,
            ActionKind::Update => plan.to_update += 1,
            ActionKind::Replace => plan.to_replace += 1,
            ActionKind::Delete => plan.to_delete += 1,
            ActionKind::NoOp => plan.unchanged += 1,
        }
    }
    Ok(plan)
}

async fn refresh_record(
    record: &NodeState,
    adapters: &AdapterRegistry,
    options: &PlanOptions,
    observed: &mut HashMap<String, Option<Observed>>,
    drift: &mut Vec<DriftFinding>,
) -> Result<(), EngineError> {
    let id = &record.node_id;
    let needs_read = options.refresh || record.status == RecordStatus::Applying;

    if !needs_read {
        let attributes = attrs_from_yaml(&record.attributes).map_err(|e| {
            EngineError::Parse(format!("record '{}' has bad attributes: {}", id, e))
        })?;
        observed.insert(
            id.clone(),
            Some(Observed {
                provider_id: record.provider_id.clone(),
                attributes,
            }),
        );
        return Ok(());
    }

    let adapter = adapters
        .get(&record.kind)
        .ok_or_else(|| EngineError::NoAdapter(record.kind.clone()))?;
    let fresh = adapter
        .read(&record.kind, &record.provider_id)
        .await
        .map_err(|e| EngineError::Provider {
            kind: record.kind.clone(),
            source: e,
        })?;

    match fresh {
        None => {
            if record.status == RecordStatus::Applied {
                drift.push(DriftFinding {
                    node_id: id.clone(),
                    recorded_fingerprint: record.fingerprint.clone(),
                    observed_fingerprint: "missing".to_string(),
                    detail: format!("{} no longer exists at the provider", id),
                });
            }
            observed.insert(id.clone(), None);
        }
        Some(obs) => {
            let fp = fingerprint::fingerprint_attrs(&obs.attributes);
            if record.status == RecordStatus::Applied && fp != record.fingerprint {
                drift.push(DriftFinding {
                    node_id: id.clone(),
                    recorded_fingerprint: record.fingerprint.clone(),
                    observed_fingerprint: fp,
                    detail: format!("{} observed state diverged from record", id),
                });
            }
            observed.insert(id.clone(), Some(obs));
        }
    }
    Ok(())
}

/// Substitute references whose target outputs are already known. A target
/// pending Create/Replace keeps the reference symbolic.
fn resolve_attrs(
    attributes: &IndexMap<String, AttrValue>,
    actions: &IndexMap<String, Action>,
    observed: &HashMap<String, Option<Observed>>,
) -> IndexMap<String, AttrValue> {
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, actions, observed)))
        .collect()
}

fn resolve_value(
    value: &AttrValue,
    actions: &IndexMap<String, Action>,
    observed: &HashMap<String, Option<Observed>>,
) -> AttrValue {
    match value {
        AttrValue::Ref(r) => {
            let pending = matches!(
                actions.get(&r.node).map(|a| a.action),
                Some(ActionKind::Create | ActionKind::Replace)
            );
            if pending {
                return value.clone();
            }
            observed
                .get(&r.node)
                .and_then(|o| o.as_ref())
                .and_then(|obs| obs.attributes.get(&r.output))
                .cloned()
                .unwrap_or_else(|| value.clone())
        }
        AttrValue::List(items) => AttrValue::List(
            items
                .iter()
                .map(|v| resolve_value(v, actions, observed))
                .collect(),
        ),
        AttrValue::Map(map) => AttrValue::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, actions, observed)))
                .collect(),
        ),
        literal => literal.clone(),
    }
}

fn diff_node(
    node: &ResourceNode,
    schema: &KindSchema,
    resolved: IndexMap<String, AttrValue>,
    observed: Option<&Observed>,
    record: Option<&NodeState>,
) -> Action {
    let Some(obs) = observed else {
        let changed: Vec<String> = resolved.keys().cloned().collect();
        return Action {
            node_id: node.id.clone(),
            kind: node.kind.clone(),
            action: ActionKind::Create,
            description: describe(&node.id, ActionKind::Create, &changed, None),
            attributes: resolved,
            changed,
            provider_id: None,
            deps: node.depends_on.clone(),
        };
    };

    let mut changed: Vec<String> = Vec::new();
    let mut forces_replacement: Option<String> = None;
    for (attr_name, attr_schema) in &schema.attrs {
        let desired = resolved.get(attr_name);
        let current = obs.attributes.get(attr_name);
        let equal = match (desired, current) {
            (None, None) => true,
            // A symbolic reference means the target output is only known
            // after apply; always a change.
            (Some(AttrValue::Ref(_)), _) => false,
            (Some(d), Some(c)) => d == c,
            (None, Some(_)) | (Some(_), None) => false,
        };
        if !equal {
            changed.push(attr_name.clone());
            if !attr_schema.mutable && forces_replacement.is_none() {
                forces_replacement = Some(attr_name.clone());
            }
        }
    }

    let action = if changed.is_empty() {
        ActionKind::NoOp
    } else if forces_replacement.is_some() {
        ActionKind::Replace
    } else {
        ActionKind::Update
    };

    Action {
        node_id: node.id.clone(),
        kind: node.kind.clone(),
        action,
        description: describe(&node.id, action, &changed, forces_replacement.as_deref()),
        attributes: resolved,
        changed,
        provider_id: record.map(|r| r.provider_id.clone()),
        deps: node.depends_on.clone(),
    }
}

fn describe(
    node_id: &str,
    action: ActionKind,
    changed: &[String],
    replacement_attr: Option<&str>,
) -> String {
    match action {
        ActionKind::Create => format!("{}: create", node_id),
        ActionKind::Update => format!("{}: update ({})", node_id, changed.join(", ")),
        ActionKind::Replace => format!(
            "{}: replace ({} forces replacement)",
            node_id,
            replacement_attr.unwrap_or("immutable attribute")
        ),
        ActionKind::Delete => format!("{}: destroy", node_id),
        ActionKind::NoOp => format!("{}: no changes", node_id),
    }
}

/// Plan deletes for recorded nodes absent from the desired graph, ordered so
/// recorded dependents delete before their dependencies.
fn plan_deletes(
    graph: &ResourceGraph,
    states: &IndexMap<String, NodeState>,
    actions: &IndexMap<String, Action>,
) -> Result<Vec<Action>, EngineError> {
    let removed: Vec<&NodeState> = states
        .values()
        .filter(|record| !graph.nodes.contains_key(&record.node_id))
        .collect();
    if removed.is_empty() {
        return Ok(Vec::new());
    }

    // A surviving node whose recorded edge still points at a removed node,
    // and which this plan would not re-apply, would be left dangling.
    for record in &removed {
        let mut dangling: Vec<&str> = Vec::new();
        for survivor in states.values() {
            if survivor.node_id == record.node_id
                || !graph.nodes.contains_key(&survivor.node_id)
                || !survivor.depends_on.contains(&record.node_id)
            {
                continue;
            }
            if matches!(
                actions.get(&survivor.node_id).map(|a| a.action),
                Some(ActionKind::NoOp) | None
            ) {
                dangling.push(&survivor.node_id);
            }
        }
        if !dangling.is_empty() {
            dangling.sort_unstable();
            return Err(ValidationError::DanglingDependents {
                node: record.node_id.clone(),
                dependents: dangling.join(", "),
            }
            .into());
        }
    }

    // Reverse topological order over the recorded edges within the removed set.
    let removed_ids: Vec<String> = removed.iter().map(|r| r.node_id.clone()).collect();
    let mut dag = Dag::new(removed_ids.clone());
    for record in &removed {
        for dep in &record.depends_on {
            if removed_ids.contains(dep) {
                dag.add_edge(dep, &record.node_id)
                    .map_err(EngineError::Parse)?;
            }
        }
    }
    let mut delete_order = dag.toposort().map_err(|members| {
        EngineError::from(ValidationError::Cyclic {
            nodes: members.join(", "),
        })
    })?;
    delete_order.reverse();

    let mut deletes = Vec::new();
    for id in delete_order {
        let Some(record) = states.get(&id) else {
            continue;
        };
        // A delete must wait for the deletes of its recorded dependents, and
        // for the re-applies that clear a survivor's stale edge to it.
        let mut deps: Vec<String> = removed
            .iter()
            .filter(|r| r.depends_on.contains(&id))
            .map(|r| r.node_id.clone())
            .collect();
        for survivor in states.values() {
            if graph.nodes.contains_key(&survivor.node_id)
                && survivor.depends_on.contains(&id)
                && !matches!(
                    actions.get(&survivor.node_id).map(|a| a.action),
                    Some(ActionKind::NoOp) | None
                )
            {
                deps.push(survivor.node_id.clone());
            }
        }
        deletes.push(Action {
            node_id: id.clone(),
            kind: record.kind.clone(),
            action: ActionKind::Delete,
            description: describe(&id, ActionKind::Delete, &[], None),
            attributes: IndexMap::new(),
            changed: Vec::new(),
            provider_id: Some(record.provider_id.clone()),
            deps,
        });
    }
    Ok(deletes)
}

fn check_replacement_conflicts(
    graph: &ResourceGraph,
    states: &IndexMap<String, NodeState>,
    actions: &IndexMap<String, Action>,
) -> Result<(), EngineError> {
    for action in actions.values() {
        if action.action != ActionKind::Replace {
            continue;
        }
        let mut stale: Vec<&str> = Vec::new();
        for record in states.values() {
            if record.node_id == action.node_id
                || !graph.nodes.contains_key(&record.node_id)
                || !record.depends_on.contains(&action.node_id)
            {
                continue;
            }
            if matches!(
                actions.get(&record.node_id).map(|a| a.action),
                Some(ActionKind::NoOp)
            ) {
                stale.push(&record.node_id);
            }
        }
        if !stale.is_empty() {
            stale.sort_unstable();
            return Err(ValidationError::ReplacementConflict {
                node: action.node_id.clone(),
                dependents: stale.join(", "),
            }
            .into());
        }
    }
    Ok(())
}

/// For every node binding a secret through a `SecretRef` attribute, require a
/// grant node connecting one of its bound identities to that secret.
fn validate_permission_edges(graph: &ResourceGraph, catalog: &Catalog) -> Result<(), EngineError> {
    // Collect (identity node, secret node) pairs from grant kinds.
    let mut granted: Vec<(String, String)> = Vec::new();
    for node in graph.nodes.values() {
        let Some(schema) = catalog.get(&node.kind) else {
            continue;
        };
        let Some(grant) = &schema.grant else {
            continue;
        };
        let identity = node
            .attributes
            .get(&grant.identity_attr)
            .map(|v| v.references())
            .unwrap_or_default();
        let secret = node
            .attributes
            .get(&grant.secret_attr)
            .map(|v| v.references())
            .unwrap_or_default();
        for i in &identity {
            for s in &secret {
                granted.push((i.node.clone(), s.node.clone()));
            }
        }
    }

    for node in graph.nodes.values() {
        let Some(schema) = catalog.get(&node.kind) else {
            continue;
        };
        if schema.grant.is_some() {
            continue;
        }

        let mut identities: Vec<String> = Vec::new();
        let mut secrets: Vec<String> = Vec::new();
        for (attr_name, attr_schema) in &schema.attrs {
            let Some(value) = node.attributes.get(attr_name) else {
                continue;
            };
            match attr_schema.role {
                AttrRole::IdentityRef => {
                    identities.extend(value.references().iter().map(|r| r.node.clone()));
                }
                AttrRole::SecretRef => {
                    secrets.extend(value.references().iter().map(|r| r.node.clone()));
                }
                AttrRole::Plain => {}
            }
        }

        for secret in &secrets {
            let ok = granted
                .iter()
                .any(|(i, s)| s == secret && identities.contains(i));
            if !ok {
                return Err(ValidationError::SecretAccessNotGranted {
                    node: node.id.clone(),
                    identity: identities
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "(none)".to_string()),
                    secret: secret.clone(),
                }
                .into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loader;
    use crate::provider::memory::MemoryProvider;
    use crate::provider::ProviderAdapter;
    use std::sync::Arc;

    fn setup() -> (Catalog, Arc<MemoryProvider>, AdapterRegistry) {
        let catalog = Catalog::example();
        let backend = Arc::new(MemoryProvider::new(catalog.clone()));
        let registry = AdapterRegistry::memory_backed(&catalog, backend.clone());
        (catalog, backend, registry)
    }

    fn graph(catalog: &Catalog, yaml: &str) -> ResourceGraph {
        let decl = loader::parse_str(yaml).unwrap();
        loader::build_graph(&decl, catalog).unwrap()
    }

    const REGISTRY_ONLY: &str = r#"
version: "1.0"
name: test
resources:
  registry:
    kind: registry
    attributes:
      name: api
"#;

    #[tokio::test]
    async fn test_empty_state_plans_create() {
        let (catalog, _backend, registry) = setup();
        let g = graph(&catalog, REGISTRY_ONLY);
        let plan = plan(&g, &catalog, &IndexMap::new(), &registry, &PlanOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.to_create, 1);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].action, ActionKind::Create);
        assert_eq!(plan.actions[0].node_id, "registry");
    }

    #[tokio::test]
    async fn test_plan_never_mutates() {
        let (catalog, backend, registry) = setup();
        let g = graph(&catalog, REGISTRY_ONLY);
        let _ = plan(&g, &catalog, &IndexMap::new(), &registry, &PlanOptions::default())
            .await
            .unwrap();
        assert!(backend.mutation_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_cyclic_graph_rejected_before_any_call() {
        let (catalog, backend, registry) = setup();
        // Hand-built graph: the loader refuses cycles, the planner must too.
        let mut g = ResourceGraph::empty("cycle");
        for (id, dep) in [("a", "b"), ("b", "a")] {
            g.nodes.insert(
                id.to_string(),
                ResourceNode {
                    id: id.to_string(),
                    kind: "cluster".to_string(),
                    attributes: IndexMap::from([(
                        "name".to_string(),
                        AttrValue::Str(id.to_string()),
                    )]),
                    depends_on: vec![dep.to_string()],
                },
            );
        }
        let err = plan(&g, &catalog, &IndexMap::new(), &registry, &PlanOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::Cyclic { .. })
        ));
        assert!(backend.mutation_log().await.is_empty());
    }

    async fn observed_state(
        backend: &MemoryProvider,
        node_id: &str,
        kind: &str,
        attrs: IndexMap<String, AttrValue>,
        deps: Vec<String>,
    ) -> NodeState {
        let obs = backend.create(kind, node_id, &attrs).await.unwrap();
        NodeState {
            schema: "1.0".to_string(),
            node_id: node_id.to_string(),
            kind: kind.to_string(),
            provider_id: obs.provider_id.clone(),
            status: RecordStatus::Applied,
            attributes: crate::core::types::attrs_to_yaml(&obs.attributes),
            depends_on: deps,
            fingerprint: fingerprint::fingerprint_attrs(&obs.attributes),
            applied_at: Some("2026-08-29T10:00:00Z".to_string()),
        }
    }

    fn name_attr(name: &str) -> IndexMap<String, AttrValue> {
        IndexMap::from([("name".to_string(), AttrValue::Str(name.to_string()))])
    }

    #[tokio::test]
    async fn test_matching_state_plans_noop() {
        let (catalog, backend, registry) = setup();
        let g = graph(&catalog, REGISTRY_ONLY);
        let record = observed_state(&backend, "registry", "registry", name_attr("api"), vec![]).await;
        let states = IndexMap::from([("registry".to_string(), record)]);

        let plan = plan(&g, &catalog, &states, &registry, &PlanOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.unchanged, 1);
        assert!(!plan.has_changes());
        assert!(plan.drift.is_empty());
    }

    #[tokio::test]
    async fn test_mutable_change_plans_update() {
        let (catalog, backend, registry) = setup();
        let g = graph(
            &catalog,
            r#"
version: "1.0"
name: test
resources:
  db-password:
    kind: secret
    attributes:
      name: db-password
      description: rotated weekly
"#,
        );
        let mut attrs = name_attr("db-password");
        attrs.insert(
            "description".to_string(),
            AttrValue::Str("rotated daily".to_string()),
        );
        let record =
            observed_state(&backend, "db-password", "secret", attrs, vec![]).await;
        let states = IndexMap::from([("db-password".to_string(), record)]);

        let plan = plan(&g, &catalog, &states, &registry, &PlanOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.to_update, 1);
        let action = &plan.actions[0];
        assert_eq!(action.action, ActionKind::Update);
        assert_eq!(action.changed, vec!["description"]);
    }

    #[tokio::test]
    async fn test_immutable_change_plans_replace() {
        let (catalog, backend, registry) = setup();
        let g = graph(
            &catalog,
            r#"
version: "1.0"
name: test
resources:
  cluster:
    kind: cluster
    attributes:
      name: api-v2
"#,
        );
        let record = observed_state(&backend, "cluster", "cluster", name_attr("api"), vec![]).await;
        let states = IndexMap::from([("cluster".to_string(), record)]);

        let plan = plan(&g, &catalog, &states, &registry, &PlanOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.to_replace, 1);
        assert_eq!(plan.actions[0].action, ActionKind::Replace);
        assert!(plan.actions[0].description.contains("forces replacement"));
    }

    #[tokio::test]
    async fn test_removed_node_plans_delete() {
        let (catalog, backend, registry) = setup();
        let g = graph(&catalog, REGISTRY_ONLY);
        let record = observed_state(&backend, "old-sg", "security_group", name_attr("old"), vec![]).await;
        let states = IndexMap::from([("old-sg".to_string(), record)]);

        let plan = plan(&g, &catalog, &states, &registry, &PlanOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.to_create, 1);
        assert_eq!(plan.to_delete, 1);
        let delete = plan
            .actions
            .iter()
            .find(|a| a.action == ActionKind::Delete)
            .unwrap();
        assert_eq!(delete.node_id, "old-sg");
        assert!(delete.provider_id.is_some());
    }

    #[tokio::test]
    async fn test_delete_order_dependents_first() {
        let (catalog, backend, registry) = setup();
        let g = ResourceGraph::empty("test");
        let base = observed_state(&backend, "base", "cluster", name_attr("b"), vec![]).await;
        let top =
            observed_state(&backend, "top", "service", name_attr("t"), vec!["base".to_string()])
                .await;
        let states = IndexMap::from([
            ("base".to_string(), base),
            ("top".to_string(), top),
        ]);

        let plan = plan(&g, &catalog, &states, &registry, &PlanOptions::default())
            .await
            .unwrap();
        let order: Vec<&str> = plan.actions.iter().map(|a| a.node_id.as_str()).collect();
        assert_eq!(order, vec!["top", "base"]);
        // base's delete waits for top's
        let base_action = plan.actions.iter().find(|a| a.node_id == "base").unwrap();
        assert_eq!(base_action.deps, vec!["top"]);
    }

    #[tokio::test]
    async fn test_dangling_dependents_rejected() {
        let (catalog, backend, registry) = setup();
        // Desired keeps `svc` untouched, removes `cluster` it depends on.
        let g = graph(
            &catalog,
            r#"
version: "1.0"
name: test
resources:
  svc:
    kind: cluster
    attributes:
      name: svc
"#,
        );
        let svc = observed_state(
            &backend,
            "svc",
            "cluster",
            name_attr("svc"),
            vec!["old-cluster".to_string()],
        )
        .await;
        let old = observed_state(&backend, "old-cluster", "cluster", name_attr("old"), vec![]).await;
        let states = IndexMap::from([
            ("svc".to_string(), svc),
            ("old-cluster".to_string(), old),
        ]);

        let err = plan(&g, &catalog, &states, &registry, &PlanOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::DanglingDependents { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_waits_for_reapplied_survivor() {
        let (catalog, backend, registry) = setup();
        // Desired updates `svc` (clearing its stale recorded edge) and
        // removes `old-cluster`; the delete must run after the update.
        let g = graph(
            &catalog,
            r#"
version: "1.0"
name: test
resources:
  svc:
    kind: secret
    attributes:
      name: svc
      description: rotated
"#,
        );
        let mut svc_attrs = name_attr("svc");
        svc_attrs.insert(
            "description".to_string(),
            AttrValue::Str("initial".to_string()),
        );
        let svc = observed_state(
            &backend,
            "svc",
            "secret",
            svc_attrs,
            vec!["old-cluster".to_string()],
        )
        .await;
        let old = observed_state(&backend, "old-cluster", "cluster", name_attr("old"), vec![]).await;
        let states = IndexMap::from([
            ("svc".to_string(), svc),
            ("old-cluster".to_string(), old),
        ]);

        let plan = plan(&g, &catalog, &states, &registry, &PlanOptions::default())
            .await
            .unwrap();
        let update = plan.actions.iter().find(|a| a.node_id == "svc").unwrap();
        assert_eq!(update.action, ActionKind::Update);
        let delete = plan.actions.iter().find(|a| a.node_id == "old-cluster").unwrap();
        assert_eq!(delete.action, ActionKind::Delete);
        assert_eq!(delete.deps, vec!["svc"]);
    }

    #[tokio::test]
    async fn test_reference_update_propagates() {
        // Renaming the registry forces its replacement; the task consuming
        // repository_url via reference must re-apply without any direct edit.
        let (catalog, backend, registry) = setup();

        let decl_tpl = |registry_name: &str| {
            format!(
                r#"
version: "1.0"
name: test
resources:
  registry:
    kind: registry
    attributes:
      name: {}
  role:
    kind: identity
    attributes:
      name: task-role
  api-task:
    kind: task_definition
    attributes:
      name: api
      image: "{{{{registry.repository_url}}}}"
      identity: "{{{{role.identity_ref}}}}"
"#,
                registry_name
            )
        };

        // Simulate the original apply of the "api" graph.
        let reg = observed_state(&backend, "registry", "registry", name_attr("api"), vec![]).await;
        let role = observed_state(&backend, "role", "identity", name_attr("task-role"), vec![]).await;
        let reg_url = reg.attributes["repository_url"].clone();
        let role_ref = role.attributes["identity_ref"].clone();
        let mut task_attrs = name_attr("api");
        task_attrs.insert(
            "image".to_string(),
            AttrValue::from_yaml(&reg_url).unwrap(),
        );
        task_attrs.insert(
            "identity".to_string(),
            AttrValue::from_yaml(&role_ref).unwrap(),
        );
        let task = observed_state(
            &backend,
            "api-task",
            "task_definition",
            task_attrs,
            vec!["registry".to_string(), "role".to_string()],
        )
        .await;
        let states = IndexMap::from([
            ("registry".to_string(), reg),
            ("role".to_string(), role),
            ("api-task".to_string(), task),
        ]);

        // Unchanged: everything NoOp.
        let g = graph(&catalog, &decl_tpl("api"));
        let p = plan(&g, &catalog, &states, &registry, &PlanOptions::default())
            .await
            .unwrap();
        assert!(!p.has_changes(), "plan: {:?}", p.actions);

        // Rename registry: registry replaces, api-task re-applies.
        let g2 = graph(&catalog, &decl_tpl("api2"));
        let p2 = plan(&g2, &catalog, &states, &registry, &PlanOptions::default())
            .await
            .unwrap();
        let by_id: HashMap<&str, ActionKind> = p2
            .actions
            .iter()
            .map(|a| (a.node_id.as_str(), a.action))
            .collect();
        assert_eq!(by_id["registry"], ActionKind::Replace);
        assert_eq!(by_id["api-task"], ActionKind::Update);
        assert_eq!(by_id["role"], ActionKind::NoOp);
    }

    #[tokio::test]
    async fn test_replacement_conflict_on_stale_dependent() {
        let (catalog, backend, registry) = setup();
        // `svc` recorded a dependency on `cluster` but nothing in its
        // declaration re-points it, so it would plan NoOp.
        let g = graph(
            &catalog,
            r#"
version: "1.0"
name: test
resources:
  cluster:
    kind: cluster
    attributes:
      name: api-v2
  svc:
    kind: security_group
    attributes:
      name: svc
"#,
        );
        let cluster = observed_state(&backend, "cluster", "cluster", name_attr("api"), vec![]).await;
        let svc = observed_state(
            &backend,
            "svc",
            "security_group",
            name_attr("svc"),
            vec!["cluster".to_string()],
        )
        .await;
        let states = IndexMap::from([
            ("cluster".to_string(), cluster),
            ("svc".to_string(), svc),
        ]);

        let err = plan(&g, &catalog, &states, &registry, &PlanOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::ReplacementConflict { .. })
        ));
    }

    const SECRET_BINDING_NO_GRANT: &str = r#"
version: "1.0"
name: test
resources:
  db-password:
    kind: secret
    attributes:
      name: db-password
  task-role:
    kind: identity
    attributes:
      name: task-role
  api-task:
    kind: task_definition
    attributes:
      name: api
      image: api:v1
      identity: "{{task-role.identity_ref}}"
      secrets:
        DB_PASSWORD: "{{db-password.secret_ref}}"
"#;

    #[tokio::test]
    async fn test_secret_binding_without_grant_rejected() {
        let (catalog, _backend, registry) = setup();
        let g = graph(&catalog, SECRET_BINDING_NO_GRANT);
        let err = plan(&g, &catalog, &IndexMap::new(), &registry, &PlanOptions::default())
            .await
            .unwrap_err();
        match err {
            EngineError::Validation(ValidationError::SecretAccessNotGranted {
                node,
                secret,
                ..
            }) => {
                assert_eq!(node, "api-task");
                assert_eq!(secret, "db-password");
            }
            other => panic!("expected SecretAccessNotGranted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_secret_binding_with_grant_plans() {
        let (catalog, _backend, registry) = setup();
        let yaml = format!(
            "{}{}",
            SECRET_BINDING_NO_GRANT,
            r#"  db-grant:
    kind: grant
    attributes:
      identity: "{{task-role.identity_ref}}"
      secret: "{{db-password.secret_ref}}"
"#
        );
        let g = graph(&catalog, &yaml);
        let plan = plan(&g, &catalog, &IndexMap::new(), &registry, &PlanOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.to_create, 4);
    }

    #[tokio::test]
    async fn test_drift_surfaces_without_blocking() {
        let (catalog, backend, registry) = setup();
        let g = graph(&catalog, REGISTRY_ONLY);
        let record = observed_state(&backend, "registry", "registry", name_attr("api"), vec![]).await;
        // Tamper with a mutable-free attribute behind the engine's back.
        backend
            .tamper(
                &record.provider_id,
                "repository_url",
                AttrValue::Str("registry.stratus.local/hijacked".to_string()),
            )
            .await;
        let states = IndexMap::from([("registry".to_string(), record)]);

        let plan = plan(&g, &catalog, &states, &registry, &PlanOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.drift.len(), 1);
        assert_eq!(plan.drift[0].node_id, "registry");
        // Inputs still match, so the node itself stays NoOp.
        assert_eq!(plan.unchanged, 1);
    }

    #[tokio::test]
    async fn test_vanished_resource_recreated() {
        let (catalog, backend, registry) = setup();
        let g = graph(&catalog, REGISTRY_ONLY);
        let record = observed_state(&backend, "registry", "registry", name_attr("api"), vec![]).await;
        backend.delete("registry", &record.provider_id).await.unwrap();
        let states = IndexMap::from([("registry".to_string(), record)]);

        let plan = plan(&g, &catalog, &states, &registry, &PlanOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.to_create, 1);
        assert_eq!(plan.drift.len(), 1);
        assert!(plan.drift[0].detail.contains("no longer exists"));
    }

    #[tokio::test]
    async fn test_no_refresh_skips_reads() {
        let (catalog, backend, registry) = setup();
        let g = graph(&catalog, REGISTRY_ONLY);
        let record = observed_state(&backend, "registry", "registry", name_attr("api"), vec![]).await;
        // Delete behind the engine's back; without refresh the stale record wins.
        backend.delete("registry", &record.provider_id).await.unwrap();
        let states = IndexMap::from([("registry".to_string(), record)]);

        let plan = plan(
            &g,
            &catalog,
            &states,
            &registry,
            &PlanOptions { refresh: false },
        )
        .await
        .unwrap();
        assert_eq!(plan.unchanged, 1);
        assert!(plan.drift.is_empty());
    }

    #[tokio::test]
    async fn test_applying_record_always_refreshed() {
        let (catalog, backend, registry) = setup();
        let g = graph(&catalog, REGISTRY_ONLY);
        let mut record = observed_state(&backend, "registry", "registry", name_attr("api"), vec![]).await;
        record.status = RecordStatus::Applying;
        let states = IndexMap::from([("registry".to_string(), record)]);

        // Even with refresh disabled, the crash marker forces a read, which
        // finds the resource intact: NoOp.
        let plan = plan(
            &g,
            &catalog,
            &states,
            &registry,
            &PlanOptions { refresh: false },
        )
        .await
        .unwrap();
        assert_eq!(plan.unchanged, 1);
    }

    #[tokio::test]
    async fn test_pending_reference_stays_symbolic() {
        let (catalog, _backend, registry) = setup();
        let g = graph(
            &catalog,
            r#"
version: "1.0"
name: test
resources:
  registry:
    kind: registry
    attributes:
      name: api
  role:
    kind: identity
    attributes:
      name: r
  api-task:
    kind: task_definition
    attributes:
      name: api
      image: "{{registry.repository_url}}"
      identity: "{{role.identity_ref}}"
"#,
        );
        let plan = plan(&g, &catalog, &IndexMap::new(), &registry, &PlanOptions::default())
            .await
            .unwrap();
        let task = plan
            .actions
            .iter()
            .find(|a| a.node_id == "api-task")
            .unwrap();
        assert!(matches!(task.attributes["image"], AttrValue::Ref(_)));
    }
}
