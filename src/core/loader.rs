//! Declaration loader — parse YAML into a typed, validated resource graph.
//!
//! Every attribute value is scanned for `{{node.output}}` references; those
//! become implicit dependency edges in addition to any explicit `depends_on`.
//! Validation covers kinds, attribute names/shapes, reference targets and
//! cycles over the combined edge set. On error no graph is returned.

use super::error::{EngineError, ValidationError};
use super::graph::Dag;
use super::schema::{AttrShape, Catalog};
use super::types::{AttrValue, Declaration, Reference, ResourceGraph, ResourceNode};
use indexmap::IndexMap;
use std::path::Path;

/// Parse a declaration file from disk.
pub fn parse_file(path: &Path) -> Result<Declaration, EngineError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Parse(format!("failed to read {}: {}", path.display(), e)))?;
    parse_str(&content)
}

/// Parse a declaration from a string.
pub fn parse_str(yaml: &str) -> Result<Declaration, EngineError> {
    let decl: Declaration = serde_yaml_ng::from_str(yaml)
        .map_err(|e| EngineError::Parse(format!("YAML parse error: {}", e)))?;
    if decl.version != "1.0" {
        return Err(ValidationError::UnsupportedVersion(decl.version).into());
    }
    Ok(decl)
}

/// Build and validate the resource graph from a parsed declaration.
pub fn build_graph(decl: &Declaration, catalog: &Catalog) -> Result<ResourceGraph, EngineError> {
    let mut nodes: IndexMap<String, ResourceNode> = IndexMap::new();

    // Pass 1: convert attributes, materializing references, and collect edges.
    for (id, resource) in &decl.resources {
        if !valid_name(id) {
            return Err(ValidationError::InvalidName { node: id.clone() }.into());
        }
        let schema = catalog
            .get(&resource.kind)
            .ok_or_else(|| ValidationError::UnknownKind {
                node: id.clone(),
                kind: resource.kind.clone(),
            })?;

        let mut attributes = IndexMap::new();
        for (attr_name, raw) in &resource.attributes {
            let attr_schema =
                schema
                    .attrs
                    .get(attr_name)
                    .ok_or_else(|| ValidationError::UnknownAttribute {
                        node: id.clone(),
                        kind: resource.kind.clone(),
                        attribute: attr_name.clone(),
                    })?;
            let value = convert_value(raw, id, attr_name)?;
            check_shape(&value, attr_schema.shape, id, attr_name)?;
            attributes.insert(attr_name.clone(), value);
        }

        for (attr_name, attr_schema) in &schema.attrs {
            if attr_schema.required && !attributes.contains_key(attr_name) {
                return Err(ValidationError::MissingAttribute {
                    node: id.clone(),
                    attribute: attr_name.clone(),
                }
                .into());
            }
        }

        let mut depends_on: Vec<String> = Vec::new();
        for dep in &resource.depends_on {
            if dep == id {
                return Err(ValidationError::Cyclic { nodes: id.clone() }.into());
            }
            if !depends_on.contains(dep) {
                depends_on.push(dep.clone());
            }
        }

        nodes.insert(
            id.clone(),
            ResourceNode {
                id: id.clone(),
                kind: resource.kind.clone(),
                attributes,
                depends_on,
            },
        );
    }

    // Pass 2: resolve reference targets against the full node set and fold
    // them into the edge list.
    let ids: Vec<String> = nodes.keys().cloned().collect();
    let mut implicit: Vec<(String, Vec<String>)> = Vec::new();
    for (id, node) in &nodes {
        // Explicit depends_on must name existing nodes.
        for dep in &node.depends_on {
            if !nodes.contains_key(dep) {
                return Err(ValidationError::UnknownReference {
                    node: id.clone(),
                    target: dep.clone(),
                }
                .into());
            }
        }

        let mut edges = Vec::new();
        for value in node.attributes.values() {
            for reference in value.references() {
                let target = nodes.get(&reference.node).ok_or_else(|| {
                    ValidationError::UnknownReference {
                        node: id.clone(),
                        target: reference.to_string(),
                    }
                })?;
                let target_schema =
                    catalog
                        .get(&target.kind)
                        .ok_or_else(|| ValidationError::UnknownKind {
                            node: target.id.clone(),
                            kind: target.kind.clone(),
                        })?;
                if !target_schema.has_output(&reference.output) {
                    return Err(ValidationError::UnknownReference {
                        node: id.clone(),
                        target: reference.to_string(),
                    }
                    .into());
                }
                if reference.node == *id {
                    return Err(ValidationError::Cyclic { nodes: id.clone() }.into());
                }
                if !edges.contains(&reference.node) {
                    edges.push(reference.node.clone());
                }
            }
        }
        implicit.push((id.clone(), edges));
    }

    for (id, edges) in implicit {
        let Some(node) = nodes.get_mut(&id) else {
            continue;
        };
        for edge in edges {
            if !node.depends_on.contains(&edge) {
                node.depends_on.push(edge);
            }
        }
    }

    // Cycle detection over the combined explicit+implicit edge set.
    let mut dag = Dag::new(ids);
    for (id, node) in &nodes {
        for dep in &node.depends_on {
            dag.add_edge(dep, id).map_err(EngineError::Parse)?;
        }
    }
    if let Err(members) = dag.toposort() {
        return Err(ValidationError::Cyclic {
            nodes: members.join(", "),
        }
        .into());
    }

    Ok(ResourceGraph {
        name: decl.name.clone(),
        nodes,
    })
}

/// Load a declaration file into a validated graph in one step.
pub fn load_file(path: &Path, catalog: &Catalog) -> Result<(Declaration, ResourceGraph), EngineError> {
    let decl = parse_file(path)?;
    let graph = build_graph(&decl, catalog)?;
    Ok((decl, graph))
}

fn valid_name(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Convert raw YAML to a typed value, turning whole-string `{{node.output}}`
/// templates into references. A template embedded in a longer string is
/// rejected: references are typed values, not string interpolation.
fn convert_value(
    raw: &serde_yaml_ng::Value,
    node: &str,
    attribute: &str,
) -> Result<AttrValue, EngineError> {
    match raw {
        serde_yaml_ng::Value::String(s) => {
            if let Some(reference) = parse_reference(s) {
                return Ok(AttrValue::Ref(reference));
            }
            if s.contains("{{") {
                return Err(ValidationError::EmbeddedReference {
                    node: node.to_string(),
                    attribute: attribute.to_string(),
                }
                .into());
            }
            Ok(AttrValue::Str(s.clone()))
        }
        serde_yaml_ng::Value::Sequence(seq) => {
            let items = seq
                .iter()
                .map(|v| convert_value(v, node, attribute))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(AttrValue::List(items))
        }
        serde_yaml_ng::Value::Mapping(map) => {
            let mut out = IndexMap::new();
            for (k, v) in map {
                let key = match k {
                    serde_yaml_ng::Value::String(s) => s.clone(),
                    other => {
                        return Err(EngineError::Parse(format!(
                            "node '{}' attribute '{}': non-string mapping key {:?}",
                            node, attribute, other
                        )))
                    }
                };
                out.insert(key, convert_value(v, node, attribute)?);
            }
            Ok(AttrValue::Map(out))
        }
        literal => AttrValue::from_yaml(literal).map_err(|e| {
            EngineError::Parse(format!(
                "node '{}' attribute '{}': {}",
                node, attribute, e
            ))
        }),
    }
}

/// Parse a whole-string reference: `{{node.output}}`, surrounding whitespace
/// tolerated inside the braces.
fn parse_reference(s: &str) -> Option<Reference> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?.trim();
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    let (node, output) = inner.split_once('.')?;
    let node = node.trim();
    let output = output.trim();
    if node.is_empty() || output.is_empty() || output.contains('.') {
        return None;
    }
    Some(Reference {
        node: node.to_string(),
        output: output.to_string(),
    })
}

fn check_shape(
    value: &AttrValue,
    shape: AttrShape,
    node: &str,
    attribute: &str,
) -> Result<(), EngineError> {
    // References skip shape checks; the target output supplies the value.
    let ok = match (shape, value) {
        (_, AttrValue::Ref(_)) => true,
        (AttrShape::Sequence, AttrValue::List(_)) => true,
        (AttrShape::Mapping, AttrValue::Map(_)) => true,
        (AttrShape::Scalar, AttrValue::List(_) | AttrValue::Map(_)) => false,
        (AttrShape::Scalar, _scalar) => true,
        _mismatch => false,
    };
    if ok {
        Ok(())
    } else {
        Err(ValidationError::AttributeShape {
            node: node.to_string(),
            attribute: attribute.to_string(),
            expected: shape.to_string(),
        }
        .into())
    }
}
