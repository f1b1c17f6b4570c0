//! Engine types — declarations, attribute values, graphs, plans, state
//! records and apply reports. Serialized types derive Serialize/Deserialize
//! for YAML roundtripping.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::provider::ProviderConfig;

// ============================================================================
// Attribute values
// ============================================================================

/// A cross-resource reference to another node's output attribute.
///
/// Written in declarations as a whole-string value `{{node.output}}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub node: String,
    pub output: String,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{{{}.{}}}}}", self.node, self.output)
    }
}

/// A typed attribute value: a literal, or a reference to another node's
/// output. A `Ref` surviving plan-time resolution means the target output is
/// only known after apply.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<AttrValue>),
    Map(IndexMap<String, AttrValue>),
    Ref(Reference),
}

impl AttrValue {
    /// Convert a literal YAML value. References are not detected here; the
    /// loader scans for them, state records never contain them.
    pub fn from_yaml(value: &serde_yaml_ng::Value) -> Result<Self, String> {
        match value {
            serde_yaml_ng::Value::Null => Ok(Self::Null),
            serde_yaml_ng::Value::Bool(b) => Ok(Self::Bool(*b)),
            serde_yaml_ng::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Self::Float(f))
                } else {
                    Err(format!("unrepresentable number: {}", n))
                }
            }
            serde_yaml_ng::Value::String(s) => Ok(Self::Str(s.clone())),
            serde_yaml_ng::Value::Sequence(seq) => {
                let items = seq.iter().map(Self::from_yaml).collect::<Result<_, _>>()?;
                Ok(Self::List(items))
            }
            serde_yaml_ng::Value::Mapping(map) => {
                let mut out = IndexMap::new();
                for (k, v) in map {
                    let key = match k {
                        serde_yaml_ng::Value::String(s) => s.clone(),
                        other => return Err(format!("non-string mapping key: {:?}", other)),
                    };
                    out.insert(key, Self::from_yaml(v)?);
                }
                Ok(Self::Map(out))
            }
            serde_yaml_ng::Value::Tagged(_) => Err("YAML tags are not supported".to_string()),
        }
    }

    pub fn to_yaml(&self) -> serde_yaml_ng::Value {
        match self {
            Self::Null => serde_yaml_ng::Value::Null,
            Self::Bool(b) => serde_yaml_ng::Value::Bool(*b),
            Self::Int(i) => serde_yaml_ng::Value::Number((*i).into()),
            Self::Float(f) => serde_yaml_ng::Value::Number(serde_yaml_ng::Number::from(*f)),
            Self::Str(s) => serde_yaml_ng::Value::String(s.clone()),
            Self::List(items) => {
                serde_yaml_ng::Value::Sequence(items.iter().map(Self::to_yaml).collect())
            }
            Self::Map(map) => {
                let mut out = serde_yaml_ng::Mapping::new();
                for (k, v) in map {
                    out.insert(serde_yaml_ng::Value::String(k.clone()), v.to_yaml());
                }
                serde_yaml_ng::Value::Mapping(out)
            }
            Self::Ref(r) => serde_yaml_ng::Value::String(r.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _other => None,
        }
    }

    /// All references reachable within this value, depth-first.
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Ref(r) => out.push(r),
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(map) => {
                for value in map.values() {
                    value.collect_references(out);
                }
            }
            _scalar => {}
        }
    }

    /// Render for plan output. Unresolved references print as known-after-apply.
    pub fn render(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Str(s) => format!("\"{}\"", s),
            Self::List(items) => {
                let inner: Vec<String> = items.iter().map(Self::render).collect();
                format!("[{}]", inner.join(", "))
            }
            Self::Map(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v.render()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Self::Ref(r) => format!("{} (known after apply)", r),
        }
    }
}

/// Convert a literal attribute map for persistence.
pub fn attrs_to_yaml(attrs: &IndexMap<String, AttrValue>) -> IndexMap<String, serde_yaml_ng::Value> {
    attrs.iter().map(|(k, v)| (k.clone(), v.to_yaml())).collect()
}

/// Load a persisted attribute map. Records only ever hold literals.
pub fn attrs_from_yaml(
    attrs: &IndexMap<String, serde_yaml_ng::Value>,
) -> Result<IndexMap<String, AttrValue>, String> {
    let mut out = IndexMap::new();
    for (k, v) in attrs {
        out.insert(k.clone(), AttrValue::from_yaml(v)?);
    }
    Ok(out)
}

// ============================================================================
// Declaration file
// ============================================================================

/// Root declaration — the desired state of a resource graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Declaration {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Human-readable graph name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Opaque provider configuration, passed through to adapter construction
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Resource declarations (order-preserving), keyed by node name
    #[serde(default)]
    pub resources: IndexMap<String, ResourceDecl>,
}

/// A single declared resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// Resource kind, resolved against the catalog
    pub kind: String,

    /// Explicit dependencies (node names applied before this one)
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Attribute mapping; string values may be `{{node.output}}` references
    #[serde(default)]
    pub attributes: IndexMap<String, serde_yaml_ng::Value>,
}

// ============================================================================
// Loaded graph
// ============================================================================

/// A node of the loaded desired-state graph. Immutable once loaded; a re-run
/// re-loads a fresh graph.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    /// Stable node id (the declaration key)
    pub id: String,

    /// Resource kind
    pub kind: String,

    /// Typed attributes with references materialized
    pub attributes: IndexMap<String, AttrValue>,

    /// Combined explicit + implicit dependency edges, deduplicated
    pub depends_on: Vec<String>,
}

/// The loaded desired-state graph. Edge set is acyclic by construction.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    pub name: String,
    pub nodes: IndexMap<String, ResourceNode>,
}

impl ResourceGraph {
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            nodes: IndexMap::new(),
        }
    }
}

// ============================================================================
// Observed state
// ============================================================================

/// Provider-confirmed view of one resource: assigned identifier plus the full
/// attribute set including computed outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    pub provider_id: String,
    pub attributes: IndexMap<String, AttrValue>,
}

/// Progress of a persisted record through an apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Provider confirmed this record.
    Applied,
    /// A mutating call was in flight when this record was written; the next
    /// plan refreshes it via `read` before diffing.
    Applying,
}

/// Per-node persisted state record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Schema version
    pub schema: String,

    /// Node id within the graph
    pub node_id: String,

    /// Resource kind
    pub kind: String,

    /// Provider-assigned identifier (empty while a create is in flight)
    pub provider_id: String,

    /// Record status
    pub status: RecordStatus,

    /// Provider-confirmed attributes, including computed outputs
    #[serde(default)]
    pub attributes: IndexMap<String, serde_yaml_ng::Value>,

    /// Dependency edges recorded at apply time
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// BLAKE3 fingerprint of `attributes`, for drift comparison
    pub fingerprint: String,

    /// When the record was last confirmed
    #[serde(default)]
    pub applied_at: Option<String>,
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    Update,
    Replace,
    Delete,
    NoOp,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Replace => write!(f, "REPLACE"),
            Self::Delete => write!(f, "DELETE"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned action.
#[derive(Debug, Clone)]
pub struct Action {
    /// Node id
    pub node_id: String,

    /// Resource kind
    pub kind: String,

    /// Action to take
    pub action: ActionKind,

    /// Resolved desired attributes. References to outputs of nodes that are
    /// themselves pending Create/Replace remain as `AttrValue::Ref` and are
    /// substituted by the executor once the target has applied.
    pub attributes: IndexMap<String, AttrValue>,

    /// Names of attributes that differ from observed state
    pub changed: Vec<String>,

    /// Provider-assigned id from recorded state (None before first create)
    pub provider_id: Option<String>,

    /// Actions that must reach Applied before this one starts
    pub deps: Vec<String>,

    /// Human-readable summary
    pub description: String,
}

/// Divergence between recorded and freshly observed state, absent any local
/// change. Reported, never blocking for unrelated nodes.
#[derive(Debug, Clone)]
pub struct DriftFinding {
    pub node_id: String,
    pub recorded_fingerprint: String,
    pub observed_fingerprint: String,
    pub detail: String,
}

/// Ordered action list converging observed state toward desired state.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Graph name
    pub name: String,

    /// Actions in execution order (topological; deletes last, reverse order)
    pub actions: Vec<Action>,

    /// Drift findings from the refresh pass
    pub drift: Vec<DriftFinding>,

    /// Summary counts
    pub to_create: u32,
    pub to_update: u32,
    pub to_replace: u32,
    pub to_delete: u32,
    pub unchanged: u32,
}

impl Plan {
    /// True if any action would mutate the provider.
    pub fn has_changes(&self) -> bool {
        self.to_create + self.to_update + self.to_replace + self.to_delete > 0
    }
}

// ============================================================================
// Apply report
// ============================================================================

/// Terminal status of a node during an apply run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Applying,
    Applied,
    Failed,
    Blocked,
    Cancelled,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Applying => write!(f, "APPLYING"),
            Self::Applied => write!(f, "APPLIED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Blocked => write!(f, "BLOCKED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A failed node with its provider error and the dependents it blocked.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub node_id: String,
    pub error: String,
    pub blocked_dependents: Vec<String>,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<FailureReport>,
    pub blocked: Vec<String>,
    pub cancelled: Vec<String>,
    pub total_duration: std::time::Duration,
}

impl ApplyReport {
    pub fn all_applied(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty() && self.cancelled.is_empty()
    }
}
