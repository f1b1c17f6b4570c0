//! Per-kind attribute schemas and the example catalog.
//!
//! A schema enumerates a kind's attributes as required/optional,
//! mutable/immutable-after-create, with a declared shape (so nested changes
//! diff precisely) and a role used for permission-edge validation. Computed
//! outputs are what references may target. The engine is agnostic to which
//! catalog it reconciles; `Catalog::example` is the secret-service footprint
//! used by the in-tree backend, demos and tests.

use indexmap::IndexMap;

/// Shape of an attribute value. Sequences diff as ordered lists, mappings as
/// keyed maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrShape {
    Scalar,
    Sequence,
    Mapping,
}

impl std::fmt::Display for AttrShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar => write!(f, "scalar"),
            Self::Sequence => write!(f, "sequence"),
            Self::Mapping => write!(f, "mapping"),
        }
    }
}

/// Role of an attribute in permission-edge validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrRole {
    Plain,
    /// References within this attribute bind secret store entries.
    SecretRef,
    /// A reference to the identity the node acts as.
    IdentityRef,
}

/// Schema entry for one declarable attribute.
#[derive(Debug, Clone)]
pub struct AttrSchema {
    pub required: bool,
    pub mutable: bool,
    pub shape: AttrShape,
    pub role: AttrRole,
}

impl AttrSchema {
    pub fn required(mutable: bool, shape: AttrShape) -> Self {
        Self {
            required: true,
            mutable,
            shape,
            role: AttrRole::Plain,
        }
    }

    pub fn optional(mutable: bool, shape: AttrShape) -> Self {
        Self {
            required: false,
            mutable,
            shape,
            role: AttrRole::Plain,
        }
    }

    pub fn with_role(mut self, role: AttrRole) -> Self {
        self.role = role;
        self
    }
}

/// Marks a kind as a permission grant: its `identity_attr` references the
/// granted identity, its `secret_attr` the secret it may read. Grants are
/// validated as edges; they never gate their own apply.
#[derive(Debug, Clone)]
pub struct GrantSchema {
    pub identity_attr: String,
    pub secret_attr: String,
}

/// Schema for one resource kind.
#[derive(Debug, Clone)]
pub struct KindSchema {
    pub kind: String,
    pub attrs: IndexMap<String, AttrSchema>,
    /// Computed, output-only attribute names (the targets of references)
    pub outputs: Vec<String>,
    pub grant: Option<GrantSchema>,
}

impl KindSchema {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            attrs: IndexMap::new(),
            outputs: Vec::new(),
            grant: None,
        }
    }

    fn attr(mut self, name: &str, schema: AttrSchema) -> Self {
        self.attrs.insert(name.to_string(), schema);
        self
    }

    fn output(mut self, name: &str) -> Self {
        self.outputs.push(name.to_string());
        self
    }

    fn grants(mut self, identity_attr: &str, secret_attr: &str) -> Self {
        self.grant = Some(GrantSchema {
            identity_attr: identity_attr.to_string(),
            secret_attr: secret_attr.to_string(),
        });
        self
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o == name)
    }
}

/// The set of kind schemas the engine reconciles against.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    kinds: IndexMap<String, KindSchema>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: KindSchema) {
        self.kinds.insert(schema.kind.clone(), schema);
    }

    pub fn get(&self, kind: &str) -> Option<&KindSchema> {
        self.kinds.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    /// Example catalog: the cloud footprint of a secret-management service
    /// across its three topologies (single host, load-balanced cluster,
    /// cluster behind a dedicated network load balancer).
    pub fn example() -> Self {
        use AttrShape::{Mapping, Scalar, Sequence};

        let mut catalog = Self::new();

        catalog.register(
            KindSchema::new("registry")
                .attr("name", AttrSchema::required(false, Scalar))
                .output("repository_url"),
        );

        // Secret-typed attributes only ever hold the opaque store reference,
        // never the payload.
        catalog.register(
            KindSchema::new("secret")
                .attr("name", AttrSchema::required(false, Scalar))
                .attr("description", AttrSchema::optional(true, Scalar))
                .output("secret_ref"),
        );

        catalog.register(
            KindSchema::new("identity")
                .attr("name", AttrSchema::required(false, Scalar))
                .attr("assume_service", AttrSchema::optional(true, Scalar))
                .output("identity_ref"),
        );

        catalog.register(
            KindSchema::new("grant")
                .attr(
                    "identity",
                    AttrSchema::required(true, Scalar).with_role(AttrRole::IdentityRef),
                )
                .attr(
                    "secret",
                    AttrSchema::required(true, Scalar).with_role(AttrRole::SecretRef),
                )
                .grants("identity", "secret"),
        );

        catalog.register(
            KindSchema::new("cluster")
                .attr("name", AttrSchema::required(false, Scalar))
                .output("cluster_ref"),
        );

        catalog.register(
            KindSchema::new("task_definition")
                .attr("name", AttrSchema::required(false, Scalar))
                .attr("image", AttrSchema::required(true, Scalar))
                .attr("cpu", AttrSchema::optional(true, Scalar))
                .attr("memory", AttrSchema::optional(true, Scalar))
                .attr("command", AttrSchema::optional(true, Sequence))
                .attr("environment", AttrSchema::optional(true, Mapping))
                .attr(
                    "identity",
                    AttrSchema::required(true, Scalar).with_role(AttrRole::IdentityRef),
                )
                .attr(
                    "secrets",
                    AttrSchema::optional(true, Mapping).with_role(AttrRole::SecretRef),
                )
                .output("task_ref"),
        );

        catalog.register(
            KindSchema::new("service")
                .attr("name", AttrSchema::required(false, Scalar))
                .attr("cluster", AttrSchema::required(false, Scalar))
                .attr("task", AttrSchema::required(true, Scalar))
                .attr("desired_count", AttrSchema::optional(true, Scalar))
                .attr("load_balancer", AttrSchema::optional(true, Scalar))
                .attr("security_groups", AttrSchema::optional(true, Sequence))
                .output("service_ref"),
        );

        catalog.register(
            KindSchema::new("load_balancer")
                .attr("name", AttrSchema::required(false, Scalar))
                .attr("internal", AttrSchema::optional(false, Scalar))
                .attr("port", AttrSchema::optional(true, Scalar))
                .attr("security_groups", AttrSchema::optional(true, Sequence))
                .output("lb_ref")
                .output("dns_name"),
        );

        catalog.register(
            KindSchema::new("security_group")
                .attr("name", AttrSchema::required(false, Scalar))
                .attr("ingress", AttrSchema::optional(true, Sequence))
                .output("group_ref"),
        );

        catalog.register(
            KindSchema::new("instance")
                .attr("name", AttrSchema::required(false, Scalar))
                .attr("image", AttrSchema::required(true, Scalar))
                .attr("size", AttrSchema::optional(true, Scalar))
                .attr("public_ip", AttrSchema::optional(false, Scalar))
                .attr("security_groups", AttrSchema::optional(true, Sequence))
                .output("instance_ref")
                .output("address"),
        );

        catalog
    }
}
