//! Error taxonomy for the reconciliation engine.
//!
//! Validation errors are total: they abort before any mutating provider call.
//! Provider errors are node-scoped and split into transient (retried by the
//! executor) and permanent (surfaced immediately, dependents blocked).

use thiserror::Error;

/// Errors detected entirely during loading or planning. When one of these is
/// returned, zero remote resources have been touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("dependency cycle detected involving: {nodes}")]
    Cyclic { nodes: String },

    #[error("node '{node}' references unknown target '{target}'")]
    UnknownReference { node: String, target: String },

    #[error("node '{node}' has unknown kind '{kind}'")]
    UnknownKind { node: String, kind: String },

    #[error("node '{node}' is missing required attribute '{attribute}'")]
    MissingAttribute { node: String, attribute: String },

    #[error("node '{node}' declares unknown attribute '{attribute}' for kind '{kind}'")]
    UnknownAttribute {
        node: String,
        kind: String,
        attribute: String,
    },

    #[error("node '{node}' attribute '{attribute}' has wrong shape: expected {expected}")]
    AttributeShape {
        node: String,
        attribute: String,
        expected: String,
    },

    #[error(
        "node '{node}' attribute '{attribute}' embeds a reference inside a larger \
         string; references must be the whole value"
    )]
    EmbeddedReference { node: String, attribute: String },

    #[error("invalid node name '{node}': only [A-Za-z0-9_-] is allowed")]
    InvalidName { node: String },

    #[error("cannot delete '{node}': recorded state of {dependents} still depends on it")]
    DanglingDependents { node: String, dependents: String },

    #[error(
        "node '{node}' binds secret '{secret}' but no grant from identity \
         '{identity}' to that secret exists in the graph"
    )]
    SecretAccessNotGranted {
        node: String,
        identity: String,
        secret: String,
    },

    #[error(
        "replacing '{node}' would orphan {dependents}, which still point at the \
         old resource and are not re-applied by this plan"
    )]
    ReplacementConflict { node: String, dependents: String },

    #[error("unsupported declaration version '{0}': this engine only supports \"1.0\"")]
    UnsupportedVersion(String),
}

/// Errors returned by a provider adapter's control-plane calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider timeout: {0}")]
    Timeout(String),

    #[error("provider rate limit: {0}")]
    RateLimited(String),

    #[error("authorization denied: {0}")]
    AccessDenied(String),

    #[error("conflicting resource: {0}")]
    Conflict(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Transient errors are retried with bounded exponential backoff; all
    /// others surface immediately and block dependents.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited(_))
    }
}

/// State store failures — file IO or a corrupt record.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("state io on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("corrupt state record {path}: {detail}")]
    Corrupt { path: String, detail: String },
}

/// Umbrella error for loader, planner, executor and CLI entry points.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("provider '{kind}': {source}")]
    Provider {
        kind: String,
        source: ProviderError,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("no provider adapter registered for kind '{0}'")]
    NoAdapter(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Timeout("t".into()).is_transient());
        assert!(ProviderError::RateLimited("r".into()).is_transient());
        assert!(!ProviderError::AccessDenied("a".into()).is_transient());
        assert!(!ProviderError::Conflict("c".into()).is_transient());
        assert!(!ProviderError::NotFound("n".into()).is_transient());
        assert!(!ProviderError::Other("o".into()).is_transient());
    }

    #[test]
    fn test_validation_error_display() {
        let e = ValidationError::Cyclic {
            nodes: "a, b".to_string(),
        };
        assert!(e.to_string().contains("cycle"));
        assert!(e.to_string().contains("a, b"));

        let e = ValidationError::SecretAccessNotGranted {
            node: "api-task".to_string(),
            identity: "task-role".to_string(),
            secret: "db-password".to_string(),
        };
        let msg = e.to_string();
        assert!(msg.contains("api-task"));
        assert!(msg.contains("db-password"));
    }

    #[test]
    fn test_engine_error_from_validation() {
        let e: EngineError = ValidationError::InvalidName {
            node: "a b".to_string(),
        }
        .into();
        assert!(matches!(e, EngineError::Validation(_)));
    }
}
