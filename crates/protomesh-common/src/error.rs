//! Error types for protomesh
//!
//! `MeshError` classifies failures the way the control loops react to them:
//! - input errors skip one resource for one cycle
//! - backend errors schedule a bounded retry of the whole cycle
//! - invariant violations abort one resource's operation and are logged as errors

/// Application-specific error types
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    #[error("invalid resource {resource}: {reason}")]
    InvalidResource { resource: String, reason: String },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("resource version conflict on {namespace}/{name}: expected {expected}, found {found}")]
    Conflict {
        namespace: String,
        name: String,
        expected: String,
        found: String,
    },

    #[error("{kind} '{namespace}/{name}' not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("address space exhausted: {0}")]
    Exhausted(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl MeshError {
    /// Build an input error for a resource key
    pub fn invalid(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        MeshError::InvalidResource {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Whether re-running the whole cycle can clear this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, MeshError::Backend(_) | MeshError::Conflict { .. })
    }

    /// Whether this error only affects the resource it was raised for
    pub fn is_input_error(&self) -> bool {
        matches!(self, MeshError::InvalidResource { .. })
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_error_display() {
        let err = MeshError::invalid("ns1/svc", "service has no hosts");
        assert_eq!(
            err.to_string(),
            "invalid resource ns1/svc: service has no hosts"
        );

        let err = MeshError::Conflict {
            namespace: "istio-system".to_string(),
            name: "route".to_string(),
            expected: "3".to_string(),
            found: "4".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "resource version conflict on istio-system/route: expected 3, found 4"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(MeshError::Backend("timeout".to_string()).is_retryable());
        assert!(!MeshError::invalid("x", "y").is_retryable());
        assert!(MeshError::invalid("x", "y").is_input_error());
        assert!(!MeshError::InvariantViolation("kind".to_string()).is_input_error());
    }
}
