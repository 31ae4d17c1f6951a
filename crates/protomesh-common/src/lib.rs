//! Protomesh Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all protomesh components:
//! - Error types
//! - Naming helpers
//! - Common constants

pub mod error;
pub mod utils;

// Re-exports for convenience
pub use error::{MeshError, Result};
pub use utils::{local_ip, sanitize_name};

/// Label placed on every object this control plane creates
pub const MANAGED_BY_LABEL: &str = "manager";

/// Value of [`MANAGED_BY_LABEL`] on owned objects
pub const MANAGED_BY_VALUE: &str = "protomesh";

/// Default namespace for mesh-wide generated configuration
pub const DEFAULT_ROOT_NAMESPACE: &str = "istio-system";

/// Export scope meaning "the namespace the resource is declared in"
pub const EXPORT_SAME_NAMESPACE: &str = ".";

/// Export scope meaning "every namespace"
pub const EXPORT_ALL: &str = "*";
