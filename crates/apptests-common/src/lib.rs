//! Common building blocks for apptests: errors, Kubernetes utilities, YAML,
//! retry and tracing setup.

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field owner used for server-side apply of catalog manifests
pub const FIELD_MANAGER: &str = "catalog-apptests";

/// Namespace catalog apps are released into
pub const DEFAULT_NAMESPACE: &str = "default";
