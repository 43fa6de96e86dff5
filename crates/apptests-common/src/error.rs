//! Error types for apptests
//!
//! Errors are structured with fields to aid debugging when a scenario fails.
//! Each variant carries the cluster, app, version or resource that was being
//! worked on so the first failing error can be surfaced verbatim.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for apptests operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Filesystem error
    #[error("io error: {source}")]
    Io {
        /// The underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// An existing shared network disagrees with the requested configuration
    #[error("network {network} misconfigured: {message}")]
    ConfigMismatch {
        /// Name of the network
        network: String,
        /// What disagrees
        message: String,
    },

    /// Child creation against a parent that cannot host children
    #[error("invalid parent cluster {cluster}: {message}")]
    InvalidParent {
        /// Name of the parent cluster
        cluster: String,
        /// Why the parent was rejected
        message: String,
    },

    /// No qualifying version directory exists for an application
    #[error("no application directory found for {app} in {path}")]
    AppNotFound {
        /// Application name
        app: String,
        /// Directory that was searched
        path: String,
    },

    /// The requested version directory does not exist
    #[error("no application directory found for app: {app} version: {version}")]
    VersionNotFound {
        /// Application name
        app: String,
        /// Requested version
        version: String,
    },

    /// Fewer than two qualifying versions exist
    #[error("no old version found for application: {app} ({found} version(s) available)")]
    InsufficientVersions {
        /// Application name
        app: String,
        /// Number of qualifying versions found
        found: usize,
    },

    /// A required argument was missing or empty
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the bad argument
        message: String,
    },

    /// Manifest build, substitution or re-parse failed
    #[error("render failed for {path}: {message}")]
    RenderFailure {
        /// Manifest directory being rendered
        path: String,
        /// Description of what failed
        message: String,
    },

    /// A specific resource was rejected by the cluster
    #[error("apply {kind}/{name} failed: {message}")]
    ApplyFailure {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
        /// Description of what failed
        message: String,
    },

    /// A wait did not converge before its deadline
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout {
        /// What was being waited on
        what: String,
        /// The configured timeout
        after: Duration,
    },

    /// The caller aborted the operation
    #[error("cancelled while {what}")]
    Cancelled {
        /// What was in progress
        what: String,
    },

    /// The cluster-provisioning backend failed to create a cluster
    #[error("cluster create failed for {cluster}: {message}")]
    ClusterCreate {
        /// Name of the cluster being created
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// An external tool or backend failed (kind, docker, flux, kubectl)
    #[error("provider error [{context}]: {message}")]
    Provider {
        /// The backend or tool that failed
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Operation where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a config mismatch error for a network
    pub fn config_mismatch(network: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConfigMismatch {
            network: network.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid parent error
    pub fn invalid_parent(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidParent {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: msg.into(),
        }
    }

    /// Create a render failure for a manifest directory
    pub fn render(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RenderFailure {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an apply failure for a specific resource
    pub fn apply(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ApplyFailure {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(what: impl Into<String>) -> Self {
        Self::Cancelled { what: what.into() }
    }

    /// Create a cluster creation error
    pub fn cluster_create(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ClusterCreate {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a provider error for an external backend
    pub fn provider(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error without context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with operation context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error is a readiness/wait timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this error came from caller cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether the same call may succeed if retried: throttling, server-side
    /// failures and transport errors
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kube {
                source: kube::Error::Api(response),
            } => response.code == 429 || response.code >= 500,
            Self::Kube {
                source: kube::Error::HyperError(_) | kube::Error::Service(_),
            } => true,
            _ => false,
        }
    }

    /// Whether this error is a catalog resolution failure
    pub fn is_catalog(&self) -> bool {
        matches!(
            self,
            Self::AppNotFound { .. } | Self::VersionNotFound { .. } | Self::InsufficientVersions { .. }
        )
    }
}
