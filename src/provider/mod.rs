//! Cluster-provisioning backends
//!
//! The topology manager only needs two things from a backend: create a
//! cluster (optionally attached to a named network) and, through the returned
//! handle, reach its kubeconfig and delete it. [`KindProvisioner`] is the
//! default; anything else that can hand out kubeconfigs can be swapped in.

mod kind;

pub use kind::{KindCluster, KindProvisioner, KIND_CONFIG, KIND_NETWORK_ENV};

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;

/// A provisioned cluster
#[async_trait]
pub trait ClusterHandle: Debug + Send + Sync {
    /// Cluster name as known to the backend
    fn name(&self) -> &str;

    /// Path to a kubeconfig with admin access
    fn kubeconfig_path(&self) -> &Path;

    /// Delete the cluster and release its credential
    async fn delete(&self) -> Result<()>;
}

/// Creates clusters
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    /// Create `name`, attached to `network` when given, else the backend default.
    ///
    /// An in-flight call is not interrupted by caller cancellation.
    async fn create_cluster(&self, network: Option<&str>, name: &str) -> Result<Arc<dyn ClusterHandle>>;
}
