//! Environment-driven suite configuration
//!
//! Overrides are read once at suite setup via [`SuiteConfig::from_env`]. Tests
//! inject values through [`SuiteConfig::from_lookup`] instead of mutating the
//! process environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::network::NetworkSpec;

/// Overrides the cluster name of root clusters
pub const CLUSTER_NAME_ENV: &str = "KIND_CLUSTER_NAME";
/// Overrides the name of the shared docker network
pub const NETWORK_NAME_ENV: &str = "KIND_EXPERIMENTAL_DOCKER_NETWORK";
/// Any non-empty value leaves clusters running after the suite
pub const SKIP_TEARDOWN_ENV: &str = "SKIP_CLUSTER_TEARDOWN";
/// Explicit path to the `applications/` catalog directory
pub const CATALOG_DIR_ENV: &str = "APPTESTS_CATALOG_DIR";
/// Subnet requested for the shared network
pub const NETWORK_SUBNET_ENV: &str = "APPTESTS_NETWORK_SUBNET";
/// `true`/`1` requests an internal (no egress) network
pub const NETWORK_INTERNAL_ENV: &str = "APPTESTS_NETWORK_INTERNAL";

/// Name of the docker network kind uses when none is configured
pub const DEFAULT_NETWORK_NAME: &str = "kind";
/// Interval between readiness polls in scenarios
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// How long scenarios wait for a HelmRelease to become ready
pub const READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// App installed on workload clusters in the multicluster scenario
pub const MULTICLUSTER_TEST_APP_NAME: &str = "opencost";
/// App installed on the management cluster in the multicluster scenario
pub const MULTICLUSTER_CENTRAL_APP_NAME: &str = "centralized-opencost";

/// Configuration for one suite run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteConfig {
    /// Root cluster name override
    pub cluster_name: Option<String>,
    /// Shared network name
    pub network_name: String,
    /// Subnet for the shared network, if pinned
    pub network_subnet: Option<String>,
    /// Whether the shared network is internal
    pub network_internal: bool,
    /// Leave clusters running after the suite
    pub skip_teardown: bool,
    /// Explicit catalog directory
    pub catalog_dir: Option<PathBuf>,
}

impl SuiteConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            cluster_name: non_empty(CLUSTER_NAME_ENV),
            network_name: non_empty(NETWORK_NAME_ENV)
                .unwrap_or_else(|| DEFAULT_NETWORK_NAME.to_string()),
            network_subnet: non_empty(NETWORK_SUBNET_ENV),
            network_internal: non_empty(NETWORK_INTERNAL_ENV)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            skip_teardown: non_empty(SKIP_TEARDOWN_ENV).is_some(),
            catalog_dir: non_empty(CATALOG_DIR_ENV).map(PathBuf::from),
        }
    }

    /// Network the suite's topologies share
    pub fn network_spec(&self) -> NetworkSpec {
        NetworkSpec {
            name: self.network_name.clone(),
            subnet: self.network_subnet.clone(),
            internal: self.network_internal,
        }
    }

    /// Name for a root cluster: the override wins over the requested name
    pub fn root_cluster_name(&self, requested: &str) -> String {
        self.cluster_name
            .clone()
            .unwrap_or_else(|| requested.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = SuiteConfig::from_lookup(lookup(&[]));
        assert_eq!(config.network_name, "kind");
        assert_eq!(config.cluster_name, None);
        assert!(!config.skip_teardown);
        assert!(!config.network_internal);
        assert_eq!(config.root_cluster_name("mgmt"), "mgmt");
    }

    #[test]
    fn overrides_are_picked_up() {
        let config = SuiteConfig::from_lookup(lookup(&[
            (CLUSTER_NAME_ENV, "ci-cluster"),
            (NETWORK_NAME_ENV, "apptests"),
            (NETWORK_SUBNET_ENV, "172.30.0.0/16"),
            (NETWORK_INTERNAL_ENV, "true"),
            (SKIP_TEARDOWN_ENV, "1"),
            (CATALOG_DIR_ENV, "/src/catalog/applications"),
        ]));
        assert_eq!(config.root_cluster_name("mgmt"), "ci-cluster");
        assert!(config.skip_teardown);

        let spec = config.network_spec();
        assert_eq!(spec.name, "apptests");
        assert_eq!(spec.subnet.as_deref(), Some("172.30.0.0/16"));
        assert!(spec.internal);
        assert_eq!(
            config.catalog_dir,
            Some(PathBuf::from("/src/catalog/applications"))
        );
    }

    #[test]
    fn empty_values_count_as_unset() {
        let config = SuiteConfig::from_lookup(lookup(&[
            (SKIP_TEARDOWN_ENV, ""),
            (NETWORK_NAME_ENV, "  "),
        ]));
        assert!(!config.skip_teardown);
        assert_eq!(config.network_name, DEFAULT_NETWORK_NAME);
    }
}
