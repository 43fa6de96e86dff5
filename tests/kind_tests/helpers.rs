//! Shared setup for the kind suites

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use apptests::catalog::Catalog;
use apptests::config::SuiteConfig;
use apptests::install::AppInstaller;
use apptests::readiness::wait_for_helm_release;
use apptests::topology::{ClusterNode, TopologyManager};
use apptests::Result;
use apptests_common::telemetry::init_test_tracing;
use apptests_common::DEFAULT_NAMESPACE;

/// Everything a scenario needs, built once per test
pub struct Suite {
    pub config: SuiteConfig,
    pub catalog: Arc<Catalog>,
    pub topology: TopologyManager,
    pub installer: AppInstaller,
    pub cancel: CancellationToken,
}

impl Suite {
    pub async fn setup() -> Result<Self> {
        init_test_tracing();

        let config = SuiteConfig::from_env();
        let catalog = Arc::new(match &config.catalog_dir {
            Some(dir) => Catalog::new(dir),
            None => Catalog::discover_from_cwd()?,
        });
        let topology = TopologyManager::default();
        topology.ensure_network(&config.network_spec()).await?;

        info!(catalog = %catalog.base_path().display(), network = %config.network_name, "suite ready");
        Ok(Self {
            installer: AppInstaller::default().with_default_catalog(catalog.clone()),
            config,
            catalog,
            topology,
            cancel: CancellationToken::new(),
        })
    }

    /// Destroy `root` (and its children) unless teardown is suppressed
    pub async fn teardown(&self, root: &ClusterNode) {
        if self.config.skip_teardown {
            info!(cluster = %root.name(), "leaving cluster running");
            return;
        }
        root.destroy().await;
    }

    /// Wait for the app's HelmRelease in the default namespace
    pub async fn assert_release_ready(&self, cluster: &ClusterNode, name: &str, expect_upgrade: bool) {
        wait_for_helm_release(&self.cancel, cluster.client(), name, DEFAULT_NAMESPACE, expect_upgrade)
            .await
            .unwrap_or_else(|e| panic!("HelmRelease {} on {} not ready: {}", name, cluster.name(), e));
    }
}
