//! Multicluster cost reporting
//!
//! A management cluster hosts the central aggregator, two workload clusters
//! created from it on the same network run the client. Tearing down the
//! management cluster tears down both workloads.

use apptests::config::{MULTICLUSTER_CENTRAL_APP_NAME, MULTICLUSTER_TEST_APP_NAME};
use apptests::install::App;
use apptests::topology::{ClusterConfig, ClusterRole};
use tracing::warn;

use super::helpers::Suite;

/// Story: central aggregator on mgmt, clients on each workload
#[tokio::test]
#[ignore = "requires docker, kind, kubectl and flux"]
async fn story_opencost_central_on_mgmt_clients_on_workloads() {
    let suite = Suite::setup().await.expect("suite setup");
    let apps = suite.catalog.apps().expect("catalog listing");
    let has = |name: &str| apps.iter().any(|a| a.name == name);
    if !has(MULTICLUSTER_CENTRAL_APP_NAME) || !has(MULTICLUSTER_TEST_APP_NAME) {
        warn!("catalog lacks the opencost apps, skipping multicluster scenario");
        return;
    }

    let mgmt = suite
        .topology
        .create_root(
            &suite.cancel,
            ClusterConfig::from_suite(&suite.config, "mgmt", Some(suite.catalog.clone())),
        )
        .await
        .expect("management cluster create");
    assert_eq!(
        mgmt.role(),
        ClusterRole::Management,
        "set KIND_EXPERIMENTAL_DOCKER_NETWORK to a dedicated network"
    );

    let result = async {
        let workload1 = suite.topology.create_child(&suite.cancel, &mgmt, "workload1").await?;
        let workload2 = suite.topology.create_child(&suite.cancel, &mgmt, "workload2").await?;
        assert_eq!(workload1.parent_name(), Some(mgmt.name()));
        assert_eq!(workload2.network_name(), mgmt.network_name());

        for cluster in [&mgmt, &workload1, &workload2] {
            suite.installer.install(&suite.cancel, cluster, &App::Reconciler).await?;
        }

        suite.installer.install_centralized_opencost(&suite.cancel, &mgmt).await?;
        suite
            .assert_release_ready(&mgmt, MULTICLUSTER_CENTRAL_APP_NAME, false)
            .await;

        for workload in [&workload1, &workload2] {
            suite.installer.install_opencost(&suite.cancel, workload).await?;
            suite
                .assert_release_ready(workload, MULTICLUSTER_TEST_APP_NAME, false)
                .await;
        }
        Ok::<(), apptests::Error>(())
    }
    .await;

    suite.teardown(&mgmt).await;
    result.expect("multicluster scenario");
}
