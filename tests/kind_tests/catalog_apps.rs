//! Install and upgrade every catalog application
//!
//! For each app: create a cluster, install Flux, install the latest version
//! and wait for its HelmRelease. Apps with at least two versions additionally
//! install the previous version on a fresh cluster and upgrade to latest,
//! expecting the Ready reason to report the upgrade.

use apptests::install::{App, CatalogApp};
use apptests::topology::ClusterConfig;
use tracing::info;

use super::helpers::Suite;

/// Story: each app in the catalog installs cleanly with default config
#[tokio::test]
#[ignore = "requires docker, kind, kubectl and flux"]
async fn story_every_catalog_app_installs() {
    let suite = Suite::setup().await.expect("suite setup");
    let apps = suite.catalog.apps().expect("catalog listing");
    assert!(!apps.is_empty(), "catalog has no applications");

    for app in apps {
        info!(app = %app.name, versions = ?app.versions, "install scenario");
        let cluster = suite
            .topology
            .create_root(
                &suite.cancel,
                ClusterConfig::from_suite(&suite.config, "default", Some(suite.catalog.clone())),
            )
            .await
            .expect("cluster create");

        let result = async {
            suite.installer.install(&suite.cancel, &cluster, &App::Reconciler).await?;
            let catalog_app = CatalogApp::latest(&app.name);
            suite
                .installer
                .install(&suite.cancel, &cluster, &App::Catalog(catalog_app.clone()))
                .await?;
            suite.assert_release_ready(&cluster, catalog_app.name(), false).await;
            Ok::<(), apptests::Error>(())
        }
        .await;

        suite.teardown(&cluster).await;
        result.unwrap_or_else(|e| panic!("{} install failed: {}", app.name, e));
    }
}

/// Story: apps with history upgrade from the previous version to latest
#[tokio::test]
#[ignore = "requires docker, kind, kubectl and flux"]
async fn story_upgradable_apps_upgrade_from_previous_version() {
    let suite = Suite::setup().await.expect("suite setup");
    let apps = suite.catalog.apps().expect("catalog listing");

    for app in apps.into_iter().filter(|a| a.is_upgradable()) {
        info!(app = %app.name, versions = ?app.versions, "upgrade scenario");
        let cluster = suite
            .topology
            .create_root(
                &suite.cancel,
                ClusterConfig::from_suite(&suite.config, "default", Some(suite.catalog.clone())),
            )
            .await
            .expect("cluster create");

        let result = async {
            suite.installer.install(&suite.cancel, &cluster, &App::Reconciler).await?;
            let catalog_app = CatalogApp::latest(&app.name);

            suite
                .installer
                .install_previous_version(&suite.cancel, &cluster, &catalog_app)
                .await?;
            suite.assert_release_ready(&cluster, catalog_app.name(), false).await;

            suite.installer.upgrade(&suite.cancel, &cluster, &catalog_app).await?;
            suite.assert_release_ready(&cluster, catalog_app.name(), true).await;
            Ok::<(), apptests::Error>(())
        }
        .await;

        suite.teardown(&cluster).await;
        result.unwrap_or_else(|e| panic!("{} upgrade failed: {}", app.name, e));
    }
}
