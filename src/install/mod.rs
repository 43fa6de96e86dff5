//! Installing apps onto topology clusters
//!
//! An [`App`] is either the reconciler itself or a catalog app. Catalog apps
//! resolve to `applications/<app>/<version>/helmrelease`, rendered with the
//! release name and namespace substituted, and applied to the cluster.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use apptests_common::DEFAULT_NAMESPACE;

use crate::catalog::{Catalog, MANIFEST_SUBDIR};
use crate::config::{MULTICLUSTER_CENTRAL_APP_NAME, MULTICLUSTER_TEST_APP_NAME};
use crate::flux::{FluxInstaller, ReconcilerInstaller, FLUX_NAMESPACE};
use crate::manifest::{ManifestPipeline, Substitutions};
use crate::topology::{ClusterNode, ClusterRole};
use crate::{Error, Result};

/// Substitution key for the release namespace
pub const RELEASE_NAMESPACE_KEY: &str = "releaseNamespace";
/// Substitution key for the release name
pub const RELEASE_NAME_KEY: &str = "releaseName";

/// Something installable onto a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum App {
    /// The GitOps reconciler (Flux)
    Reconciler,
    /// An app from the catalog
    Catalog(CatalogApp),
}

/// A catalog app install request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogApp {
    /// App name, also used as the release name
    pub app_name: String,
    /// Version directory to install; empty means latest
    pub version_to_install: String,
}

/// A resolved manifest directory and its substitutions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    /// `applications/<app>/<version>`
    pub version_dir: PathBuf,
    /// `applications/<app>/<version>/helmrelease`
    pub manifest_dir: PathBuf,
    /// Values for the manifest placeholders
    pub substitutions: Substitutions,
}

impl CatalogApp {
    /// Request for `version` of `app_name`; empty version means latest
    pub fn new(app_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            version_to_install: version.into(),
        }
    }

    /// Request for the latest version
    pub fn latest(app_name: impl Into<String>) -> Self {
        Self::new(app_name, "")
    }

    /// Release name used on the cluster
    pub fn name(&self) -> &str {
        &self.app_name
    }

    /// Plan for the requested version
    pub fn install_plan(&self, catalog: &Catalog) -> Result<InstallPlan> {
        let dir = catalog.path_to_app(&self.app_name, &self.version_to_install)?;
        Ok(self.plan_for(dir))
    }

    /// Plan for the second-to-latest version
    pub fn previous_plan(&self, catalog: &Catalog) -> Result<InstallPlan> {
        let dir = catalog.prev_version_path(&self.app_name)?;
        Ok(self.plan_for(dir))
    }

    /// Plan for the latest version, regardless of the requested one
    pub fn upgrade_plan(&self, catalog: &Catalog) -> Result<InstallPlan> {
        let dir = catalog.path_to_app(&self.app_name, "")?;
        Ok(self.plan_for(dir))
    }

    fn plan_for(&self, version_dir: PathBuf) -> InstallPlan {
        InstallPlan {
            manifest_dir: version_dir.join(MANIFEST_SUBDIR),
            version_dir,
            substitutions: Substitutions::from([
                (RELEASE_NAMESPACE_KEY.to_string(), DEFAULT_NAMESPACE.to_string()),
                (RELEASE_NAME_KEY.to_string(), self.app_name.clone()),
            ]),
        }
    }
}

impl From<CatalogApp> for App {
    fn from(app: CatalogApp) -> Self {
        Self::Catalog(app)
    }
}

/// Installs apps onto clusters
#[derive(Clone)]
pub struct AppInstaller {
    pipeline: ManifestPipeline,
    reconciler: Arc<dyn ReconcilerInstaller>,
    default_catalog: Option<Arc<Catalog>>,
}

impl Default for AppInstaller {
    fn default() -> Self {
        Self::new(ManifestPipeline::default(), Arc::new(FluxInstaller::new()))
    }
}

impl AppInstaller {
    /// Installer over a pipeline and reconciler installer
    pub fn new(pipeline: ManifestPipeline, reconciler: Arc<dyn ReconcilerInstaller>) -> Self {
        Self {
            pipeline,
            reconciler,
            default_catalog: None,
        }
    }

    /// Catalog used for clusters created without one
    pub fn with_default_catalog(mut self, catalog: Arc<Catalog>) -> Self {
        self.default_catalog = Some(catalog);
        self
    }

    fn catalog_for(&self, cluster: &ClusterNode) -> Result<Arc<Catalog>> {
        cluster
            .catalog()
            .or(self.default_catalog.as_ref())
            .cloned()
            .ok_or_else(|| {
                Error::invalid_argument(format!("no catalog bound to cluster {}", cluster.name()))
            })
    }

    /// Install `app` onto `cluster`
    pub async fn install(&self, cancel: &CancellationToken, cluster: &ClusterNode, app: &App) -> Result<()> {
        match app {
            App::Reconciler => {
                if cancel.is_cancelled() {
                    return Err(Error::cancelled(format!("installing flux on {}", cluster.name())));
                }
                info!(cluster = %cluster.name(), "installing reconciler");
                self.reconciler
                    .install(cancel, cluster.kubeconfig_path(), FLUX_NAMESPACE)
                    .await
            }
            App::Catalog(app) => {
                let plan = app.install_plan(&*self.catalog_for(cluster)?)?;
                self.apply_plan(cancel, cluster, app, &plan).await
            }
        }
    }

    /// Install the second-to-latest version of `app`
    pub async fn install_previous_version(
        &self,
        cancel: &CancellationToken,
        cluster: &ClusterNode,
        app: &CatalogApp,
    ) -> Result<()> {
        let plan = app.previous_plan(&*self.catalog_for(cluster)?)?;
        self.apply_plan(cancel, cluster, app, &plan).await
    }

    /// Apply the latest version of `app`
    pub async fn upgrade(&self, cancel: &CancellationToken, cluster: &ClusterNode, app: &CatalogApp) -> Result<()> {
        let plan = app.upgrade_plan(&*self.catalog_for(cluster)?)?;
        self.apply_plan(cancel, cluster, app, &plan).await
    }

    /// Install the central cost aggregator onto a management cluster
    pub async fn install_centralized_opencost(
        &self,
        cancel: &CancellationToken,
        cluster: &ClusterNode,
    ) -> Result<()> {
        require_role(cluster, ClusterRole::Management)?;
        let app = App::Catalog(CatalogApp::latest(MULTICLUSTER_CENTRAL_APP_NAME));
        self.install(cancel, cluster, &app).await
    }

    /// Install the cost client onto a workload cluster
    pub async fn install_opencost(&self, cancel: &CancellationToken, cluster: &ClusterNode) -> Result<()> {
        require_role(cluster, ClusterRole::Workload)?;
        let app = App::Catalog(CatalogApp::latest(MULTICLUSTER_TEST_APP_NAME));
        self.install(cancel, cluster, &app).await
    }

    async fn apply_plan(
        &self,
        cancel: &CancellationToken,
        cluster: &ClusterNode,
        app: &CatalogApp,
        plan: &InstallPlan,
    ) -> Result<()> {
        info!(
            cluster = %cluster.name(),
            app = %app.app_name,
            path = %plan.version_dir.display(),
            "installing catalog app"
        );
        self.pipeline
            .apply_to_cluster(cancel, cluster.client(), &plan.manifest_dir, &plan.substitutions)
            .await
    }
}

fn require_role(cluster: &ClusterNode, role: ClusterRole) -> Result<()> {
    if cluster.role() != role {
        return Err(Error::invalid_argument(format!(
            "cluster {} is a {} cluster, expected {}",
            cluster.name(),
            cluster.role(),
            role
        )));
    }
    Ok(())
}
