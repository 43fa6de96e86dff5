//! Flux installation
//!
//! Flux manifests are rendered with `flux install --export` and applied in two
//! stages. Cluster definitions (CRDs and Namespaces) go first and must be
//! Established before the controllers are applied; then every Deployment in
//! the Flux namespace must become Available.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use apptests_common::kube_utils::{
    apply_with_discovery, create_client, ensure_namespace, run_discovery,
    wait_for_all_deployments, wait_for_crds_established, ResourceId,
};
use apptests_common::yaml::parse_yaml_documents;

use crate::exec::ToolCommand;
use crate::{Error, Result};

/// Namespace Flux is installed into when none is given
pub const FLUX_NAMESPACE: &str = "kommander-flux";
/// Field owner for Flux's own manifests
pub const FLUX_FIELD_MANAGER: &str = "flux";
/// Controllers installed
pub const FLUX_COMPONENTS: &[&str] = &["source-controller", "kustomize-controller", "helm-controller"];

/// Poll interval for both install stages
pub const STAGE_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Deadline for CRDs to become Established
pub const DEFINITIONS_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline for controllers to become Available
pub const CONTROLLERS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Installs a GitOps reconciler onto a cluster. Idempotent.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReconcilerInstaller: Send + Sync {
    /// Install into `namespace` (empty means the default) of the cluster at `kubeconfig`
    async fn install(&self, cancel: &CancellationToken, kubeconfig: &Path, namespace: &str) -> Result<()>;
}

/// Whether a resource belongs to the first install stage
pub fn is_cluster_definition(resource: &Value) -> bool {
    matches!(
        resource.get("kind").and_then(Value::as_str),
        Some("CustomResourceDefinition") | Some("Namespace")
    )
}

/// Split into (cluster definitions, everything else), preserving order
pub fn split_stages(resources: Vec<Value>) -> (Vec<Value>, Vec<Value>) {
    resources.into_iter().partition(is_cluster_definition)
}

fn check_cancelled(cancel: &CancellationToken, stage: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::cancelled(format!("installing flux {}", stage)));
    }
    Ok(())
}

/// Flux installer backed by the `flux` CLI
#[derive(Debug, Clone)]
pub struct FluxInstaller {
    flux: String,
    components: Vec<String>,
}

impl Default for FluxInstaller {
    fn default() -> Self {
        Self {
            flux: "flux".to_string(),
            components: FLUX_COMPONENTS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl FluxInstaller {
    /// Installer for the default controllers
    pub fn new() -> Self {
        Self::default()
    }

    /// Render the install manifests for `namespace`
    pub async fn render(&self, namespace: &str) -> Result<Vec<Value>> {
        let output = ToolCommand::new(&self.flux)
            .args(["install", "--export"])
            .args([
                format!("--namespace={}", namespace),
                format!("--components={}", self.components.join(",")),
            ])
            .run()
            .await?;

        let resources = parse_yaml_documents(&output)
            .map_err(|e| Error::render("flux install --export", e.to_string()))?;
        if resources.is_empty() {
            return Err(Error::render("flux install --export", "no objects rendered"));
        }
        Ok(resources)
    }
}

#[async_trait]
impl ReconcilerInstaller for FluxInstaller {
    async fn install(&self, cancel: &CancellationToken, kubeconfig: &Path, namespace: &str) -> Result<()> {
        let namespace = if namespace.is_empty() {
            FLUX_NAMESPACE
        } else {
            namespace
        };
        check_cancelled(cancel, "setup")?;
        let client = create_client(kubeconfig).await?;
        ensure_namespace(&client, namespace, FLUX_FIELD_MANAGER).await?;

        let (definitions, controllers) = split_stages(self.render(namespace).await?);
        info!(
            namespace,
            definitions = definitions.len(),
            controllers = controllers.len(),
            "installing flux"
        );

        if !definitions.is_empty() {
            check_cancelled(cancel, "cluster definitions")?;
            let discovery = run_discovery(&client).await?;
            let mut crds = Vec::new();
            for resource in &definitions {
                let id = apply_with_discovery(&client, &discovery, resource, FLUX_FIELD_MANAGER).await?;
                if id.kind == "CustomResourceDefinition" {
                    crds.push(id.name);
                }
            }
            wait_for_crds_established(cancel, &client, &crds, STAGE_POLL_INTERVAL, DEFINITIONS_TIMEOUT)
                .await?;
        }

        if !controllers.is_empty() {
            check_cancelled(cancel, "controllers")?;
            // Fresh discovery so the CRDs from stage one resolve.
            let discovery = run_discovery(&client).await?;
            for resource in &controllers {
                apply_with_discovery(&client, &discovery, resource, FLUX_FIELD_MANAGER).await?;
            }
            let has_deployments = controllers
                .iter()
                .filter_map(|r| ResourceId::from_value(r).ok())
                .any(|id| id.kind == "Deployment");
            if has_deployments {
                wait_for_all_deployments(
                    cancel,
                    &client,
                    namespace,
                    STAGE_POLL_INTERVAL,
                    CONTROLLERS_TIMEOUT,
                )
                .await?;
            }
        }

        info!(namespace, "flux installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = r#"---
apiVersion: v1
kind: Namespace
metadata:
  name: kommander-flux
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: helmreleases.helm.toolkit.fluxcd.io
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: helm-controller
  namespace: kommander-flux
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: helmrepositories.source.toolkit.fluxcd.io
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: helm-controller
  namespace: kommander-flux
"#;

    /// Story: definitions go first, controllers second, order kept within each
    #[test]
    fn story_manifests_split_into_two_stages() {
        let resources = parse_yaml_documents(EXPORT).unwrap();
        let (definitions, controllers) = split_stages(resources);

        let kinds = |stage: &[Value]| -> Vec<String> {
            stage
                .iter()
                .map(|r| {
                    format!(
                        "{}/{}",
                        r["kind"].as_str().unwrap(),
                        r["metadata"]["name"].as_str().unwrap()
                    )
                })
                .collect()
        };

        assert_eq!(
            kinds(&definitions),
            vec![
                "Namespace/kommander-flux",
                "CustomResourceDefinition/helmreleases.helm.toolkit.fluxcd.io",
                "CustomResourceDefinition/helmrepositories.source.toolkit.fluxcd.io",
            ]
        );
        assert_eq!(
            kinds(&controllers),
            vec!["ServiceAccount/helm-controller", "Deployment/helm-controller"]
        );
    }

    #[test]
    fn kindless_documents_are_not_definitions() {
        assert!(!is_cluster_definition(&serde_json::json!({"metadata": {}})));
    }

    #[test]
    fn default_components_cover_helm_path() {
        let installer = FluxInstaller::new();
        assert_eq!(
            installer.components,
            vec!["source-controller", "kustomize-controller", "helm-controller"]
        );
    }

    #[tokio::test]
    async fn cancelled_install_stops_before_touching_the_cluster() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = FluxInstaller::new()
            .install(&cancel, Path::new("/nonexistent/kubeconfig"), FLUX_NAMESPACE)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn render_uses_flux_export() {
        let installer = FluxInstaller {
            flux: "sh".to_string(),
            components: vec![],
        };
        // `sh install ...` fails: the error names the command that was run.
        let err = installer.render(FLUX_NAMESPACE).await.unwrap_err();
        assert!(err.to_string().contains("install --export"));
    }
}
