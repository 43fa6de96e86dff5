//! Manifest render and apply pipeline
//!
//! A manifest directory is built into a multi-document stream by an external
//! build engine (`kubectl kustomize`), each resource is substituted
//! independently and re-parsed, and the result is server-side applied in
//! render order with forced ownership.
//!
//! Apply is per resource, not atomic: a rejected resource aborts the run and
//! resources applied before it stay applied.

mod substitute;

pub use substitute::{substitute, Substitutions};

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use kube::discovery::Discovery;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use apptests_common::kube_utils::{
    apply_with_discovery, resolve_api_resource, run_discovery, ResourceId,
};
use apptests_common::yaml::{parse_yaml, parse_yaml_documents, to_yaml};
use apptests_common::FIELD_MANAGER;

use crate::exec::ToolCommand;
use crate::{Error, Result};

/// Composes a directory of resource fragments into one YAML stream
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestBuilder: Send + Sync {
    /// Build `dir` into a multi-document YAML string
    async fn build(&self, dir: &Path) -> Result<String>;
}

/// Builds kustomizations with `kubectl kustomize`
#[derive(Debug, Clone)]
pub struct KubectlKustomize {
    kubectl: String,
}

impl Default for KubectlKustomize {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
        }
    }
}

#[async_trait]
impl ManifestBuilder for KubectlKustomize {
    async fn build(&self, dir: &Path) -> Result<String> {
        ToolCommand::new(&self.kubectl)
            .args(["kustomize".to_string(), dir.display().to_string()])
            .run()
            .await
    }
}

/// Sends one rendered resource to a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    /// Apply a single resource
    async fn apply(&self, resource: &Value) -> Result<()>;
}

/// Server-side apply against a live cluster
///
/// API discovery runs on the first apply and again whenever a resource names
/// a type the cached discovery does not know, such as a custom resource whose
/// CRD was applied earlier in the same run.
pub struct KubeApplier {
    client: Client,
    field_manager: String,
    discovery: Mutex<Option<Arc<Discovery>>>,
}

impl KubeApplier {
    /// Applier claiming fields as `field_manager`
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            discovery: Mutex::new(None),
        }
    }

    async fn discovery_for(&self, id: &ResourceId) -> Result<Arc<Discovery>> {
        let mut cached = self.discovery.lock().await;
        if let Some(discovery) = cached.as_ref().filter(|d| !needs_refresh(d, id)) {
            return Ok(discovery.clone());
        }
        if cached.is_some() {
            debug!(resource = %id.display_name(), "unknown resource type, refreshing discovery");
        }
        let discovery = Arc::new(run_discovery(&self.client).await?);
        *cached = Some(discovery.clone());
        Ok(discovery)
    }
}

fn needs_refresh(discovery: &Discovery, id: &ResourceId) -> bool {
    resolve_api_resource(discovery, id).is_none()
}

#[async_trait]
impl ResourceApplier for KubeApplier {
    async fn apply(&self, resource: &Value) -> Result<()> {
        let id = ResourceId::from_value(resource)?;
        let discovery = self.discovery_for(&id).await?;
        apply_with_discovery(&self.client, &discovery, resource, &self.field_manager).await?;
        Ok(())
    }
}

/// Render and apply manifest directories
#[derive(Clone)]
pub struct ManifestPipeline {
    builder: Arc<dyn ManifestBuilder>,
}

impl Default for ManifestPipeline {
    fn default() -> Self {
        Self::new(Arc::new(KubectlKustomize::default()))
    }
}

impl ManifestPipeline {
    /// Pipeline using `builder` as the build engine
    pub fn new(builder: Arc<dyn ManifestBuilder>) -> Self {
        Self { builder }
    }

    /// Build `dir` and substitute each resource. All or nothing.
    pub async fn render(&self, dir: &Path, subs: &Substitutions) -> Result<Vec<Value>> {
        let path = dir.display().to_string();

        let built = self
            .builder
            .build(dir)
            .await
            .map_err(|e| Error::render(&path, e.to_string()))?;
        let documents = parse_yaml_documents(&built)
            .map_err(|e| Error::render(&path, format!("failed to decode build output: {}", e)))?;

        let mut rendered = Vec::with_capacity(documents.len());
        for (index, document) in documents.iter().enumerate() {
            let text = to_yaml(document).map_err(|e| {
                Error::render(&path, format!("failed to serialize document {}: {}", index, e))
            })?;
            let substituted = substitute(&text, subs).map_err(|e| {
                Error::render(&path, format!("failed to substitute document {}: {}", index, e))
            })?;
            let resource = parse_yaml(&substituted).map_err(|e| {
                Error::render(&path, format!("document {} invalid after substitution: {}", index, e))
            })?;
            if !resource.is_object() {
                return Err(Error::render(
                    &path,
                    format!("document {} is not a resource after substitution", index),
                ));
            }
            rendered.push(resource);
        }

        debug!(path = %path, resources = rendered.len(), "rendered manifests");
        Ok(rendered)
    }

    /// Render `dir` and apply each resource in order, stopping at the first failure.
    pub async fn apply(
        &self,
        cancel: &CancellationToken,
        applier: &dyn ResourceApplier,
        dir: &Path,
        subs: &Substitutions,
    ) -> Result<()> {
        if dir.as_os_str().is_empty() {
            return Err(Error::invalid_argument("path is required"));
        }

        let resources = self.render(dir, subs).await?;
        for resource in &resources {
            if cancel.is_cancelled() {
                return Err(Error::cancelled(format!("applying {}", dir.display())));
            }
            let id = ResourceId::from_value(resource)?;
            applier.apply(resource).await.map_err(|e| match e {
                Error::ApplyFailure { .. } => e,
                other => Error::apply(&id.kind, &id.name, other.to_string()),
            })?;
            debug!(resource = %id.display_name(), "applied");
        }

        info!(path = %dir.display(), resources = resources.len(), "applied manifests");
        Ok(())
    }

    /// Apply to `client` with the suite's field owner
    pub async fn apply_to_cluster(
        &self,
        cancel: &CancellationToken,
        client: &Client,
        dir: &Path,
        subs: &Substitutions,
    ) -> Result<()> {
        let applier = KubeApplier::new(client.clone(), FIELD_MANAGER);
        self.apply(cancel, &applier, dir, subs).await
    }
}
