//! Shared Kubernetes utilities using kube-rs
//!
//! kubectl-equivalent operations without shelling out: client construction
//! from a kubeconfig path, server-side apply of untyped manifests resolved via
//! API discovery, and condition/polling helpers.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{ApiResource, Discovery};
use kube::{Client, Config};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::retry::{retry_transient, DISCOVERY_BACKOFF};
use crate::Error;

/// The "Ready" condition type
pub const CONDITION_READY: &str = "Ready";
/// The "Available" condition type for deployments
pub const CONDITION_AVAILABLE: &str = "Available";
/// The "Established" condition type for CRDs
pub const CONDITION_ESTABLISHED: &str = "Established";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from a kubeconfig file with default timeouts
pub async fn create_client(kubeconfig: &Path) -> Result<Client, Error> {
    let raw = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        Error::internal_with_context(
            "create_client",
            format!("failed to read kubeconfig {}: {}", kubeconfig.display(), e),
        )
    })?;
    let mut config = Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig {}: {}", kubeconfig.display(), e),
            )
        })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Identity fields pulled out of an untyped manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    /// apiVersion, e.g. `helm.toolkit.fluxcd.io/v2`
    pub api_version: String,
    /// kind, e.g. `HelmRelease`
    pub kind: String,
    /// metadata.name
    pub name: String,
    /// metadata.namespace, absent for cluster-scoped resources
    pub namespace: Option<String>,
}

impl ResourceId {
    /// Extract apiVersion/kind/name/namespace from a manifest value
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let field = |pointer: &str| value.pointer(pointer).and_then(Value::as_str);

        let api_version = field("/apiVersion")
            .ok_or_else(|| Error::internal_with_context("resource_id", "manifest missing apiVersion"))?;
        let kind = field("/kind")
            .ok_or_else(|| Error::internal_with_context("resource_id", "manifest missing kind"))?;
        let name = field("/metadata/name").ok_or_else(|| {
            Error::internal_with_context(
                "resource_id",
                format!("{} manifest missing metadata.name", kind),
            )
        })?;

        Ok(Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: field("/metadata/namespace").map(str::to_string),
        })
    }

    /// `Kind/name` or `Kind/namespace/name`, for logs and errors
    pub fn display_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}/{}", self.kind, ns, self.name),
            None => format!("{}/{}", self.kind, self.name),
        }
    }
}

/// Parse apiVersion into (group, version)
///
/// ```
/// use apptests_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from a known apiVersion and kind.
///
/// The plural is guessed; prefer discovery for anything that is applied.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Lowercase plural for a kind, covering the kinds this crate touches
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with('x') {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{}ies", stem)
    } else {
        format!("{}s", lower)
    }
}

/// Run API discovery, retrying transient failures.
///
/// Aggregated API endpoints of freshly installed controllers can make
/// discovery fail for a short while.
pub async fn run_discovery(client: &Client) -> Result<Discovery, Error> {
    retry_transient(&DISCOVERY_BACKOFF, "api-discovery", || {
        let client = client.clone();
        async move { Discovery::new(client).run().await.map_err(Error::from) }
    })
    .await
}

/// Resolve a manifest's type against discovered API resources
pub fn resolve_api_resource(discovery: &Discovery, id: &ResourceId) -> Option<ApiResource> {
    let (group, version) = parse_api_version(&id.api_version);
    let gvk = kube::api::GroupVersionKind {
        group,
        version,
        kind: id.kind.clone(),
    };
    discovery.resolve_gvk(&gvk).map(|(api_resource, _caps)| api_resource)
}

/// Server-side apply one manifest, claiming fields for `field_manager` with
/// forced ownership.
pub async fn apply_with_discovery(
    client: &Client,
    discovery: &Discovery,
    manifest: &Value,
    field_manager: &str,
) -> Result<ResourceId, Error> {
    let id = ResourceId::from_value(manifest)?;
    let Some(api_resource) = resolve_api_resource(discovery, &id) else {
        return Err(Error::apply(
            &id.kind,
            &id.name,
            format!("unknown resource type {}", id.api_version),
        ));
    };

    let api: Api<DynamicObject> = match &id.namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &api_resource),
        None => Api::all_with(client.clone(), &api_resource),
    };

    let params = PatchParams::apply(field_manager).force();
    api.patch(&id.name, &params, &Patch::Apply(manifest))
        .await
        .map_err(|e| Error::apply(&id.kind, &id.name, e.to_string()))?;

    trace!(resource = %id.display_name(), field_manager, "applied manifest");
    Ok(id)
}

/// Create a namespace if it does not already exist (idempotent SSA)
pub async fn ensure_namespace(client: &Client, name: &str, field_manager: &str) -> Result<(), Error> {
    let api: Api<Namespace> = Api::all(client.clone());
    let body = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name }
    });
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Apply(&body))
        .await?;
    debug!(namespace = %name, "namespace ensured");
    Ok(())
}

/// A status condition as found on Kubernetes and Flux resources
///
/// Every field is optional so partially-populated statuses still decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    /// Condition type, e.g. `Ready`
    #[serde(rename = "type", default)]
    pub type_: String,
    /// `True`, `False` or `Unknown`
    #[serde(default)]
    pub status: String,
    /// Machine-readable reason for the last transition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

impl StatusCondition {
    /// Whether this condition is of `type_` and currently `True`
    pub fn is_true(&self, type_: &str) -> bool {
        self.type_ == type_ && self.status == STATUS_TRUE
    }
}

/// Decode `status.conditions` from an untyped object; missing means empty.
pub fn conditions_from_status(object: &Value) -> Vec<StatusCondition> {
    object
        .pointer("/status/conditions")
        .cloned()
        .and_then(|c| serde_json::from_value(c).ok())
        .unwrap_or_default()
}

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Condition type field value
    fn type_field(&self) -> &str;
    /// Condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for StatusCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for k8s_openapi::api::apps::v1::DeploymentCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields
    for k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinitionCondition
{
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Check if a condition of the given type has status "True"
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Poll until a condition is met, the timeout is reached or `cancel` fires
///
/// `check_fn` returns `Ok(true)` when done and `Ok(false)` to keep polling.
/// Errors from `check_fn` are treated as "not yet" and logged at trace.
/// A check in flight is abandoned at the deadline or on cancellation.
pub async fn poll_until<F, Fut>(
    cancel: &CancellationToken,
    timeout: Duration,
    poll_interval: Duration,
    what: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let deadline = Instant::now() + timeout;
    let what = what.into();

    loop {
        let checked = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(what)),
            _ = tokio::time::sleep_until(deadline) => return Err(Error::timeout(what, timeout)),
            checked = check_fn() => checked,
        };
        match checked {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(what = %what, "condition not yet met"),
            Err(e) => trace!(what = %what, error = %e, "poll check failed, retrying"),
        }

        let next = (Instant::now() + poll_interval).min(deadline);
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(what)),
            _ = tokio::time::sleep_until(next) => {}
        }
    }
}

/// Wait until every named CRD reports Established
pub async fn wait_for_crds_established(
    cancel: &CancellationToken,
    client: &Client,
    names: &[String],
    poll_interval: Duration,
    timeout: Duration,
) -> Result<(), Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());

    poll_until(
        cancel,
        timeout,
        poll_interval,
        format!("{} CRDs to be established", names.len()),
        || {
            let crds = crds.clone();
            async move {
                for name in names {
                    let crd = crds.get(name).await?;
                    let conditions = crd.status.as_ref().and_then(|s| s.conditions.as_deref());
                    if !has_condition(conditions, CONDITION_ESTABLISHED) {
                        trace!(crd = %name, "CRD not established yet");
                        return Ok(false);
                    }
                }
                Ok::<bool, Error>(true)
            }
        },
    )
    .await
}

/// Wait for every deployment in a namespace to be Available
pub async fn wait_for_all_deployments(
    cancel: &CancellationToken,
    client: &Client,
    namespace: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<(), Error> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);

    poll_until(
        cancel,
        timeout,
        poll_interval,
        format!("deployments in {} to be available", namespace),
        || {
            let deployments = deployments.clone();
            async move {
                let list = deployments.list(&ListParams::default()).await?;
                if list.items.is_empty() {
                    return Ok(false);
                }
                let all_available = list.items.iter().all(|deployment| {
                    let conditions = deployment
                        .status
                        .as_ref()
                        .and_then(|s| s.conditions.as_deref());
                    has_condition(conditions, CONDITION_AVAILABLE)
                });
                Ok::<bool, Error>(all_available)
            }
        },
    )
    .await
}
