//! Condition polling for status-bearing resources
//!
//! [`wait_ready`] fetches a resource's conditions on a fixed cadence until a
//! predicate holds, the deadline passes, or the caller cancels. Fetch errors
//! (typically not-found right after apply) count as "not ready yet".

use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use apptests_common::kube_utils::{
    build_api_resource, conditions_from_status, StatusCondition, CONDITION_READY,
};

use crate::config::{POLL_INTERVAL, READY_TIMEOUT};
use crate::{Error, Result};

/// apiVersion of Flux HelmReleases
pub const HELM_RELEASE_API_VERSION: &str = "helm.toolkit.fluxcd.io/v2";
/// kind of Flux HelmReleases
pub const HELM_RELEASE_KIND: &str = "HelmRelease";
/// Ready reason after a successful upgrade
pub const REASON_UPGRADE_SUCCEEDED: &str = "UpgradeSucceeded";

/// Names the resource a wait observes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKey {
    /// apiVersion, e.g. `helm.toolkit.fluxcd.io/v2`
    pub api_version: String,
    /// kind, e.g. `HelmRelease`
    pub kind: String,
    /// Resource name
    pub name: String,
    /// Namespace, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
}

impl ResourceKey {
    /// Key for a namespaced HelmRelease
    pub fn helm_release(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            api_version: HELM_RELEASE_API_VERSION.to_string(),
            kind: HELM_RELEASE_KIND.to_string(),
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Where conditions come from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConditionSource: Send + Sync {
    /// Current `status.conditions` of the keyed resource
    async fn conditions(&self, key: &ResourceKey) -> Result<Vec<StatusCondition>>;
}

/// Reads conditions from the API server as untyped objects
#[derive(Clone)]
pub struct KubeConditionSource {
    client: Client,
}

impl KubeConditionSource {
    /// Source backed by `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConditionSource for KubeConditionSource {
    async fn conditions(&self, key: &ResourceKey) -> Result<Vec<StatusCondition>> {
        let resource = build_api_resource(&key.api_version, &key.kind);
        let api: Api<DynamicObject> = match &key.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        let object = api.get(&key.name).await?;
        Ok(conditions_from_status(&object.data))
    }
}

/// Success predicate: `Ready=True`, optionally with a required reason
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadyPredicate {
    /// Reason the Ready condition must carry, if any
    pub require_reason: Option<String>,
}

impl ReadyPredicate {
    /// Ready=True with any reason
    pub fn ready() -> Self {
        Self::default()
    }

    /// Ready=True with reason `UpgradeSucceeded`
    pub fn upgraded() -> Self {
        Self {
            require_reason: Some(REASON_UPGRADE_SUCCEEDED.to_string()),
        }
    }

    /// Evaluate against a condition set
    pub fn matches(&self, conditions: &[StatusCondition]) -> bool {
        conditions.iter().any(|c| {
            c.is_true(CONDITION_READY)
                && self
                    .require_reason
                    .as_deref()
                    .map_or(true, |reason| c.reason.as_deref() == Some(reason))
        })
    }
}

/// Poll `key` until `predicate` holds.
///
/// Returns `Timeout` once `timeout` elapses and `Cancelled` as soon as `cancel`
/// fires, whichever comes first. Both also abort a fetch in flight.
pub async fn wait_ready<P>(
    cancel: &CancellationToken,
    source: &dyn ConditionSource,
    key: &ResourceKey,
    predicate: P,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<()>
where
    P: Fn(&[StatusCondition]) -> bool,
{
    let deadline = Instant::now() + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("waiting for {}", key)));
        }

        let fetched = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::cancelled(format!("waiting for {}", key)));
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::timeout(key.to_string(), timeout));
            }
            fetched = source.conditions(key) => fetched,
        };

        match fetched {
            Ok(conditions) if predicate(&conditions) => {
                debug!(resource = %key, "resource ready");
                return Ok(());
            }
            Ok(conditions) => trace!(resource = %key, conditions = ?conditions, "not ready yet"),
            Err(e) => trace!(resource = %key, error = %e, "fetch failed, retrying"),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::timeout(key.to_string(), timeout));
        }
        let next = (now + poll_interval).min(deadline);

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::cancelled(format!("waiting for {}", key)));
            }
            _ = tokio::time::sleep_until(next) => {}
        }
    }
}

/// Wait for a HelmRelease to be Ready, after an upgrade when `expect_upgrade`
pub async fn wait_for_helm_release(
    cancel: &CancellationToken,
    client: &Client,
    name: &str,
    namespace: &str,
    expect_upgrade: bool,
) -> Result<()> {
    let key = ResourceKey::helm_release(name, namespace);
    let predicate = if expect_upgrade {
        ReadyPredicate::upgraded()
    } else {
        ReadyPredicate::ready()
    };

    info!(resource = %key, expect_upgrade, "waiting for HelmRelease");
    wait_ready(
        cancel,
        &KubeConditionSource::new(client.clone()),
        &key,
        |conditions| predicate.matches(conditions),
        POLL_INTERVAL,
        READY_TIMEOUT,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn condition(type_: &str, status: &str, reason: Option<&str>) -> StatusCondition {
        StatusCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.map(str::to_string),
            message: None,
        }
    }

    fn key() -> ResourceKey {
        ResourceKey::helm_release("podinfo", "default")
    }

    #[test]
    fn ready_predicate_requires_true_status() {
        let predicate = ReadyPredicate::ready();
        assert!(predicate.matches(&[condition("Ready", "True", Some("InstallSucceeded"))]));
        assert!(!predicate.matches(&[condition("Ready", "False", None)]));
        assert!(!predicate.matches(&[condition("Released", "True", None)]));
        assert!(!predicate.matches(&[]));
    }

    #[test]
    fn upgrade_predicate_distinguishes_install_from_upgrade() {
        let predicate = ReadyPredicate::upgraded();
        assert!(!predicate.matches(&[condition("Ready", "True", Some("InstallSucceeded"))]));
        assert!(predicate.matches(&[condition("Ready", "True", Some("UpgradeSucceeded"))]));
    }

    /// Story: a predicate that never holds times out close to the deadline
    #[tokio::test]
    async fn story_wait_times_out_within_one_tick() {
        let mut source = MockConditionSource::new();
        source.expect_conditions().returning(|_| Ok(Vec::new()));

        let started = std::time::Instant::now();
        let err = wait_ready(
            &CancellationToken::new(),
            &source,
            &key(),
            |_| false,
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout());
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(80), "took {:?}", elapsed);
    }

    /// Story: not-found while the controller catches up is not surfaced
    #[tokio::test]
    async fn story_transient_fetch_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut source = MockConditionSource::new();
        source.expect_conditions().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::internal("helmreleases.helm.toolkit.fluxcd.io \"podinfo\" not found"))
            } else {
                Ok(vec![condition("Ready", "True", Some("InstallSucceeded"))])
            }
        });

        wait_ready(
            &CancellationToken::new(),
            &source,
            &key(),
            |c| ReadyPredicate::ready().matches(c),
            Duration::from_millis(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    /// Story: cancellation aborts the wait with a distinct error
    #[tokio::test]
    async fn story_cancellation_is_not_a_timeout() {
        let mut source = MockConditionSource::new();
        source.expect_conditions().returning(|_| Ok(Vec::new()));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = wait_ready(
            &cancel,
            &source,
            &key(),
            |_| false,
            Duration::from_millis(500),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
        assert!(!err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    /// Condition source whose fetch hangs far past any test deadline
    struct HangingSource;

    #[async_trait]
    impl ConditionSource for HangingSource {
        async fn conditions(&self, _key: &ResourceKey) -> Result<Vec<StatusCondition>> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(Vec::new())
        }
    }

    /// Story: a fetch that hangs does not push the timeout past the deadline
    #[tokio::test]
    async fn story_hanging_fetch_still_times_out_on_deadline() {
        let started = std::time::Instant::now();
        let err = wait_ready(
            &CancellationToken::new(),
            &HangingSource,
            &key(),
            |_| true,
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(500), "took {:?}", started.elapsed());
    }

    /// Story: cancellation interrupts a fetch in flight
    #[tokio::test]
    async fn story_cancellation_interrupts_hanging_fetch() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = wait_ready(
            &cancel,
            &HangingSource,
            &key(),
            |_| true,
            Duration::from_millis(10),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_millis(500), "took {:?}", started.elapsed());
    }

    #[test]
    fn key_display_names_namespace() {
        assert_eq!(key().to_string(), "HelmRelease default/podinfo");
    }
}
