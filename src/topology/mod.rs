//! Cluster topology lifecycle
//!
//! A topology is a root cluster, optionally attached to a dedicated network,
//! plus workload clusters created from it on the same network.
//!
//! # Ownership
//!
//! A parent owns its children through a name-keyed map of `Arc`s. A child only
//! records its parent's name, so there are no reference cycles and teardown
//! only ever walks downwards.
//!
//! # Teardown
//!
//! Each node holds a teardown closure that runs at most once. Creating a child
//! replaces the parent's closure with one that destroys every current child
//! before the parent. Child failures are logged and skipped so the parent is
//! always released.
//!
//! # Concurrency
//!
//! Role, network, client and handle are fixed at construction. The child map
//! and teardown closure sit behind a per-node mutex, held across child
//! provisioning so that concurrent requests for the same child name create
//! exactly one cluster.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use apptests_common::kube_utils::create_client;

use crate::catalog::Catalog;
use crate::config::{SuiteConfig, DEFAULT_NETWORK_NAME};
use crate::network::{self, DockerNetworks, Network, NetworkProvisioner, NetworkSpec};
use crate::provider::{ClusterHandle, ClusterProvisioner, KindProvisioner};
use crate::{Error, Result};

/// Name used for a root cluster when none is given
pub const DEFAULT_ROOT_NAME: &str = "default";
/// Name used for a child cluster when none is given
pub const DEFAULT_CHILD_NAME: &str = "workload1";

/// Role a cluster plays in its topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterRole {
    /// Root on a dedicated network; may have workload children
    Management,
    /// Child of a management cluster
    Workload,
    /// Root on the default network; no parent, no children
    Standalone,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Management => write!(f, "management"),
            Self::Workload => write!(f, "workload"),
            Self::Standalone => write!(f, "standalone"),
        }
    }
}

/// What to create for a root cluster
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    /// Cluster name; empty means [`DEFAULT_ROOT_NAME`]
    pub name: String,
    /// Network to attach to; `None` or the default network gives a standalone cluster
    pub network: Option<NetworkSpec>,
    /// Catalog bound to the cluster and inherited by its children
    pub catalog: Option<Arc<Catalog>>,
}

impl ClusterConfig {
    /// Root config honoring the suite's name override and network settings
    pub fn from_suite(suite: &SuiteConfig, name: &str, catalog: Option<Arc<Catalog>>) -> Self {
        Self {
            name: suite.root_cluster_name(name),
            network: Some(suite.network_spec()),
            catalog,
        }
    }

    fn dedicated_network(&self) -> Option<&NetworkSpec> {
        self.network
            .as_ref()
            .filter(|spec| !spec.name.is_empty() && spec.name != DEFAULT_NETWORK_NAME)
    }
}

/// Builds API clients from kubeconfig files
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Client for the cluster described by `kubeconfig`
    async fn connect(&self, kubeconfig: &Path) -> Result<Client>;
}

/// Clients from kubeconfig files on disk
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeconfigClients;

#[async_trait]
impl ClientFactory for KubeconfigClients {
    async fn connect(&self, kubeconfig: &Path) -> Result<Client> {
        create_client(kubeconfig).await
    }
}

type Teardown = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct NodeState {
    children: BTreeMap<String, Arc<ClusterNode>>,
    teardown: Option<Teardown>,
}

/// One cluster in a topology
pub struct ClusterNode {
    name: String,
    role: ClusterRole,
    network: Option<Network>,
    client: Client,
    handle: Arc<dyn ClusterHandle>,
    catalog: Option<Arc<Catalog>>,
    parent: Option<String>,
    state: Mutex<NodeState>,
}

impl fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterNode")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("network", &self.network)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

impl ClusterNode {
    fn new(
        name: String,
        role: ClusterRole,
        network: Option<Network>,
        client: Client,
        handle: Arc<dyn ClusterHandle>,
        catalog: Option<Arc<Catalog>>,
        parent: Option<String>,
    ) -> Self {
        let teardown = delete_handle(handle.clone());
        Self {
            name,
            role,
            network,
            client,
            handle,
            catalog,
            parent,
            state: Mutex::new(NodeState {
                children: BTreeMap::new(),
                teardown: Some(teardown),
            }),
        }
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role in the topology
    pub fn role(&self) -> ClusterRole {
        self.role
    }

    /// Network the cluster is attached to, if dedicated
    pub fn network(&self) -> Option<&Network> {
        self.network.as_ref()
    }

    /// Name of the dedicated network, if any
    pub fn network_name(&self) -> Option<&str> {
        self.network.as_ref().map(|n| n.name.as_str())
    }

    /// API client for this cluster
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Kubeconfig path from the provisioning backend
    pub fn kubeconfig_path(&self) -> &Path {
        self.handle.kubeconfig_path()
    }

    /// Catalog bound at creation
    pub fn catalog(&self) -> Option<&Arc<Catalog>> {
        self.catalog.as_ref()
    }

    /// Name of the parent for workload clusters
    pub fn parent_name(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Registered children, ordered by name
    pub async fn children(&self) -> Vec<Arc<ClusterNode>> {
        self.state.lock().await.children.values().cloned().collect()
    }

    /// A registered child by name
    pub async fn child(&self, name: &str) -> Option<Arc<ClusterNode>> {
        self.state.lock().await.children.get(name).cloned()
    }

    /// Tear down this cluster and, first, all of its children.
    ///
    /// Runs at most once; later calls are no-ops.
    pub async fn destroy(&self) {
        let teardown = self.state.lock().await.teardown.take();
        match teardown {
            Some(teardown) => {
                info!(cluster = %self.name, role = %self.role, "destroying cluster");
                teardown().await;
            }
            None => debug!(cluster = %self.name, "cluster already destroyed"),
        }
    }
}

#[cfg(test)]
impl ClusterNode {
    /// Node with an offline client and a no-op handle
    pub(crate) fn for_tests(name: &str, role: ClusterRole, catalog: Option<Arc<Catalog>>) -> Arc<Self> {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = Client::try_from(config).unwrap();
        let parent = (role == ClusterRole::Workload).then(|| "mgmt".to_string());
        let network = (role != ClusterRole::Standalone).then(|| Network {
            id: "net-1".to_string(),
            name: "apptests".to_string(),
        });
        Arc::new(Self::new(
            name.to_string(),
            role,
            network,
            client,
            crate::provider::testing::StaticHandle::new(name),
            catalog,
            parent,
        ))
    }
}

fn delete_handle(handle: Arc<dyn ClusterHandle>) -> Teardown {
    Box::new(move || {
        async move {
            if let Err(e) = handle.delete().await {
                warn!(cluster = %handle.name(), error = %e, "failed to delete cluster");
            }
        }
        .boxed()
    })
}

fn cascade(children: Vec<Arc<ClusterNode>>, handle: Arc<dyn ClusterHandle>) -> Teardown {
    Box::new(move || {
        async move {
            for child in children {
                child.destroy().await;
            }
            if let Err(e) = handle.delete().await {
                warn!(cluster = %handle.name(), error = %e, "failed to delete cluster");
            }
        }
        .boxed()
    })
}

/// Creates clusters and wires up their relationships
#[derive(Clone)]
pub struct TopologyManager {
    provisioner: Arc<dyn ClusterProvisioner>,
    networks: Arc<dyn NetworkProvisioner>,
    clients: Arc<dyn ClientFactory>,
}

impl Default for TopologyManager {
    fn default() -> Self {
        Self::new(
            Arc::new(KindProvisioner::new()),
            Arc::new(DockerNetworks::new()),
            Arc::new(KubeconfigClients),
        )
    }
}

impl TopologyManager {
    /// Manager over the given backends
    pub fn new(
        provisioner: Arc<dyn ClusterProvisioner>,
        networks: Arc<dyn NetworkProvisioner>,
        clients: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            provisioner,
            networks,
            clients,
        }
    }

    /// Create or validate a shared network
    pub async fn ensure_network(&self, spec: &NetworkSpec) -> Result<Network> {
        network::ensure_network(self.networks.as_ref(), spec).await
    }

    /// Remove a shared network if it exists
    pub async fn delete_network(&self, name: &str) -> Result<()> {
        network::delete_network(self.networks.as_ref(), name).await
    }

    /// Create a root cluster.
    ///
    /// Attaching to a dedicated network makes it a management cluster,
    /// otherwise it is standalone.
    pub async fn create_root(
        &self,
        cancel: &CancellationToken,
        config: ClusterConfig,
    ) -> Result<Arc<ClusterNode>> {
        let name = if config.name.is_empty() {
            DEFAULT_ROOT_NAME.to_string()
        } else {
            config.name.clone()
        };

        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("creating cluster {}", name)));
        }

        let network = match config.dedicated_network() {
            Some(spec) => Some(self.ensure_network(spec).await?),
            None => None,
        };
        let role = if network.is_some() {
            ClusterRole::Management
        } else {
            ClusterRole::Standalone
        };

        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("creating cluster {}", name)));
        }
        let (handle, client) = self
            .provision(network.as_ref().map(|n| n.name.as_str()), &name)
            .await?;

        info!(cluster = %name, role = %role, network = ?network.as_ref().map(|n| &n.name), "cluster ready");
        Ok(Arc::new(ClusterNode::new(
            name,
            role,
            network,
            client,
            handle,
            config.catalog,
            None,
        )))
    }

    /// Create a workload cluster under `parent`, or return the existing one.
    ///
    /// An empty name means [`DEFAULT_CHILD_NAME`].
    pub async fn create_child(
        &self,
        cancel: &CancellationToken,
        parent: &Arc<ClusterNode>,
        name: &str,
    ) -> Result<Arc<ClusterNode>> {
        let name = if name.is_empty() { DEFAULT_CHILD_NAME } else { name };

        let (network_name, network) = match (&parent.network, parent.role) {
            (Some(network), ClusterRole::Management) => (network.name.clone(), network.clone()),
            (None, _) => {
                return Err(Error::invalid_parent(&parent.name, "cluster has no network"));
            }
            (Some(_), role) => {
                return Err(Error::invalid_parent(
                    &parent.name,
                    format!("{} clusters cannot have children", role),
                ));
            }
        };

        let mut state = parent.state.lock().await;
        if let Some(existing) = state.children.get(name) {
            debug!(parent = %parent.name, cluster = %name, "reusing existing child");
            return Ok(existing.clone());
        }
        if state.teardown.is_none() {
            return Err(Error::invalid_parent(&parent.name, "cluster was destroyed"));
        }
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("creating cluster {}", name)));
        }

        let (handle, client) = self.provision(Some(&network_name), name).await?;
        let child = Arc::new(ClusterNode::new(
            name.to_string(),
            ClusterRole::Workload,
            Some(network),
            client,
            handle,
            parent.catalog.clone(),
            Some(parent.name.clone()),
        ));

        state.children.insert(name.to_string(), child.clone());
        let children = state.children.values().cloned().collect();
        state.teardown = Some(cascade(children, parent.handle.clone()));

        info!(parent = %parent.name, cluster = %name, network = %network_name, "workload cluster ready");
        Ok(child)
    }

    // Create the cluster and its client; a client failure deletes the cluster.
    async fn provision(
        &self,
        network: Option<&str>,
        name: &str,
    ) -> Result<(Arc<dyn ClusterHandle>, Client)> {
        let handle = self
            .provisioner
            .create_cluster(network, name)
            .await
            .map_err(|e| match e {
                Error::ClusterCreate { .. } => e,
                other => Error::cluster_create(name, other.to_string()),
            })?;

        match self.clients.connect(handle.kubeconfig_path()).await {
            Ok(client) => Ok((handle, client)),
            Err(e) => {
                warn!(cluster = %name, error = %e, "client construction failed, deleting cluster");
                if let Err(delete_err) = handle.delete().await {
                    warn!(cluster = %name, error = %delete_err, "failed to delete cluster");
                }
                Err(e)
            }
        }
    }
}
