//! Shared container network management
//!
//! Every cluster of a topology attaches to one named docker network. The
//! network is created on first use and validated on every later use: an
//! existing network whose internal flag or subnet disagrees with what was
//! requested is a configuration error, never silently reused.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::exec::ToolCommand;
use crate::{Error, Result};

/// Serializes ensure-network calls within the process
static NETWORK_LOCK: Mutex<()> = Mutex::const_new(());

/// Requested configuration for a shared network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Network name
    pub name: String,
    /// Subnet in CIDR form; `None` lets the runtime choose
    pub subnet: Option<String>,
    /// Whether the network has no external egress
    pub internal: bool,
}

impl NetworkSpec {
    /// A default bridge network with the given name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Identity of a network that exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    /// Runtime-assigned id
    pub id: String,
    /// Network name
    pub name: String,
}

/// What the runtime reports about an existing network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Runtime-assigned id
    pub id: String,
    /// Network name
    pub name: String,
    /// Whether the network is internal
    pub internal: bool,
    /// Configured IPAM subnets, in order
    pub subnets: Vec<String>,
}

/// Backend that creates, inspects and deletes networks
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkProvisioner: Send + Sync {
    /// Look up a network by name; `None` when it does not exist
    async fn inspect(&self, name: &str) -> Result<Option<NetworkInfo>>;

    /// Create a network
    async fn create(&self, spec: &NetworkSpec) -> Result<Network>;

    /// Remove a network by id or name
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Check an existing network against the requested spec.
pub fn validate_existing(spec: &NetworkSpec, info: &NetworkInfo) -> Result<Network> {
    if info.internal != spec.internal {
        return Err(Error::config_mismatch(
            &spec.name,
            format!(
                "internal flag does not match (expected {}, actual {})",
                spec.internal, info.internal
            ),
        ));
    }

    if let Some(subnet) = &spec.subnet {
        let Some(actual) = info.subnets.first() else {
            return Err(Error::config_mismatch(&spec.name, "subnet configuration is missing"));
        };
        if actual != subnet {
            return Err(Error::config_mismatch(
                &spec.name,
                format!("subnet expected {} actual {}", subnet, actual),
            ));
        }
    }

    Ok(Network {
        id: info.id.clone(),
        name: info.name.clone(),
    })
}

/// Create the network if missing, else validate it. Calls are serialized.
pub async fn ensure_network(provisioner: &dyn NetworkProvisioner, spec: &NetworkSpec) -> Result<Network> {
    if spec.name.trim().is_empty() {
        return Err(Error::invalid_argument("network name is required"));
    }

    let _guard = NETWORK_LOCK.lock().await;

    match provisioner.inspect(&spec.name).await? {
        Some(info) => {
            let network = validate_existing(spec, &info)?;
            debug!(network = %network.name, id = %network.id, "reusing existing network");
            Ok(network)
        }
        None => {
            let network = provisioner.create(spec).await?;
            info!(network = %network.name, id = %network.id, "created network");
            Ok(network)
        }
    }
}

/// Delete the network if it exists
pub async fn delete_network(provisioner: &dyn NetworkProvisioner, name: &str) -> Result<()> {
    let _guard = NETWORK_LOCK.lock().await;

    if let Some(info) = provisioner.inspect(name).await? {
        provisioner.delete(&info.id).await?;
        info!(network = %name, "deleted network");
    }
    Ok(())
}

/// Docker CLI backed networks
#[derive(Debug, Clone)]
pub struct DockerNetworks {
    docker: String,
}

impl Default for DockerNetworks {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
        }
    }
}

impl DockerNetworks {
    /// Use the `docker` binary from PATH
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedNetwork {
    id: String,
    name: String,
    #[serde(default)]
    internal: bool,
    #[serde(rename = "IPAM", default)]
    ipam: Option<InspectedIpam>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedIpam {
    #[serde(default)]
    config: Option<Vec<InspectedIpamConfig>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedIpamConfig {
    #[serde(default)]
    subnet: String,
}

/// Parse `docker network inspect` output (a JSON array)
fn parse_inspect(output: &str) -> Result<Option<NetworkInfo>> {
    let networks: Vec<InspectedNetwork> = serde_json::from_str(output).map_err(|e| {
        Error::provider("docker", format!("failed to parse network inspect output: {}", e))
    })?;

    Ok(networks.into_iter().next().map(|n| NetworkInfo {
        id: n.id,
        name: n.name,
        internal: n.internal,
        subnets: n
            .ipam
            .and_then(|ipam| ipam.config)
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.subnet)
            .filter(|s| !s.is_empty())
            .collect(),
    }))
}

#[async_trait]
impl NetworkProvisioner for DockerNetworks {
    async fn inspect(&self, name: &str) -> Result<Option<NetworkInfo>> {
        let ids = ToolCommand::new(&self.docker)
            .args(["network", "ls", "--quiet", "--filter"])
            .args([format!("name=^{}$", name)])
            .run()
            .await?;
        if ids.trim().is_empty() {
            return Ok(None);
        }

        let output = ToolCommand::new(&self.docker)
            .args(["network", "inspect", name])
            .run()
            .await?;
        parse_inspect(&output)
    }

    async fn create(&self, spec: &NetworkSpec) -> Result<Network> {
        let mut cmd = ToolCommand::new(&self.docker).args(["network", "create", "--driver=bridge"]);
        if spec.internal {
            cmd = cmd.args(["--internal"]);
        }
        if let Some(subnet) = &spec.subnet {
            cmd = cmd.args([format!("--subnet={}", subnet)]);
        }
        let id = cmd.args([spec.name.as_str()]).run().await?;

        Ok(Network {
            id: id.trim().to_string(),
            name: spec.name.clone(),
        })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        ToolCommand::new(&self.docker)
            .args(["network", "rm", name])
            .run()
            .await?;
        Ok(())
    }
}
