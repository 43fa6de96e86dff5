//! kind-backed clusters via the `kind` CLI

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{ClusterHandle, ClusterProvisioner};
use crate::exec::ToolCommand;
use crate::{Error, Result};

/// Environment variable kind reads to pick the docker network
pub const KIND_NETWORK_ENV: &str = "KIND_EXPERIMENTAL_DOCKER_NETWORK";

/// One control-plane node with a fixed pod subnet
pub const KIND_CONFIG: &str = r#"kind: Cluster
apiVersion: kind.x-k8s.io/v1alpha4
networking:
  podSubnet: "172.16.0.0/16"
nodes:
  - role: control-plane
"#;

/// Provisions clusters with `kind create cluster`
#[derive(Debug, Clone)]
pub struct KindProvisioner {
    kind: String,
    config: String,
}

impl Default for KindProvisioner {
    fn default() -> Self {
        Self {
            kind: "kind".to_string(),
            config: KIND_CONFIG.to_string(),
        }
    }
}

impl KindProvisioner {
    /// Provisioner using `kind` from PATH and the default cluster config
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different kind cluster config
    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = config.into();
        self
    }

    /// The `kind create cluster` invocation for `name`
    ///
    /// The network choice is scoped to the child process environment.
    pub fn create_command(&self, network: Option<&str>, name: &str, kubeconfig: &Path) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.kind)
            .args(["create", "cluster", "--name", name, "--config", "-"])
            .args(["--kubeconfig".to_string(), kubeconfig.display().to_string()])
            .stdin(self.config.as_str());
        if let Some(network) = network {
            cmd = cmd.env(KIND_NETWORK_ENV, network);
        }
        cmd
    }
}

#[async_trait]
impl ClusterProvisioner for KindProvisioner {
    async fn create_cluster(&self, network: Option<&str>, name: &str) -> Result<Arc<dyn ClusterHandle>> {
        let kubeconfig = tempfile::Builder::new()
            .prefix(&format!("{}-", name))
            .suffix("-kubeconfig")
            .tempfile()?
            .into_temp_path()
            .keep()
            .map_err(|e| Error::from(e.error))?;

        info!(cluster = %name, network = ?network, "creating kind cluster");
        if let Err(e) = self.create_command(network, name, &kubeconfig).run().await {
            remove_kubeconfig(name, &kubeconfig).await;
            return Err(Error::cluster_create(name, e.to_string()));
        }

        Ok(Arc::new(KindCluster {
            name: name.to_string(),
            kubeconfig,
            kind: self.kind.clone(),
        }))
    }
}

// Best effort: a leftover file is logged, not returned.
async fn remove_kubeconfig(cluster: &str, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(cluster = %cluster, path = %path.display(), error = %e, "failed to remove kubeconfig"),
    }
}

/// A kind cluster and its kubeconfig file
#[derive(Debug, Clone)]
pub struct KindCluster {
    name: String,
    kubeconfig: PathBuf,
    kind: String,
}

#[async_trait]
impl ClusterHandle for KindCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn kubeconfig_path(&self) -> &Path {
        &self.kubeconfig
    }

    async fn delete(&self) -> Result<()> {
        let result = ToolCommand::new(&self.kind)
            .args(["delete", "cluster", "--name", self.name.as_str()])
            .args(["--kubeconfig".to_string(), self.kubeconfig.display().to_string()])
            .run()
            .await;

        remove_kubeconfig(&self.name, &self.kubeconfig).await;

        result?;
        info!(cluster = %self.name, "deleted kind cluster");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_command_scopes_network_to_child() {
        let cmd = KindProvisioner::new().create_command(
            Some("apptests"),
            "workload1",
            Path::new("/tmp/workload1-kubeconfig"),
        );
        let display = cmd.display();
        assert!(display.starts_with("kind create cluster --name workload1"));
        assert!(display.contains("--kubeconfig /tmp/workload1-kubeconfig"));
        assert!(format!("{:?}", cmd).contains(KIND_NETWORK_ENV));
    }

    #[test]
    fn default_network_sets_no_env() {
        let cmd = KindProvisioner::new().create_command(None, "default", Path::new("/tmp/k"));
        assert!(!format!("{:?}", cmd).contains(KIND_NETWORK_ENV));
    }

    #[test]
    fn config_has_single_control_plane_and_pod_subnet() {
        let docs = apptests_common::yaml::parse_yaml(KIND_CONFIG).unwrap();
        assert_eq!(docs["networking"]["podSubnet"], "172.16.0.0/16");
        assert_eq!(docs["nodes"].as_array().map(Vec::len), Some(1));
        assert_eq!(docs["nodes"][0]["role"], "control-plane");
    }

    /// Story: a failed create leaves no kubeconfig behind
    #[tokio::test]
    async fn story_failed_create_is_cluster_create_error() {
        let provisioner = KindProvisioner {
            kind: "false".to_string(),
            config: KIND_CONFIG.to_string(),
        };
        let name = format!("apptests-broken-{}", std::process::id());
        let err = provisioner.create_cluster(None, &name).await.unwrap_err();
        assert!(matches!(err, Error::ClusterCreate { .. }));
        assert!(err.to_string().starts_with("cluster create failed"));

        let leftovers = std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&format!("{}-", name)))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn removing_a_missing_kubeconfig_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never-written");
        remove_kubeconfig("ghost", &path).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn delete_removes_kubeconfig_even_when_kind_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let (_, path) = file.keep().unwrap();
        let cluster = KindCluster {
            name: "gone".to_string(),
            kubeconfig: path.clone(),
            kind: "false".to_string(),
        };
        assert!(cluster.delete().await.is_err());
        assert!(!path.exists());
    }
}
