use crate::error::{Error, Result};

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::info;

/// Where the Kubernetes client configuration is taken from. Resolved once at
/// startup; operations that need the cluster fail fast when none applies.
#[derive(Clone, Debug, Default)]
pub enum ClusterConfig {
    /// Service account mounted into the pod.
    InCluster,
    /// Explicit kubeconfig path.
    Kubeconfig(String),
    /// `KUBECONFIG`, then `~/.kube/config`.
    #[default]
    Infer,
}

pub async fn new_client(source: &ClusterConfig) -> Result<Client> {
    let config = match source {
        ClusterConfig::InCluster => Config::incluster()
            .map_err(|e| Error::ConfigError(format!("in-cluster configuration unavailable: {e}")))?,
        ClusterConfig::Kubeconfig(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::ConfigError(format!("failed to read kubeconfig {path}: {e}")))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::ConfigError(format!("invalid kubeconfig {path}: {e}")))?
        }
        ClusterConfig::Infer => Config::infer()
            .await
            .map_err(|e| Error::ConfigError(format!("no usable Kubernetes configuration: {e}")))?,
    };
    info!(msg = "creating Kubernetes client", cluster_url = %config.cluster_url);
    Client::try_from(config)
        .map_err(|e| Error::KubeError("failed to build Kubernetes client".to_string(), Box::new(e)))
}
