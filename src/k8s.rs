//! Kubernetes cluster operations.

pub mod autoscaler;
pub mod client;
pub mod drain;
pub mod nodes;
pub mod pods;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

pub use nodes::NodeInfo;

/// Cluster queries and mutations the upgrade needs.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// List nodes, optionally only those whose kubelet version starts with `version_prefix`.
    async fn nodes(&self, version_prefix: Option<&str>) -> Result<Vec<NodeInfo>>;

    /// Mark a node unschedulable for new pods. Safe to repeat.
    async fn taint(&self, node: &str) -> Result<()>;

    /// Cordon the node and evict everything except DaemonSet and mirror pods.
    async fn drain(&self, node: &str) -> Result<()>;

    /// Current replica count of the cluster autoscaler deployment.
    async fn autoscaler_replicas(&self) -> Result<i32>;

    async fn scale_autoscaler(&self, replicas: i32) -> Result<()>;

    /// Pods cluster-wide whose phase is not `Running`, as `namespace/name (phase)`.
    async fn pods_not_running(&self) -> Result<Vec<String>>;
}

/// Where the cluster autoscaler runs.
#[derive(Debug, Clone)]
pub struct AutoscalerRef {
    pub namespace: String,
    pub deployment: String,
}

/// [`Cluster`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
    autoscaler: AutoscalerRef,
    drain_timeout: Duration,
}

impl KubeCluster {
    pub fn new(client: kube::Client, autoscaler: AutoscalerRef, drain_timeout: Duration) -> Self {
        Self {
            client,
            autoscaler,
            drain_timeout,
        }
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn nodes(&self, version_prefix: Option<&str>) -> Result<Vec<NodeInfo>> {
        debug!("Getting k8s nodes");
        let all = nodes::list_nodes(&self.client).await?;
        Ok(match version_prefix {
            Some(prefix) => nodes::filter_by_version(all, prefix),
            None => all,
        })
    }

    async fn taint(&self, node: &str) -> Result<()> {
        nodes::taint_node(&self.client, node).await
    }

    async fn drain(&self, node: &str) -> Result<()> {
        drain::drain_node(&self.client, node, self.drain_timeout).await
    }

    async fn autoscaler_replicas(&self) -> Result<i32> {
        autoscaler::replicas(&self.client, &self.autoscaler).await
    }

    async fn scale_autoscaler(&self, replicas: i32) -> Result<()> {
        autoscaler::scale(&self.client, &self.autoscaler, replicas).await
    }

    async fn pods_not_running(&self) -> Result<Vec<String>> {
        pods::pods_not_running(&self.client).await
    }
}
