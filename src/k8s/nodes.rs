//! Node listing, readiness and tainting.

use anyhow::Result;
use k8s_openapi::api::core::v1::{Node, Taint};
use kube::Api;
use kube::api::{ListParams, Patch, PatchParams};
use tracing::debug;

use crate::error::KrollError;

/// Taint applied to every node scheduled for retirement.
pub const UPGRADE_TAINT_KEY: &str = "kroll/retiring";
pub const UPGRADE_TAINT_VALUE: &str = "true";
pub const UPGRADE_TAINT_EFFECT: &str = "NoSchedule";

/// The parts of a node the upgrade looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub kubelet_version: String,
    pub provider_id: Option<String>,
    /// Statuses of every `Ready` condition reported by the node.
    pub ready_conditions: Vec<String>,
}

impl NodeInfo {
    /// Healthy means exactly one `Ready=True` condition.
    pub fn is_ready(&self) -> bool {
        self.ready_conditions.iter().filter(|s| *s == "True").count() == 1
    }
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        let status = node.status.as_ref();

        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            kubelet_version: status
                .and_then(|s| s.node_info.as_ref())
                .map(|i| i.kubelet_version.clone())
                .unwrap_or_default(),
            provider_id: node.spec.as_ref().and_then(|s| s.provider_id.clone()),
            ready_conditions: status
                .and_then(|s| s.conditions.as_ref())
                .map(|conditions| {
                    conditions
                        .iter()
                        .filter(|c| c.type_ == "Ready")
                        .map(|c| c.status.clone())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// Keep nodes whose kubelet version starts with `prefix`.
pub fn filter_by_version(nodes: Vec<NodeInfo>, prefix: &str) -> Vec<NodeInfo> {
    nodes
        .into_iter()
        .filter(|n| n.kubelet_version.starts_with(prefix))
        .collect()
}

/// Kubelet version prefix for a Kubernetes minor version.
///
/// `1.22` and `v1.22` both become `v1.22.` so that `1.2` never matches `1.22`.
pub fn kubelet_version_prefix(version: &str) -> String {
    let trimmed = version.trim().trim_start_matches('v').trim_end_matches('.');
    format!("v{}.", trimmed)
}

/// List all nodes in the cluster.
pub async fn list_nodes(client: &kube::Client) -> Result<Vec<NodeInfo>> {
    let api: Api<Node> = Api::all(client.clone());
    let list = api
        .list(&ListParams::default())
        .await
        .map_err(|e| KrollError::KubernetesApi(format!("Failed to list nodes: {}", e)))?;

    let nodes: Vec<NodeInfo> = list.items.iter().map(NodeInfo::from).collect();
    debug!("Found {} nodes", nodes.len());
    Ok(nodes)
}

/// Merge the upgrade taint into `existing`, replacing any taint with the same key and effect.
pub fn with_upgrade_taint(existing: Vec<Taint>) -> Vec<Taint> {
    let mut taints: Vec<Taint> = existing
        .into_iter()
        .filter(|t| !(t.key == UPGRADE_TAINT_KEY && t.effect == UPGRADE_TAINT_EFFECT))
        .collect();

    taints.push(Taint {
        key: UPGRADE_TAINT_KEY.to_string(),
        value: Some(UPGRADE_TAINT_VALUE.to_string()),
        effect: UPGRADE_TAINT_EFFECT.to_string(),
        time_added: None,
    });

    taints
}

/// Apply the upgrade taint with overwrite semantics.
pub async fn taint_node(client: &kube::Client, name: &str) -> Result<()> {
    let api: Api<Node> = Api::all(client.clone());
    let node = api
        .get(name)
        .await
        .map_err(|e| KrollError::KubernetesApi(format!("Failed to get node '{}': {}", name, e)))?;

    let existing = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default();

    let patch = serde_json::json!({
        "spec": {
            "taints": with_upgrade_taint(existing)
        }
    });

    debug!("Tainting node {} with patch: {:?}", name, patch);

    api.patch(name, &PatchParams::apply("kroll"), &Patch::Merge(patch))
        .await
        .map_err(|e| {
            KrollError::KubernetesApi(format!("Failed to taint node '{}': {}", name, e))
        })?;

    Ok(())
}
