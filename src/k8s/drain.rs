//! Node drain: cordon, evict, wait.
//!
//! DaemonSet pods are ignored and pods backed by emptyDir volumes are
//! evicted like any other pod, matching
//! `kubectl drain --ignore-daemonsets --delete-emptydir-data`.

use std::time::{Duration, Instant};

use anyhow::Result;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Api;
use kube::api::{EvictParams, ListParams, Patch, PatchParams};
use tracing::{debug, info};

use crate::error::KrollError;

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Whether a pod has to leave the node during a drain.
pub fn is_evictable(pod: &Pod) -> bool {
    let owned_by_daemonset = pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"));

    let is_mirror = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION));

    !owned_by_daemonset && !is_mirror
}

async fn evictable_pods(client: &kube::Client, node: &str) -> Result<Vec<Pod>> {
    let api: Api<Pod> = Api::all(client.clone());
    let params = ListParams::default().fields(&format!("spec.nodeName={}", node));
    let list = api.list(&params).await.map_err(|e| {
        KrollError::KubernetesApi(format!("Failed to list pods on node '{}': {}", node, e))
    })?;

    Ok(list.items.into_iter().filter(is_evictable).collect())
}

/// Drain a node and wait until no evictable pod is left on it.
pub async fn drain_node(client: &kube::Client, node: &str, timeout: Duration) -> Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());
    nodes
        .patch(
            node,
            &PatchParams::apply("kroll"),
            &Patch::Merge(serde_json::json!({ "spec": { "unschedulable": true } })),
        )
        .await
        .map_err(|e| {
            KrollError::KubernetesApi(format!("Failed to cordon node '{}': {}", node, e))
        })?;
    debug!("Cordoned node {}", node);

    let pods = evictable_pods(client, node).await?;
    info!("Evicting {} pods from node {}", pods.len(), node);

    for pod in &pods {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Pod> = Api::namespaced(client.clone(), namespace);

        match api.evict(name, &EvictParams::default()).await {
            Ok(_) => debug!("Evicted pod {}/{}", namespace, name),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!("Pod {}/{} already gone", namespace, name);
            }
            Err(e) => {
                return Err(KrollError::KubernetesApi(format!(
                    "Failed to evict pod {}/{}: {}",
                    namespace, name, e
                ))
                .into());
            }
        }
    }

    wait_until_drained(client, node, timeout).await
}

async fn wait_until_drained(client: &kube::Client, node: &str, timeout: Duration) -> Result<()> {
    let start = Instant::now();

    loop {
        let remaining = evictable_pods(client, node).await?;
        if remaining.is_empty() {
            info!("Node {} drained", node);
            return Ok(());
        }

        if start.elapsed() > timeout {
            return Err(KrollError::Timeout {
                operation: format!("drain of node {}", node),
                details: format!(
                    "{} pods still running after {}s",
                    remaining.len(),
                    timeout.as_secs()
                ),
            }
            .into());
        }

        debug!(
            "Waiting for {} pods to leave node {}",
            remaining.len(),
            node
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_plain_pod_is_evictable() {
        let p = pod(serde_json::json!({
            "metadata": { "name": "api-7d9f", "namespace": "app" }
        }));
        assert!(is_evictable(&p));
    }

    #[test]
    fn test_daemonset_pod_is_ignored() {
        let p = pod(serde_json::json!({
            "metadata": {
                "name": "aws-node-x2k9",
                "namespace": "kube-system",
                "ownerReferences": [{
                    "apiVersion": "apps/v1",
                    "kind": "DaemonSet",
                    "name": "aws-node",
                    "uid": "5b1c"
                }]
            }
        }));
        assert!(!is_evictable(&p));
    }

    #[test]
    fn test_replicaset_pod_is_evictable() {
        let p = pod(serde_json::json!({
            "metadata": {
                "name": "coredns-5c9f",
                "namespace": "kube-system",
                "ownerReferences": [{
                    "apiVersion": "apps/v1",
                    "kind": "ReplicaSet",
                    "name": "coredns-5c9f",
                    "uid": "8e2a"
                }]
            }
        }));
        assert!(is_evictable(&p));
    }

    #[test]
    fn test_mirror_pod_is_ignored() {
        let p = pod(serde_json::json!({
            "metadata": {
                "name": "kube-proxy-static",
                "namespace": "kube-system",
                "annotations": { "kubernetes.io/config.mirror": "abc" }
            }
        }));
        assert!(!is_evictable(&p));
    }
}
