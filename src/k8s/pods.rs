//! Cluster-wide pod health.

use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::ListParams;
use tracing::debug;

use crate::error::KrollError;

/// Pods in any namespace whose phase is not `Running`.
pub async fn pods_not_running(client: &kube::Client) -> Result<Vec<String>> {
    let api: Api<Pod> = Api::all(client.clone());
    let params = ListParams::default().fields("status.phase!=Running");
    let list = api
        .list(&params)
        .await
        .map_err(|e| KrollError::KubernetesApi(format!("Failed to list pods: {}", e)))?;

    let pods: Vec<String> = list.items.iter().map(describe_pod).collect();
    debug!("Found {} pods not running", pods.len());
    Ok(pods)
}

fn describe_pod(pod: &Pod) -> String {
    format!(
        "{}/{} ({})",
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.metadata.name.as_deref().unwrap_or("unknown"),
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown")
    )
}
