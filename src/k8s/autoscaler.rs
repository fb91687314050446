//! Cluster autoscaler deployment on/off switch.

use anyhow::Result;
use k8s_openapi::api::apps::v1::Deployment;
use kube::Api;
use kube::api::{Patch, PatchParams};
use tracing::info;

use super::AutoscalerRef;
use crate::error::KrollError;

/// Observed replica count; a deployment without status counts as 0.
pub async fn replicas(client: &kube::Client, target: &AutoscalerRef) -> Result<i32> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), &target.namespace);
    let deployment = api.get(&target.deployment).await.map_err(|e| {
        KrollError::KubernetesApi(format!(
            "Failed to get deployment {}/{}: {}",
            target.namespace, target.deployment, e
        ))
    })?;

    Ok(deployment
        .status
        .and_then(|s| s.replicas)
        .unwrap_or(0))
}

/// Scale the autoscaler deployment through its scale subresource.
pub async fn scale(client: &kube::Client, target: &AutoscalerRef, replicas: i32) -> Result<()> {
    info!(
        "Scaling deployments/{} to {} replicas in {}",
        target.deployment, replicas, target.namespace
    );

    let api: Api<Deployment> = Api::namespaced(client.clone(), &target.namespace);
    let patch = serde_json::json!({ "spec": { "replicas": replicas } });

    api.patch_scale(&target.deployment, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| {
            KrollError::KubernetesApi(format!(
                "Failed to scale deployment {}/{}: {}",
                target.namespace, target.deployment, e
            ))
        })?;

    Ok(())
}
