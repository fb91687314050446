//! Per-node retirement steps.

use anyhow::Result;
use tracing::{debug, info};

use crate::asg::CapacityProvider;
use crate::error::KrollError;
use crate::k8s::{Cluster, NodeInfo};
use crate::retry::{Outcome, RetryExecutor};

/// EC2 instance id from a node provider id such as
/// `aws:///eu-west-1a/i-0abc123def4567890`.
pub fn instance_id_from_provider_id(provider_id: &str) -> Option<String> {
    let (_, id) = provider_id.rsplit_once("/i-")?;
    (!id.is_empty() && !id.contains('/')).then(|| format!("i-{}", id))
}

/// The instance is already gone, which is what termination wanted.
fn is_instance_gone(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<KrollError>(),
        Some(KrollError::InstanceNotFound(_))
    )
}

/// Nothing to retry without a provider id.
fn is_missing_provider_id(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<KrollError>(),
        Some(KrollError::MissingProviderId(_))
    )
}

/// Taint, drain and terminate for one node at a time.
pub struct NodeLifecycle<'a> {
    cluster: &'a dyn Cluster,
    provider: &'a dyn CapacityProvider,
    retry: &'a RetryExecutor,
}

impl<'a> NodeLifecycle<'a> {
    pub fn new(
        cluster: &'a dyn Cluster,
        provider: &'a dyn CapacityProvider,
        retry: &'a RetryExecutor,
    ) -> Self {
        Self {
            cluster,
            provider,
            retry,
        }
    }

    pub async fn taint(&self, node: &NodeInfo) -> Result<Outcome<()>> {
        debug!("Tainting node {}", node.name);
        self.retry
            .execute(&format!("Taint node {}", node.name), || {
                self.cluster.taint(&node.name)
            })
            .await
    }

    pub async fn drain(&self, node: &NodeInfo) -> Result<Outcome<()>> {
        debug!("Draining node {}", node.name);
        self.retry
            .execute(&format!("Drain node {}", node.name), || {
                self.cluster.drain(&node.name)
            })
            .await
    }

    /// Terminate the node's instance, decrementing desired capacity.
    pub async fn terminate(&self, node: &NodeInfo) -> Result<Outcome<()>> {
        let label = format!("Terminate node {}", node.name);
        let outcome = self
            .retry
            .execute_with(
                &label,
                || self.terminate_once(node),
                |err, _depth| !is_instance_gone(err) && !is_missing_provider_id(err),
            )
            .await?;

        if outcome.is_completed() {
            debug!("✅ Node {} terminated", node.name);
        }
        Ok(outcome)
    }

    async fn terminate_once(&self, node: &NodeInfo) -> Result<()> {
        let instance_id = node
            .provider_id
            .as_deref()
            .and_then(instance_id_from_provider_id)
            .ok_or_else(|| KrollError::MissingProviderId(node.name.clone()))?;

        debug!("⏳ Terminating instance with instanceId {}", instance_id);

        match self.provider.terminate_instance(&instance_id).await {
            Err(err) if is_instance_gone(&err) => {
                info!("Instance {} was already terminated", instance_id);
                Ok(())
            }
            other => other,
        }
    }
}
