//! Capacity scaling and convergence.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::asg::{AutoScalingGroup, CapacityProvider};
use crate::error::KrollError;
use crate::k8s::Cluster;
use crate::retry::{Outcome, RetryExecutor};

/// Scale-out headroom: room for old nodes, their replacements, and a buffer.
pub const SCALE_OUT_FACTOR: i32 = 3;

/// Target capacity for a scale-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityPlan {
    pub desired_capacity: i32,
    /// New max size, only when the current one cannot hold `desired_capacity`.
    pub max_size: Option<i32>,
}

impl CapacityPlan {
    /// Max size the group ends up with.
    pub fn effective_max_size(&self, original_max_size: i32) -> i32 {
        self.max_size.unwrap_or(original_max_size)
    }
}

/// Compute the scale-out target from the pre-session sizes.
pub fn scale_out_plan(
    original_desired_capacity: i32,
    original_max_size: i32,
) -> Result<CapacityPlan, KrollError> {
    let desired_capacity = original_desired_capacity
        .checked_mul(SCALE_OUT_FACTOR)
        .ok_or(KrollError::CapacityOverflow {
            desired: original_desired_capacity,
        })?;
    debug!(
        "diff: {} | originalMaxSize: {}",
        i64::from(desired_capacity) - i64::from(original_max_size),
        original_max_size
    );

    Ok(CapacityPlan {
        desired_capacity,
        max_size: (desired_capacity > original_max_size).then_some(desired_capacity),
    })
}

/// The three convergence signals, in the order they are asserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    GroupStable,
    NodeCountMatches,
    NodesReady,
}

impl Signal {
    const ALL: [Signal; 3] = [Signal::GroupStable, Signal::NodeCountMatches, Signal::NodesReady];

    fn label(self) -> &'static str {
        match self {
            Signal::GroupStable => "ASG instances match desired capacity",
            Signal::NodeCountMatches => "Node count matches ASG desired capacity",
            Signal::NodesReady => "All nodes are ready",
        }
    }
}

/// Issues capacity changes and waits for the cluster to converge.
pub struct CapacityScaler<'a> {
    provider: &'a dyn CapacityProvider,
    cluster: &'a dyn Cluster,
    retry: &'a RetryExecutor,
}

impl<'a> CapacityScaler<'a> {
    pub fn new(
        provider: &'a dyn CapacityProvider,
        cluster: &'a dyn Cluster,
        retry: &'a RetryExecutor,
    ) -> Self {
        Self {
            provider,
            cluster,
            retry,
        }
    }

    /// Read the group and refuse to trust it unless it is internally consistent.
    pub async fn stable_group(&self, filter: &str) -> Result<AutoScalingGroup> {
        let group = self.provider.describe_group(filter).await?;
        group.ensure_stable()?;
        Ok(group)
    }

    /// Raise max size if needed, then desired capacity, then converge.
    pub async fn scale_out(&self, group: &str, plan: CapacityPlan) -> Result<()> {
        if let Some(max_size) = plan.max_size {
            self.retry
                .execute("Raise ASG max size", || {
                    self.provider.set_max_size(group, max_size)
                })
                .await?;
        }

        self.retry
            .execute("Set ASG desired capacity", || {
                self.provider
                    .set_desired_capacity(group, plan.desired_capacity)
            })
            .await?;

        self.converge(group).await
    }

    /// Put desired capacity and max size back, then converge.
    ///
    /// Desired capacity goes first since the provider rejects desired > max.
    /// Without a known original desired capacity only max size is restored;
    /// the provider clamps desired capacity down to it.
    pub async fn restore(
        &self,
        group: &str,
        original_max_size: i32,
        original_desired_capacity: Option<i32>,
    ) -> Result<()> {
        if let Some(desired) = original_desired_capacity {
            self.retry
                .execute("Restore ASG desired capacity", || {
                    self.provider.set_desired_capacity(group, desired)
                })
                .await?;
        }

        self.retry
            .execute("Restore ASG max size", || {
                self.provider.set_max_size(group, original_max_size)
            })
            .await?;

        self.converge(group).await
    }

    /// Assert every convergence signal in order.
    ///
    /// Each assertion re-checks the signals already verified before it, so a
    /// regression in an earlier signal restarts the triad from the top.
    /// Signals the operator proceeded past are not re-checked.
    pub async fn converge(&self, group: &str) -> Result<()> {
        info!("Waiting cluster reach desired number of instances");

        let mut verified: Vec<Signal> = Vec::new();

        for signal in Signal::ALL {
            let outcome = self
                .retry
                .execute(signal.label(), || self.assert_signals(group, &verified, signal))
                .await?;

            match outcome {
                Outcome::Completed(()) => {
                    debug!("☑ {}", signal.label());
                    verified.push(signal);
                }
                Outcome::Overridden => {
                    warn!("Proceeding without: {}", signal.label());
                }
            }
        }

        Ok(())
    }

    async fn assert_signals(&self, group: &str, verified: &[Signal], next: Signal) -> Result<()> {
        for signal in verified.iter().copied().chain(std::iter::once(next)) {
            self.assert_signal(group, signal).await?;
        }
        Ok(())
    }

    async fn assert_signal(&self, group: &str, signal: Signal) -> Result<()> {
        match signal {
            Signal::GroupStable => {
                self.stable_group(group).await?;
            }
            Signal::NodeCountMatches => {
                let asg = self.stable_group(group).await?;
                let nodes = self.cluster.nodes(None).await?;
                if nodes.len() != asg.desired_capacity.max(0) as usize {
                    return Err(KrollError::NodeCountMismatch {
                        nodes: nodes.len(),
                        desired: asg.desired_capacity,
                    }
                    .into());
                }
            }
            Signal::NodesReady => {
                let nodes = self.cluster.nodes(None).await?;
                let ready = nodes.iter().filter(|n| n.is_ready()).count();
                if ready != nodes.len() {
                    return Err(KrollError::NodesNotReady {
                        nodes: nodes.len(),
                        ready,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}
