//! The node upgrade state machine.
//!
//! A session walks the phases in order and never goes back:
//!
//! ```text
//! Start -> CapacityScaledOut -> NodesTainted -> NodesDrained
//!       -> OldNodesTerminated -> OldVersionAbsent -> CapacityRestored -> Complete
//! ```
//!
//! Nothing is persisted. An aborted session is recovered by running again,
//! which re-derives the baseline from the live group and cluster.

use anyhow::Result;
use colored::Colorize;
use tracing::{debug, info, warn};

use crate::asg::{AutoScalingGroup, CapacityProvider};
use crate::checkpoint::Decision;
use crate::error::KrollError;
use crate::infra::{InfraSource, declared_max_size};
use crate::k8s::{Cluster, NodeInfo};
use crate::output;
use crate::retry::{Outcome, RetryExecutor};
use crate::upgrade::lifecycle::NodeLifecycle;
use crate::upgrade::scaler::{CapacityPlan, CapacityScaler, scale_out_plan};

/// Replicas of the cluster autoscaler while it is enabled.
const AUTOSCALER_ENABLED_REPLICAS: i32 = 1;

/// Session phases, named after the state each one establishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    CapacityScaledOut,
    NodesTainted,
    NodesDrained,
    OldNodesTerminated,
    OldVersionAbsent,
    CapacityRestored,
    Complete,
}

impl Phase {
    /// Number of phases that do work.
    pub const STEPS: usize = 7;

    /// 1-based position in the header, `None` for [`Phase::Complete`].
    pub fn step(self) -> Option<usize> {
        match self {
            Phase::Start => Some(1),
            Phase::CapacityScaledOut => Some(2),
            Phase::NodesTainted => Some(3),
            Phase::NodesDrained => Some(4),
            Phase::OldNodesTerminated => Some(5),
            Phase::OldVersionAbsent => Some(6),
            Phase::CapacityRestored => Some(7),
            Phase::Complete => None,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Phase::Start => "Read Baseline",
            Phase::CapacityScaledOut => "Scale Out Capacity",
            Phase::NodesTainted => "Taint Old Nodes",
            Phase::NodesDrained => "Drain Old Nodes",
            Phase::OldNodesTerminated => "Terminate Old Nodes",
            Phase::OldVersionAbsent => "Verify Old Version Absent",
            Phase::CapacityRestored => "Restore Capacity",
            Phase::Complete => "Complete",
        }
    }
}

/// What to upgrade.
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    /// Substring of the Auto Scaling group name or its `Name` tag.
    pub group_filter: String,
    /// Kubelet version prefix of the nodes to retire, e.g. `v1.22.`.
    pub version_prefix: String,
    pub dry_run: bool,
}

/// Baseline captured at [`Phase::Start`].
#[derive(Debug, Clone)]
pub struct UpgradeSession {
    pub version_prefix: String,
    pub group_name: String,
    pub original_max_size: i32,
    /// Unknown when the autoscaler was already disabled before the session.
    pub original_desired_capacity: Option<i32>,
    /// Nodes to retire, in retirement order. Never refreshed.
    pub old_nodes: Vec<NodeInfo>,
    /// This session scaled the autoscaler to zero and owns turning it back on.
    pub autoscaler_disabled_here: bool,
    pub plan: Option<CapacityPlan>,
}

/// Drives one upgrade session to completion or abort.
pub struct NodeUpgradeOrchestrator<'a> {
    provider: &'a dyn CapacityProvider,
    cluster: &'a dyn Cluster,
    infra: Option<&'a dyn InfraSource>,
    retry: &'a RetryExecutor,
    options: UpgradeOptions,
    phase: Phase,
}

impl<'a> NodeUpgradeOrchestrator<'a> {
    pub fn new(
        provider: &'a dyn CapacityProvider,
        cluster: &'a dyn Cluster,
        infra: Option<&'a dyn InfraSource>,
        retry: &'a RetryExecutor,
        options: UpgradeOptions,
    ) -> Self {
        Self {
            provider,
            cluster,
            infra,
            retry,
            options,
            phase: Phase::Start,
        }
    }

    /// Last phase reached.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run the session. Returns the phase it stopped in.
    pub async fn run(&mut self) -> Result<Phase> {
        let started = chrono::Utc::now();

        let Some(session) = self.start().await? else {
            return Ok(self.phase);
        };

        if let Err(err) = self.replace_nodes(&session).await {
            if session.autoscaler_disabled_here {
                self.reenable_autoscaler().await;
            }
            return Err(err);
        }

        output::print_summary(
            &session.group_name,
            session.old_nodes.len(),
            chrono::Utc::now() - started,
        );
        Ok(self.phase)
    }

    fn enter(&self, phase: Phase) {
        debug!("Entering phase {:?} (reached {:?})", phase, self.phase);
        output::print_phase(phase);
    }

    /// Read the baseline, snapshot the old nodes and take the autoscaler out
    /// of the way. `None` means the session ends here successfully.
    async fn start(&mut self) -> Result<Option<UpgradeSession>> {
        self.enter(Phase::Start);

        let cluster = self.cluster;
        let retry = self.retry;
        let scaler = CapacityScaler::new(self.provider, cluster, retry);
        let filter = self.options.group_filter.clone();
        let prefix = self.options.version_prefix.clone();

        let replicas = retry
            .execute("Read cluster autoscaler replicas", || {
                cluster.autoscaler_replicas()
            })
            .await?
            .completed()
            .ok_or_else(|| {
                KrollError::UnstableBaseline("cluster autoscaler replicas unknown".to_string())
            })?;

        let group = retry
            .execute("Read auto scaling group", || baseline_group(&scaler, &filter))
            .await?
            .completed()
            .ok_or_else(|| {
                KrollError::UnstableBaseline(format!(
                    "auto scaling group '{}' never reported a consistent read",
                    filter
                ))
            })?;

        info!(
            "[Current cluster configuration] | Group: {} | MinSize: {} | MaxSize: {} | DesiredCapacity: {}",
            group.name, group.min_size, group.max_size, group.desired_capacity
        );

        let old_nodes = retry
            .execute("List old nodes", || cluster.nodes(Some(&prefix)))
            .await?
            .completed()
            .ok_or_else(|| {
                KrollError::UnstableBaseline(format!("nodes with version {} unknown", prefix))
            })?;

        output::print_retirement_table(&old_nodes, &prefix);

        if replicas == 0 {
            info!("Cluster autoscaler is already disabled, skipping scale-out");
            let infra = self.infra.ok_or(KrollError::InfraSourceMissing)?;
            let original_max_size = retry
                .execute("Read declared max size", || declared_max_size(infra))
                .await?
                .completed()
                .ok_or_else(|| {
                    KrollError::UnstableBaseline("declared max size unknown".to_string())
                })?;

            if self.options.dry_run {
                println!(
                    "{}",
                    format!(
                        "[DRY RUN] Scale-out skipped, max size would be restored to {}.",
                        original_max_size
                    )
                    .yellow()
                );
                return Ok(None);
            }

            return Ok(Some(UpgradeSession {
                version_prefix: prefix,
                group_name: group.name,
                original_max_size,
                original_desired_capacity: None,
                old_nodes,
                autoscaler_disabled_here: false,
                plan: None,
            }));
        }

        if old_nodes.is_empty() {
            println!(
                "{}",
                format!("No nodes on {}. Nothing to upgrade.", prefix)
                    .green()
                    .bold()
            );
            self.phase = Phase::Complete;
            return Ok(None);
        }

        let plan = scale_out_plan(group.desired_capacity, group.max_size)?;
        output::print_capacity_plan(&group.name, group.desired_capacity, group.max_size, &plan);

        if self.options.dry_run {
            println!("{}", "[DRY RUN] Upgrade plan generated.".yellow());
            return Ok(None);
        }

        retry
            .execute("Disable cluster autoscaler", || cluster.scale_autoscaler(0))
            .await?;

        match retry
            .checkpoint()
            .confirm("Proceed changing desired and max capacity of the cluster?")
        {
            Ok(true) => {}
            Ok(false) => {
                self.reenable_autoscaler().await;
                return Err(KrollError::Aborted.into());
            }
            Err(err) => {
                self.reenable_autoscaler().await;
                return Err(err);
            }
        }

        Ok(Some(UpgradeSession {
            version_prefix: prefix,
            group_name: group.name,
            original_max_size: group.max_size,
            original_desired_capacity: Some(group.desired_capacity),
            old_nodes,
            autoscaler_disabled_here: true,
            plan: Some(plan),
        }))
    }

    async fn replace_nodes(&mut self, session: &UpgradeSession) -> Result<()> {
        let cluster = self.cluster;
        let retry = self.retry;
        let scaler = CapacityScaler::new(self.provider, cluster, retry);
        let lifecycle = NodeLifecycle::new(cluster, self.provider, retry);
        let group = session.group_name.as_str();

        self.enter(Phase::CapacityScaledOut);
        match session.plan {
            Some(plan) => scaler.scale_out(group, plan).await?,
            None => info!("Cluster autoscaler was already disabled, leaving capacity as is"),
        }
        self.phase = Phase::CapacityScaledOut;

        self.enter(Phase::NodesTainted);
        for node in &session.old_nodes {
            if let Outcome::Overridden = lifecycle.taint(node).await? {
                warn!("Proceeding without taint on {}", node.name);
            }
        }
        self.phase = Phase::NodesTainted;

        self.enter(Phase::NodesDrained);
        for node in &session.old_nodes {
            if let Outcome::Overridden = lifecycle.drain(node).await? {
                warn!("Proceeding with {} not fully drained", node.name);
            }
            self.wait_for_healthy_pods().await?;
        }
        self.phase = Phase::NodesDrained;

        self.enter(Phase::OldNodesTerminated);
        for node in &session.old_nodes {
            if let Outcome::Overridden = lifecycle.terminate(node).await? {
                warn!("Proceeding without terminating {}", node.name);
            }
        }
        self.phase = Phase::OldNodesTerminated;

        self.enter(Phase::OldVersionAbsent);
        self.ensure_old_version_absent(&session.version_prefix).await?;
        self.phase = Phase::OldVersionAbsent;

        self.enter(Phase::CapacityRestored);
        scaler
            .restore(
                group,
                session.original_max_size,
                session.original_desired_capacity,
            )
            .await?;
        retry
            .execute("Enable cluster autoscaler", || {
                cluster.scale_autoscaler(AUTOSCALER_ENABLED_REPLICAS)
            })
            .await?;
        self.phase = Phase::CapacityRestored;

        info!("✅ Nodes upgraded in {}", group);
        self.phase = Phase::Complete;
        Ok(())
    }

    /// Block until no pod in the cluster is outside the `Running` phase, or
    /// the operator proceeds anyway.
    async fn wait_for_healthy_pods(&self) -> Result<()> {
        let cluster = self.cluster;
        loop {
            let pods = match self
                .retry
                .execute("List pods not running", || cluster.pods_not_running())
                .await?
            {
                Outcome::Completed(pods) => pods,
                Outcome::Overridden => return Ok(()),
            };

            if pods.is_empty() {
                debug!("☑ All pods are running");
                return Ok(());
            }

            println!("{}", "Pods not running:".yellow().bold());
            for pod in &pods {
                println!("  {}", pod);
            }

            let message = format!("There are {} pods that are not running", pods.len());
            match self.retry.checkpoint().decide(&message)? {
                Decision::Proceed => return Ok(()),
                Decision::Abort => return Err(KrollError::Aborted.into()),
                Decision::Recheck => continue,
            }
        }
    }

    async fn ensure_old_version_absent(&self, prefix: &str) -> Result<()> {
        let cluster = self.cluster;
        loop {
            let remaining = match self
                .retry
                .execute("List old nodes", || cluster.nodes(Some(prefix)))
                .await?
            {
                Outcome::Completed(nodes) => nodes,
                Outcome::Overridden => return Ok(()),
            };

            if remaining.is_empty() {
                info!("☑ No nodes with version {} remain", prefix);
                return Ok(());
            }

            let names: Vec<&str> = remaining.iter().map(|n| n.name.as_str()).collect();
            warn!("Nodes still on {}: {}", prefix, names.join(", "));

            let message = format!(
                "There are still {} nodes with version {}",
                remaining.len(),
                prefix
            );
            match self.retry.checkpoint().decide(&message)? {
                Decision::Proceed => return Ok(()),
                Decision::Abort => return Err(KrollError::Aborted.into()),
                Decision::Recheck => continue,
            }
        }
    }

    /// Best effort: the session is already failing.
    async fn reenable_autoscaler(&self) {
        warn!("Re-enabling cluster autoscaler before exiting");
        if let Err(e) = self
            .cluster
            .scale_autoscaler(AUTOSCALER_ENABLED_REPLICAS)
            .await
        {
            warn!("Failed to re-enable cluster autoscaler: {:#}", e);
        }
    }
}

/// Read the group the session starts from.
///
/// Instances that do not match desired capacity before anything was changed
/// mean a scaling activity is in flight or the group is misconfigured. Either
/// way its sizes are no restore target, so this fails without a retry.
async fn baseline_group(scaler: &CapacityScaler<'_>, filter: &str) -> Result<AutoScalingGroup> {
    scaler.stable_group(filter).await.map_err(|err| {
        if matches!(
            err.downcast_ref::<KrollError>(),
            Some(KrollError::UnstableGroup { .. })
        ) {
            KrollError::UnstableBaseline(err.to_string()).into()
        } else {
            err
        }
    })
}
