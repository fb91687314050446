//! In-memory collaborators for unit tests.
//!
//! [`FakeCloud`] plays both the Auto Scaling group and the cluster so that
//! capacity changes show up as nodes the way they do on EKS: raising desired
//! capacity launches Ready nodes on the new kubelet version, terminating an
//! instance removes its node and decrements desired capacity.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Taint;

use crate::asg::{AutoScalingGroup, CapacityProvider};
use crate::checkpoint::{Checkpoint, Decision, Pause};
use crate::error::KrollError;
use crate::infra::InfraSource;
use crate::k8s::nodes::with_upgrade_taint;
use crate::k8s::{Cluster, NodeInfo};
use crate::retry::{DEFAULT_MAX_DEPTH, RetryExecutor};

pub const NEW_VERSION: &str = "v1.23.16-eks-48e63af";

/// Records requested pauses instead of sleeping.
#[derive(Default)]
pub struct RecordingPause {
    durations: Mutex<Vec<Duration>>,
}

impl RecordingPause {
    pub fn recorded(&self) -> Vec<Duration> {
        self.durations.lock().unwrap().clone()
    }

    pub fn recorded_secs(&self) -> Vec<u64> {
        self.recorded().iter().map(Duration::as_secs).collect()
    }
}

#[async_trait]
impl Pause for RecordingPause {
    async fn pause(&self, duration: Duration) {
        self.durations.lock().unwrap().push(duration);
    }
}

/// Answers checkpoints from a script; aborts once the script runs out.
pub struct ScriptedCheckpoint {
    decisions: Mutex<VecDeque<Decision>>,
    confirm_answer: bool,
    confirm_failure: Option<&'static str>,
    asked: Mutex<Vec<String>>,
    confirmed: Mutex<Vec<String>>,
}

impl ScriptedCheckpoint {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into()),
            confirm_answer: true,
            confirm_failure: None,
            asked: Mutex::new(Vec::new()),
            confirmed: Mutex::new(Vec::new()),
        }
    }

    pub fn declining(decisions: Vec<Decision>) -> Self {
        Self {
            confirm_answer: false,
            ..Self::new(decisions)
        }
    }

    /// Every confirmation fails, like a prompt on a closed terminal.
    pub fn failing_confirm(reason: &'static str) -> Self {
        Self {
            confirm_failure: Some(reason),
            ..Self::new(vec![])
        }
    }

    pub fn asked(&self) -> usize {
        self.asked.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }

    pub fn confirmations(&self) -> usize {
        self.confirmed.lock().unwrap().len()
    }
}

impl Checkpoint for ScriptedCheckpoint {
    fn decide(&self, message: &str) -> Result<Decision> {
        self.asked.lock().unwrap().push(message.to_string());
        Ok(self
            .decisions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Decision::Abort))
    }

    fn confirm(&self, message: &str) -> Result<bool> {
        self.confirmed.lock().unwrap().push(message.to_string());
        if let Some(reason) = self.confirm_failure {
            anyhow::bail!(reason);
        }
        Ok(self.confirm_answer)
    }
}

/// Retry executor wired to a recording pause and a scripted checkpoint.
pub struct TestHarness {
    pub retry: RetryExecutor,
    pub pause: Arc<RecordingPause>,
    pub checkpoint: Arc<ScriptedCheckpoint>,
}

impl TestHarness {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self::with_checkpoint(ScriptedCheckpoint::new(decisions))
    }

    pub fn with_checkpoint(checkpoint: ScriptedCheckpoint) -> Self {
        let pause = Arc::new(RecordingPause::default());
        let checkpoint = Arc::new(checkpoint);
        let retry = RetryExecutor::new(DEFAULT_MAX_DEPTH, pause.clone(), checkpoint.clone());
        Self {
            retry,
            pause,
            checkpoint,
        }
    }
}

#[derive(Default)]
struct World {
    group: Option<AutoScalingGroup>,
    nodes: Vec<NodeInfo>,
    instance_of: HashMap<String, String>,
    taints: HashMap<String, Vec<Taint>>,
    autoscaler_replicas: i32,
    next_instance: u32,
    lagging_reads: usize,
    not_ready_reads: usize,
    failing_drains: usize,
    unhealthy_pod_checks: usize,
    health_checks: usize,
    resurrect_old_nodes: usize,
    events: Vec<String>,
}

impl World {
    fn group_mut(&mut self) -> &mut AutoScalingGroup {
        self.group.as_mut().expect("fake group")
    }

    fn launch(&mut self, version: &str) {
        self.next_instance += 1;
        let instance_id = format!("i-{:017x}", self.next_instance);
        let name = format!("ip-10-0-0-{}.eu-west-1.compute.internal", self.next_instance);

        self.group_mut().instances.push(instance_id.clone());
        self.instance_of.insert(name.clone(), instance_id.clone());
        self.nodes.push(NodeInfo {
            name,
            kubelet_version: version.to_string(),
            provider_id: Some(format!("aws:///eu-west-1a/{}", instance_id)),
            ready_conditions: vec!["True".to_string()],
        });
    }

    fn remove_instance(&mut self, instance_id: &str) {
        self.group_mut().instances.retain(|i| i != instance_id);
        let node_name = self
            .instance_of
            .iter()
            .find(|(_, id)| id.as_str() == instance_id)
            .map(|(name, _)| name.clone());
        if let Some(name) = node_name {
            self.instance_of.remove(&name);
            self.nodes.retain(|n| n.name != name);
        }
    }

    fn resize(&mut self, desired: i32) {
        self.group_mut().desired_capacity = desired;
        while self.group_mut().instances.len() < desired as usize {
            self.launch(NEW_VERSION);
        }
        while self.group_mut().instances.len() > desired as usize {
            let last = self.group_mut().instances.last().cloned().unwrap();
            self.remove_instance(&last);
        }
    }
}

/// Shared fake Auto Scaling group plus cluster.
#[derive(Clone)]
pub struct FakeCloud {
    world: Arc<Mutex<World>>,
}

impl FakeCloud {
    /// A group named `workers` with `desired` Ready nodes on `old_version`.
    pub fn new(desired: i32, max_size: i32, old_version: &str) -> Self {
        let mut world = World {
            group: Some(AutoScalingGroup {
                name: "workers".to_string(),
                name_tag: Some("eks_cluster-worker_group_default-eks_asg".to_string()),
                min_size: 1,
                max_size,
                desired_capacity: desired,
                instances: Vec::new(),
            }),
            autoscaler_replicas: 1,
            ..Default::default()
        };
        for _ in 0..desired {
            world.launch(&format!("{}-eks-48e63af", old_version));
        }
        Self {
            world: Arc::new(Mutex::new(world)),
        }
    }

    fn with_world<R>(&self, f: impl FnOnce(&mut World) -> R) -> R {
        f(&mut self.world.lock().unwrap())
    }

    /// The next `reads` group reads report one instance fewer than desired.
    pub fn lag_reads(&self, reads: usize) {
        self.with_world(|w| w.lagging_reads = reads);
    }

    /// The next `reads` node listings report the first node NotReady.
    pub fn set_not_ready_reads(&self, reads: usize) {
        self.with_world(|w| w.not_ready_reads = reads);
    }

    pub fn fail_drains(&self, count: usize) {
        self.with_world(|w| w.failing_drains = count);
    }

    /// The next `checks` pod health checks report a pending pod.
    pub fn unhealthy_pod_checks(&self, checks: usize) {
        self.with_world(|w| w.unhealthy_pod_checks = checks);
    }

    /// Old nodes keep showing up in the next `reads` version-filtered listings.
    pub fn linger_old_nodes(&self, reads: usize) {
        self.with_world(|w| w.resurrect_old_nodes = reads);
    }

    pub fn set_autoscaler_replicas(&self, replicas: i32) {
        self.with_world(|w| w.autoscaler_replicas = replicas);
    }

    /// Override the live max size, as a hand edit would.
    pub fn group(&self) -> AutoScalingGroup {
        self.with_world(|w| w.group.clone().expect("fake group"))
    }

    pub fn nodes_snapshot(&self) -> Vec<NodeInfo> {
        self.with_world(|w| w.nodes.clone())
    }

    pub fn node_count(&self) -> usize {
        self.with_world(|w| w.nodes.len())
    }

    pub fn autoscaler(&self) -> i32 {
        self.with_world(|w| w.autoscaler_replicas)
    }

    pub fn health_checks(&self) -> usize {
        self.with_world(|w| w.health_checks)
    }

    pub fn taint_count(&self, node: &str) -> usize {
        self.with_world(|w| w.taints.get(node).map_or(0, Vec::len))
    }

    pub fn events(&self) -> Vec<String> {
        self.with_world(|w| w.events.clone())
    }
}

#[async_trait]
impl CapacityProvider for FakeCloud {
    async fn describe_group(&self, filter: &str) -> Result<AutoScalingGroup> {
        self.with_world(|w| -> Result<AutoScalingGroup> {
            let group = w.group.clone().expect("fake group");
            let mut selected = crate::asg::select_single(vec![group], filter)?;
            if w.lagging_reads > 0 {
                w.lagging_reads -= 1;
                selected.instances.pop();
            }
            Ok(selected)
        })
    }

    async fn set_max_size(&self, _group: &str, max_size: i32) -> Result<()> {
        self.with_world(|w| -> Result<()> {
            w.events.push(format!("set-max {}", max_size));
            w.group_mut().max_size = max_size;
            if w.group_mut().desired_capacity > max_size {
                w.resize(max_size);
            }
            Ok(())
        })
    }

    async fn set_desired_capacity(&self, _group: &str, desired_capacity: i32) -> Result<()> {
        self.with_world(|w| -> Result<()> {
            w.events.push(format!("set-desired {}", desired_capacity));
            if desired_capacity > w.group_mut().max_size {
                anyhow::bail!(
                    "ValidationError: New SetDesiredCapacity value {} is above max value {}",
                    desired_capacity,
                    w.group_mut().max_size
                );
            }
            w.resize(desired_capacity);
            Ok(())
        })
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.with_world(|w| -> Result<()> {
            if !w.group_mut().instances.iter().any(|i| i == instance_id) {
                return Err(KrollError::InstanceNotFound(instance_id.to_string()).into());
            }
            w.events.push(format!("terminate {}", instance_id));
            w.remove_instance(instance_id);
            w.group_mut().desired_capacity -= 1;
            Ok(())
        })
    }
}

#[async_trait]
impl Cluster for FakeCloud {
    async fn nodes(&self, version_prefix: Option<&str>) -> Result<Vec<NodeInfo>> {
        self.with_world(|w| -> Result<Vec<NodeInfo>> {
            let mut nodes = w.nodes.clone();
            if w.not_ready_reads > 0 {
                w.not_ready_reads -= 1;
                if let Some(first) = nodes.first_mut() {
                    first.ready_conditions = vec!["False".to_string()];
                }
            }
            Ok(match version_prefix {
                Some(prefix) => {
                    let mut old = crate::k8s::nodes::filter_by_version(nodes, prefix);
                    if old.is_empty() && w.resurrect_old_nodes > 0 {
                        w.resurrect_old_nodes -= 1;
                        old.push(NodeInfo {
                            name: "straggler".to_string(),
                            kubelet_version: format!("{}99", prefix),
                            provider_id: None,
                            ready_conditions: vec!["True".to_string()],
                        });
                    }
                    old
                }
                None => nodes,
            })
        })
    }

    async fn taint(&self, node: &str) -> Result<()> {
        self.with_world(|w| -> Result<()> {
            w.events.push(format!("taint {}", node));
            let existing = w.taints.remove(node).unwrap_or_default();
            w.taints.insert(node.to_string(), with_upgrade_taint(existing));
            Ok(())
        })
    }

    async fn drain(&self, node: &str) -> Result<()> {
        self.with_world(|w| -> Result<()> {
            if w.failing_drains > 0 {
                w.failing_drains -= 1;
                anyhow::bail!("Cannot evict pod as it would violate the pod's disruption budget");
            }
            w.events.push(format!("drain {}", node));
            Ok(())
        })
    }

    async fn autoscaler_replicas(&self) -> Result<i32> {
        Ok(self.autoscaler())
    }

    async fn scale_autoscaler(&self, replicas: i32) -> Result<()> {
        self.with_world(|w| -> Result<()> {
            w.events.push(format!("autoscaler {}", replicas));
            w.autoscaler_replicas = replicas;
            Ok(())
        })
    }

    async fn pods_not_running(&self) -> Result<Vec<String>> {
        self.with_world(|w| -> Result<Vec<String>> {
            w.health_checks += 1;
            w.events.push("health".to_string());
            if w.unhealthy_pod_checks > 0 {
                w.unhealthy_pod_checks -= 1;
                return Ok(vec!["app/web-6f7c (Pending)".to_string()]);
            }
            Ok(Vec::new())
        })
    }
}

/// Fixed key/value infra source.
pub struct StaticInfra(pub HashMap<String, String>);

impl StaticInfra {
    pub fn max_size(value: &str) -> Self {
        Self(HashMap::from([(
            crate::infra::ASG_MAX_SIZE_KEY.to_string(),
            value.to_string(),
        )]))
    }
}

#[async_trait]
impl InfraSource for StaticInfra {
    async fn lookup(&self, key: &str) -> Result<String> {
        self.0.get(key).cloned().ok_or_else(|| {
            KrollError::InfraKeyNotFound {
                key: key.to_string(),
                source_name: "static".to_string(),
            }
            .into()
        })
    }
}
