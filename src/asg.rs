//! Auto Scaling group capacity provider.

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_autoscaling::Client as AsgClient;
use tracing::{debug, info};

use crate::error::KrollError;

/// Snapshot of one Auto Scaling group read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoScalingGroup {
    pub name: String,
    pub name_tag: Option<String>,
    pub min_size: i32,
    pub max_size: i32,
    pub desired_capacity: i32,
    pub instances: Vec<String>,
}

impl AutoScalingGroup {
    /// A read is only trusted once the instance count equals the desired capacity.
    pub fn ensure_stable(&self) -> Result<()> {
        if self.instances.len() != self.desired_capacity.max(0) as usize {
            return Err(KrollError::UnstableGroup {
                group: self.name.clone(),
                instances: self.instances.len(),
                desired: self.desired_capacity,
            }
            .into());
        }
        Ok(())
    }

    fn matches(&self, filter: &str) -> bool {
        self.name.contains(filter)
            || self
                .name_tag
                .as_deref()
                .is_some_and(|tag| tag.contains(filter))
    }
}

/// Pick the single group matching `filter` by name or `Name` tag.
pub fn select_single(groups: Vec<AutoScalingGroup>, filter: &str) -> Result<AutoScalingGroup> {
    let mut matching: Vec<AutoScalingGroup> =
        groups.into_iter().filter(|g| g.matches(filter)).collect();

    match matching.len() {
        0 => Err(KrollError::GroupNotFound(filter.to_string()).into()),
        1 => Ok(matching.remove(0)),
        count => Err(KrollError::AmbiguousGroup {
            filter: filter.to_string(),
            count,
            names: matching
                .iter()
                .map(|g| g.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        }
        .into()),
    }
}

/// Cloud capacity operations the upgrade needs.
#[async_trait]
pub trait CapacityProvider: Send + Sync {
    /// Describe the one group matching `filter`. Zero or several matches is fatal.
    async fn describe_group(&self, filter: &str) -> Result<AutoScalingGroup>;

    async fn set_max_size(&self, group: &str, max_size: i32) -> Result<()>;

    async fn set_desired_capacity(&self, group: &str, desired_capacity: i32) -> Result<()>;

    /// Terminate an instance and decrement the group's desired capacity.
    /// A missing instance yields [`KrollError::InstanceNotFound`].
    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;
}

/// [`CapacityProvider`] backed by the AWS Auto Scaling API.
#[derive(Clone)]
pub struct AwsCapacityProvider {
    client: AsgClient,
    region: String,
}

impl AwsCapacityProvider {
    /// Create a client with the given AWS configuration.
    pub async fn new(profile: Option<&str>, region: Option<&str>) -> Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(profile) = profile {
            debug!("Using AWS profile: {}", profile);
            config_loader = config_loader.profile_name(profile);
        }

        if let Some(region) = region {
            debug!("Using AWS region: {}", region);
            config_loader = config_loader.region(aws_config::Region::new(region.to_string()));
        }

        let config = config_loader.load().await;
        let region = config
            .region()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            client: AsgClient::new(&config),
            region,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    async fn list_groups(&self) -> Result<Vec<AutoScalingGroup>> {
        let mut groups = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request = self.client.describe_auto_scaling_groups();
            if let Some(token) = next_token.take() {
                request = request.next_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| KrollError::aws(module_path!(), e))?;

            for asg in response.auto_scaling_groups() {
                let name_tag = asg
                    .tags()
                    .iter()
                    .find(|t| t.key() == Some("Name"))
                    .and_then(|t| t.value())
                    .map(|s| s.to_string());

                groups.push(AutoScalingGroup {
                    name: asg.auto_scaling_group_name().unwrap_or_default().to_string(),
                    name_tag,
                    min_size: asg.min_size().unwrap_or(0),
                    max_size: asg.max_size().unwrap_or(0),
                    desired_capacity: asg.desired_capacity().unwrap_or(0),
                    instances: asg
                        .instances()
                        .iter()
                        .filter_map(|i| i.instance_id().map(|s| s.to_string()))
                        .collect(),
                });
            }

            next_token = response.next_token().map(|s| s.to_string());
            if next_token.is_none() {
                break;
            }
        }

        debug!("Found {} auto scaling groups in {}", groups.len(), self.region);
        Ok(groups)
    }
}

#[async_trait]
impl CapacityProvider for AwsCapacityProvider {
    async fn describe_group(&self, filter: &str) -> Result<AutoScalingGroup> {
        let group = select_single(self.list_groups().await?, filter)?;
        debug!(
            "ASG {} | MaxSize: {} | DesiredCapacity: {} | Instances: {}",
            group.name,
            group.max_size,
            group.desired_capacity,
            group.instances.len()
        );
        Ok(group)
    }

    async fn set_max_size(&self, group: &str, max_size: i32) -> Result<()> {
        info!("Setting max size of {} to {}", group, max_size);
        self.client
            .update_auto_scaling_group()
            .auto_scaling_group_name(group)
            .max_size(max_size)
            .send()
            .await
            .map_err(|e| KrollError::aws(module_path!(), e))?;
        Ok(())
    }

    async fn set_desired_capacity(&self, group: &str, desired_capacity: i32) -> Result<()> {
        info!("Setting desired capacity of {} to {}", group, desired_capacity);
        self.client
            .set_desired_capacity()
            .auto_scaling_group_name(group)
            .desired_capacity(desired_capacity)
            .send()
            .await
            .map_err(|e| KrollError::aws(module_path!(), e))?;
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        let result = self
            .client
            .terminate_instance_in_auto_scaling_group()
            .instance_id(instance_id)
            .should_decrement_desired_capacity(true)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = KrollError::aws(module_path!(), e);
                if let KrollError::AwsSdk(_, ref details) = err
                    && is_missing_instance_message(details)
                {
                    return Err(KrollError::InstanceNotFound(instance_id.to_string()).into());
                }
                Err(err.into())
            }
        }
    }
}

/// Auto Scaling reports an already removed instance as a validation error
/// ("Instance Id not found - No managed instance found for instance ID ...").
fn is_missing_instance_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("not found") || lower.contains("no managed instance")
}
