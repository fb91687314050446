//! CLI configuration and argument parsing.

use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;

use crate::k8s::AutoscalerRef;
use crate::k8s::nodes::kubelet_version_prefix;
use crate::retry::DEFAULT_MAX_DEPTH;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Rolling worker node replacement for EKS cluster upgrades.
///
/// Scales the worker Auto Scaling group out, taints, drains and terminates
/// every node still on the old kubelet version, then restores the original
/// capacity. Unresolved states stop at an interactive checkpoint.
#[derive(Parser, Debug, Clone)]
#[command(name = "kroll")]
#[command(about = "Rolling worker node replacement for EKS cluster upgrades")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    /// Auto Scaling group name or Name tag substring (e.g., worker_group_default)
    #[arg(short, long, env = "KROLL_GROUP")]
    pub group: String,

    /// Kubernetes version the nodes to retire are running (e.g., 1.22)
    #[arg(short = 'o', long)]
    pub old_version: String,

    /// Kubeconfig context of the target cluster (default: current context)
    #[arg(short, long)]
    pub context: Option<String>,

    /// AWS region
    #[arg(short, long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// AWS profile to use
    #[arg(short, long, env = "AWS_PROFILE")]
    pub profile: Option<String>,

    /// Cluster autoscaler deployment name
    #[arg(long, default_value = "aws-cluster-autoscaler")]
    pub autoscaler_deployment: String,

    /// Cluster autoscaler namespace
    #[arg(long, default_value = "kube-system")]
    pub autoscaler_namespace: String,

    /// HCL file path or URL declaring asg_max_size, used when the autoscaler is already disabled
    #[arg(long, env = "KROLL_INFRA_SOURCE")]
    pub infra_source: Option<String>,

    /// Bearer token for a remote infra source
    #[arg(long, env = "GH_TOKEN", hide_env_values = true)]
    pub infra_token: Option<String>,

    /// Backoff retries before asking the operator
    #[arg(long, default_value_t = DEFAULT_MAX_DEPTH)]
    pub max_retries: u32,

    /// Seconds to wait for a node to drain
    #[arg(long, default_value = "300")]
    pub drain_timeout: u64,

    /// Show the plan without changing anything
    #[arg(long, default_value = "false")]
    pub dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "KROLL_LOG_LEVEL")]
    pub log_level: String,
}

/// Application configuration derived from CLI args.
#[derive(Debug, Clone)]
pub struct Config {
    pub group: String,
    pub version_prefix: String,
    pub context: Option<String>,
    pub region: Option<String>,
    pub profile: Option<String>,
    pub autoscaler: AutoscalerRef,
    pub infra_source: Option<String>,
    pub infra_token: Option<SecretString>,
    pub max_retries: u32,
    pub drain_timeout: Duration,
    pub dry_run: bool,
    pub log_level: String,
}

impl Config {
    /// Create config from CLI arguments.
    pub fn from_args(args: Args) -> Self {
        Self {
            group: args.group,
            version_prefix: kubelet_version_prefix(&args.old_version),
            context: args.context,
            region: args.region,
            profile: args.profile,
            autoscaler: AutoscalerRef {
                namespace: args.autoscaler_namespace,
                deployment: args.autoscaler_deployment,
            },
            infra_source: args.infra_source.filter(|s| !s.trim().is_empty()),
            infra_token: args
                .infra_token
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            max_retries: args.max_retries,
            drain_timeout: Duration::from_secs(args.drain_timeout),
            dry_run: args.dry_run,
            log_level: args.log_level,
        }
    }
}
