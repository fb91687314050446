//! kroll - rolling worker node replacement for EKS cluster upgrades.
//!
//! Replaces every worker node still on the old kubelet version:
//! - Scale the Auto Scaling group out with the cluster autoscaler paused
//! - Taint, drain and terminate the old nodes
//! - Restore the original capacity and resume the autoscaler

mod asg;
mod checkpoint;
mod config;
mod error;
mod infra;
mod k8s;
mod output;
mod retry;
#[cfg(test)]
mod testing;
mod upgrade;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tracing::{debug, error, info, warn};

use asg::AwsCapacityProvider;
use checkpoint::{InterruptiblePause, SkipSignal, TerminalCheckpoint};
use config::{Args, Config};
use error::is_aborted;
use infra::{HclSource, InfraSource};
use k8s::KubeCluster;
use retry::RetryExecutor;
use upgrade::orchestrator::{NodeUpgradeOrchestrator, Phase, UpgradeOptions};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = Config::from_args(args);

    // Initialize logging
    if let Err(e) = init_tracing(&config.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    debug!("Starting kroll {}", config::VERSION);

    match run(&config).await {
        Ok(phase) => debug!("Session ended in phase {:?}", phase),
        Err(e) if is_aborted(&e) => {
            warn!("{}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

/// Main application logic.
async fn run(config: &Config) -> Result<Phase> {
    let provider =
        AwsCapacityProvider::new(config.profile.as_deref(), config.region.as_deref()).await?;
    let client = k8s::client::build_client(config.context.as_deref()).await?;
    let cluster = KubeCluster::new(client, config.autoscaler.clone(), config.drain_timeout);

    println!(
        "{} {} (context: {}, region: {})",
        "Upgrading nodes on".bold(),
        config.version_prefix,
        k8s::client::context_name(config.context.as_deref()),
        provider.region()
    );

    let infra = config
        .infra_source
        .as_deref()
        .map(|location| HclSource::new(location, config.infra_token.clone()));

    let signal = SkipSignal::install();
    let retry = RetryExecutor::new(
        config.max_retries,
        Arc::new(InterruptiblePause::new(signal)),
        Arc::new(TerminalCheckpoint),
    );

    let options = UpgradeOptions {
        group_filter: config.group.clone(),
        version_prefix: config.version_prefix.clone(),
        dry_run: config.dry_run,
    };

    let mut orchestrator = NodeUpgradeOrchestrator::new(
        &provider,
        &cluster,
        infra.as_ref().map(|s| s as &dyn InfraSource),
        &retry,
        options,
    );

    let result = orchestrator.run().await;
    let phase = match result {
        Ok(phase) => phase,
        Err(e) => {
            debug!("Last phase reached: {}", orchestrator.phase().title());
            return Err(e);
        }
    };
    info!("Session finished: {}", phase.title());
    Ok(phase)
}

/// Initialize tracing subscriber.
fn init_tracing(log_level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {}", e))?;

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
