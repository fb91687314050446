//! Kubernetes client bound to a kubeconfig context.

use anyhow::Result;
use tracing::debug;

use crate::error::KrollError;

/// Build a Kubernetes client from kubeconfig.
///
/// Switching context is how the session targets a cluster: the named context
/// is used when given, otherwise the current one.
pub async fn build_client(context: Option<&str>) -> Result<kube::Client> {
    let config = match context {
        Some(ctx) => {
            debug!("Using k8s context: {}", ctx);
            let kubeconfig = kube::config::Kubeconfig::read()
                .map_err(|e| KrollError::Kubeconfig(e.to_string()))?;
            kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions {
                    context: Some(ctx.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| KrollError::Kubeconfig(format!("context '{}': {}", ctx, e)))?
        }
        None => {
            debug!("Using current kubeconfig context");
            kube::Config::infer()
                .await
                .map_err(|e| KrollError::Kubeconfig(e.to_string()))?
        }
    };

    let client = kube::Client::try_from(config)
        .map_err(|e| KrollError::Kubeconfig(e.to_string()))?;

    Ok(client)
}

/// Name of the context the session talks to, for display.
pub fn context_name(context: Option<&str>) -> String {
    if let Some(ctx) = context {
        return ctx.to_string();
    }

    kube::config::Kubeconfig::read()
        .ok()
        .and_then(|kc| kc.current_context)
        .unwrap_or_else(|| "unknown".to_string())
}
