//! Custom error types for kroll.

use thiserror::Error;

/// Errors that can occur during a node upgrade session.
#[derive(Error, Debug)]
pub enum KrollError {
    #[error("[{0}] {1}")]
    AwsSdk(String, String),

    #[error("[{0}] AWS credentials rejected, refresh them and check again: {1}")]
    AwsCredentials(String, String),

    #[error("No auto scaling group matches '{0}'")]
    GroupNotFound(String),

    #[error("Expected exactly 1 auto scaling group matching '{filter}', found {count}: {names}")]
    AmbiguousGroup {
        filter: String,
        count: usize,
        names: String,
    },

    #[error("Number of instances ({instances}) is not the desired capacity ({desired}) of {group}")]
    UnstableGroup {
        group: String,
        instances: usize,
        desired: i32,
    },

    #[error("Could not establish a baseline: {0}")]
    UnstableBaseline(String),

    #[error("Scale-out of desired capacity {desired} overflows the group size limit")]
    CapacityOverflow { desired: i32 },

    #[error("Number of nodes ({nodes}) does not match the ASG desired capacity ({desired})")]
    NodeCountMismatch { nodes: usize, desired: i32 },

    #[error("Number of nodes ({nodes}) does not match the number of READY status ({ready})")]
    NodesNotReady { nodes: usize, ready: usize },

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Node {0} has no EC2 provider ID")]
    MissingProviderId(String),

    #[error("Timeout waiting for {operation}: {details}")]
    Timeout { operation: String, details: String },

    #[error("Autoscaler is disabled and no --infra-source was given to recover the original max size")]
    InfraSourceMissing,

    #[error("Key '{key}' not found in {source_name}")]
    InfraKeyNotFound { key: String, source_name: String },

    #[error("Infra source error: {0}")]
    InfraSource(String),

    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("Aborted by operator")]
    Aborted,
}

impl KrollError {
    /// Configuration errors mean the target environment does not match
    /// assumptions. They are never retried nor escalated to a checkpoint.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KrollError::GroupNotFound(_)
                | KrollError::AmbiguousGroup { .. }
                | KrollError::UnstableBaseline(_)
                | KrollError::CapacityOverflow { .. }
                | KrollError::InfraSourceMissing
                | KrollError::InfraKeyNotFound { .. }
                | KrollError::Kubeconfig(_)
        )
    }

    /// Reduce an AWS SDK error to the service message.
    ///
    /// Rejected credentials get their own variant: the session can usually
    /// continue with a Recheck once the operator refreshes them.
    pub fn aws<E: std::fmt::Debug + std::fmt::Display>(component: &str, err: E) -> Self {
        let debug = format!("{:?}", err);
        let message = service_message(&debug).unwrap_or_else(|| err.to_string());
        let haystack = format!("{} {}", message, debug).to_lowercase();

        if CREDENTIAL_MARKERS
            .iter()
            .any(|marker| haystack.contains(marker))
        {
            KrollError::AwsCredentials(component.to_string(), message)
        } else {
            KrollError::AwsSdk(component.to_string(), message)
        }
    }
}

/// The `message` field of a service error, as printed by its `Debug` impl.
fn service_message(debug: &str) -> Option<String> {
    let (_, rest) = debug.split_once("message: Some(\"")?;
    let (message, _) = rest.split_once('"')?;
    Some(message.to_string())
}

const CREDENTIAL_MARKERS: &[&str] = &[
    "expiredtoken",
    "expired token",
    "security token included in the request is",
    "invalidclienttokenid",
    "no credentials",
];

/// Returns true when an error chain carries a fatal [`KrollError`].
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<KrollError>()
        .is_some_and(KrollError::is_fatal)
}

/// Returns true when an error chain carries [`KrollError::Aborted`].
pub fn is_aborted(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<KrollError>(), Some(KrollError::Aborted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_unstable_group() {
        let err = KrollError::UnstableGroup {
            group: "workers".to_string(),
            instances: 4,
            desired: 6,
        };
        assert_eq!(
            err.to_string(),
            "Number of instances (4) is not the desired capacity (6) of workers"
        );
    }

    #[test]
    fn test_error_display_ambiguous_group() {
        let err = KrollError::AmbiguousGroup {
            filter: "worker".to_string(),
            count: 2,
            names: "a, b".to_string(),
        };
        assert!(err.to_string().contains("found 2: a, b"));
    }

    #[test]
    fn test_configuration_errors_are_fatal() {
        assert!(KrollError::GroupNotFound("x".to_string()).is_fatal());
        assert!(KrollError::InfraSourceMissing.is_fatal());
        assert!(KrollError::UnstableBaseline("x".to_string()).is_fatal());
    }

    #[test]
    fn test_transient_errors_are_not_fatal() {
        assert!(!KrollError::NodeCountMismatch { nodes: 1, desired: 2 }.is_fatal());
        assert!(!KrollError::InstanceNotFound("i-1".to_string()).is_fatal());
        assert!(!KrollError::Aborted.is_fatal());
    }

    #[test]
    fn test_is_fatal_through_anyhow() {
        let err: anyhow::Error = KrollError::GroupNotFound("workers".to_string()).into();
        assert!(is_fatal(&err));

        let err = anyhow::anyhow!("throttled");
        assert!(!is_fatal(&err));
    }

    #[test]
    fn test_is_aborted_through_context() {
        let err = anyhow::Error::from(KrollError::Aborted).context("draining node-a");
        assert!(is_aborted(&err));
    }

    #[test]
    fn test_error_aws_helper_generic() {
        let err = KrollError::aws("asg", "connection failed");
        assert!(matches!(err, KrollError::AwsSdk(_, _)));
        assert!(err.to_string().contains("[asg]"));
    }

    #[test]
    fn test_error_aws_credentials_expired() {
        let err = KrollError::aws(
            "asg",
            "The security token included in the request is expired",
        );
        assert!(matches!(err, KrollError::AwsCredentials(_, _)));
    }

    struct ServiceFailure;

    impl std::fmt::Debug for ServiceFailure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(
                r#"ServiceError(ServiceError { source: ResourceContention(Error { message: Some("You already have a pending update"), code: Some("ResourceContention") }) })"#,
            )
        }
    }

    impl std::fmt::Display for ServiceFailure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("service error")
        }
    }

    #[test]
    fn test_error_aws_service_message_extracted() {
        let err = KrollError::aws("asg", ServiceFailure);
        assert!(matches!(err, KrollError::AwsSdk(_, _)));
        assert_eq!(err.to_string(), "[asg] You already have a pending update");
    }

    #[test]
    fn test_capacity_overflow_is_fatal() {
        assert!(KrollError::CapacityOverflow { desired: i32::MAX }.is_fatal());
    }
}
